//! Runtime behavior that the engine allows embedders to customize

use crate::csm::Capabilities;
use crate::retry::{Attempts, Strategy};
use crate::time::{Millis, Milliseconds};

/// Configuration for the engine.
///
/// The default values match RFC 7252's transmission parameters where
/// one exists, and the original engine's defaults everywhere else.
///
/// ```
/// use croak::config::Config;
///
/// let config = Config::default();
/// assert_eq!(config.max_in_flight, 16);
/// assert_eq!(config.msg.non.delayed_response_timeout.0, 120_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
  /// See [`Msg`]
  pub msg: Msg,
  /// See [`Dedup`]
  pub dedup: Dedup,
  /// See [`Block`]
  pub block: Block,
  /// Capabilities assumed for datagram peers (which never send CSM),
  /// and announced to stream peers on connect.
  ///
  /// Default: 1152-byte messages, block-wise transfer enabled.
  pub capabilities: Capabilities,
  /// How many outbound exchanges may be awaiting a response at once
  /// before [`crate::core::Core::send`] starts failing fast with
  /// [`crate::error::Error::TooManyInFlight`]. Block-wise
  /// continuations are exempt so a transfer can always finish.
  ///
  /// Default: 16
  pub max_in_flight: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self { msg: Msg::default(),
           dedup: Dedup::default(),
           block: Block::default(),
           capabilities: Capabilities { max_message_size: 1152,
                                        block_transfer: true },
           max_in_flight: 16 }
  }
}

impl Config {
  /// How long a request/response exchange could possibly stay alive.
  ///
  /// The worst-case CON retransmission span plus RFC 7252's
  /// `2 * MAX_LATENCY + PROCESSING_DELAY` allowance. Used to expire
  /// half-finished block-wise assemblies.
  pub fn exchange_lifetime_millis(&self) -> Millis {
    let retrans_span = self.msg
                           .con
                           .retry_strategy
                           .max_time(self.msg.con.max_attempts);
    Milliseconds(retrans_span.0 + 202_000)
  }
}

/// Message-layer reliability settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Msg {
  /// See [`Con`]
  pub con: Con,
  /// See [`Non`]
  pub non: Non,
}

impl Default for Msg {
  fn default() -> Self {
    Self { con: Con::default(),
           non: Non::default() }
  }
}

/// Confirmable message settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Con {
  /// Backoff between retransmissions of an unacknowledged CON.
  ///
  /// Default: exponential starting between 500 and 1000 ms, per
  /// RFC 7252's `ACK_TIMEOUT * ACK_RANDOM_FACTOR` guidance scaled for
  /// LAN use.
  pub retry_strategy: Strategy,
  /// Total transmissions of a CON before the exchange fails with
  /// [`crate::error::Error::Timeout`].
  ///
  /// Default: 4
  pub max_attempts: Attempts,
}

impl Default for Con {
  fn default() -> Self {
    Self { retry_strategy: Strategy::Exponential { init_min: Milliseconds(500),
                                                   init_max: Milliseconds(1000) },
           max_attempts: Attempts(4) }
  }
}

/// Non-confirmable message settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Non {
  /// How long to wait for the response to a NON request, or for the
  /// separate response promised by an empty ACK.
  ///
  /// This is a plain deadline, not a retransmission schedule; NON
  /// requests and acknowledged CONs are never resent.
  ///
  /// Default: 120 seconds
  pub delayed_response_timeout: Millis,
}

impl Default for Non {
  fn default() -> Self {
    Self { delayed_response_timeout: Milliseconds(120_000) }
  }
}

/// Duplicate detection settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dedup {
  /// How long a message id stays remembered after first sight.
  ///
  /// Default: 30 seconds
  pub detection_window: Millis,
  /// How many ids may be remembered at once. Exceeding this bulk
  /// evicts the oldest entries, trading duplicate detection for
  /// bounded memory.
  ///
  /// Default: 10,000
  pub max_entries: usize,
  /// How often expired ids are swept out.
  ///
  /// Default: 10 seconds
  pub sweep_interval: Millis,
  /// Overflow is logged at `warn` at most once per this interval.
  ///
  /// Default: 5 minutes
  pub warn_interval: Millis,
}

impl Default for Dedup {
  fn default() -> Self {
    Self { detection_window: Milliseconds(30_000),
           max_entries: 10_000,
           sweep_interval: Milliseconds(10_000),
           warn_interval: Milliseconds(300_000) }
  }
}

/// Block-wise transfer settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Block {
  /// Largest entity (in bytes) the engine will assemble or accumulate
  /// across blocks, in either direction.
  ///
  /// Default: 1 MiB
  pub max_transfer_size: usize,
}

impl Default for Block {
  fn default() -> Self {
    Self { max_transfer_size: 1_048_576 }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exchange_lifetime_covers_retransmission_span() {
    let config = Config::default();
    // 1000 + 2000 + 4000 + 8000 worst-case waits, plus latency allowance
    assert_eq!(config.exchange_lifetime_millis().0, 15_000 + 202_000);
  }
}
