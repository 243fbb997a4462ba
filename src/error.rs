use core::fmt;

/// Everything that can go wrong while driving a message exchange.
///
/// Errors are cheap to clone because they travel through promise
/// completions that may have several observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
  /// A confirmable message went unacknowledged for every attempt
  /// allowed by [`crate::config::Con::max_attempts`], or a promised
  /// separate response never arrived.
  Timeout,
  /// The exchange was cancelled locally before it resolved.
  Cancelled,
  /// The remote answered our message with RST.
  Reset,
  /// The connection carrying this exchange went away.
  ConnectionClosed,
  /// [`crate::config::Config::max_in_flight`] exchanges are already
  /// live and this one was not a block-wise continuation.
  TooManyInFlight,
  /// A payload (ours or theirs) is larger than the transfer limit.
  EntityTooLarge {
    /// The limit that was exceeded, in bytes.
    max: usize,
  },
  /// A block-wise transfer ended before all blocks arrived.
  IncompleteEntity,
  /// The remote violated the protocol in a way we can name.
  Protocol(&'static str),
  /// The transport failed to move bytes.
  Transport(String),
  /// The clock refused to tell us the time.
  Clock,
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      | Error::Timeout => f.write_str("exchange timed out"),
      | Error::Cancelled => f.write_str("exchange cancelled"),
      | Error::Reset => f.write_str("peer sent RST"),
      | Error::ConnectionClosed => f.write_str("connection closed"),
      | Error::TooManyInFlight => f.write_str("too many in-flight exchanges"),
      | Error::EntityTooLarge { max } => {
        write!(f, "entity larger than the {} byte limit", max)
      },
      | Error::IncompleteEntity => f.write_str("block-wise entity incomplete"),
      | Error::Protocol(what) => write!(f, "protocol violation: {}", what),
      | Error::Transport(what) => write!(f, "transport error: {}", what),
      | Error::Clock => f.write_str("clock error"),
    }
  }
}

impl std::error::Error for Error {}
