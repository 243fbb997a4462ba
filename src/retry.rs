use core::convert::Infallible;
use core::fmt;

use embedded_time::Instant;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::time::{millis_between, Clock, Millis, Milliseconds};

/// A number of transmissions, counting the initial one
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attempts(pub u16);

impl Default for Attempts {
  fn default() -> Self {
    Self(4)
  }
}

/// How long to wait between transmission attempts.
///
/// The concrete delay is drawn once per timer from the configured
/// range, so exchanges started at nearly the same instant do not
/// retransmit in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Wait a base delay after the first transmission, then double the
  /// wait after every subsequent one.
  Exponential {
    /// Smallest allowed base delay
    init_min: Millis,
    /// Largest allowed base delay
    init_max: Millis,
  },
  /// Wait the same delay between every transmission.
  Delay {
    /// Smallest allowed delay
    min: Millis,
    /// Largest allowed delay
    max: Millis,
  },
}

impl Strategy {
  fn base(&self, seed: u64) -> Millis {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    match *self {
      | Strategy::Exponential { init_min, init_max } => {
        Milliseconds(rng.gen_range(init_min.0..=init_max.0))
      },
      | Strategy::Delay { min, max } => Milliseconds(rng.gen_range(min.0..=max.0)),
    }
  }

  /// The wait after transmission number `attempt` (1-based), given the
  /// base delay drawn for this timer.
  fn delay_after(&self, base: Millis, attempt: u16) -> Millis {
    match self {
      | Strategy::Exponential { .. } => {
        let doublings = u32::from(attempt.saturating_sub(1)).min(16);
        Milliseconds(base.0.saturating_mul(1u64 << doublings))
      },
      | Strategy::Delay { .. } => base,
    }
  }

  /// Worst-case total time a timer with this strategy can spend before
  /// giving up.
  pub fn max_time(&self, attempts: Attempts) -> Millis {
    match *self {
      | Strategy::Exponential { init_max, .. } => {
        let factor = (1u64 << u32::from(attempts.0).min(16)) - 1;
        Milliseconds(init_max.0.saturating_mul(factor))
      },
      | Strategy::Delay { max, .. } => Milliseconds(max.0.saturating_mul(u64::from(attempts.0))),
    }
  }
}

/// What the holder of a [`RetryTimer`] should do right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YouShould {
  /// Send the message again
  Retry,
  /// Give up; the attempt budget is spent
  Cry,
}

/// Tracks the retransmission deadline for one in-flight message.
///
/// The initial transmission happens when the timer is created; every
/// poll after that either waits, fires a retransmission, or declares
/// the budget spent.
pub struct RetryTimer<C: Clock> {
  next: Instant<C>,
  base: Millis,
  strategy: Strategy,
  attempts: u16,
  max_attempts: Attempts,
}

impl<C: Clock> fmt::Debug for RetryTimer<C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RetryTimer")
     .field("base", &self.base)
     .field("strategy", &self.strategy)
     .field("attempts", &self.attempts)
     .field("max_attempts", &self.max_attempts)
     .finish()
  }
}

impl<C: Clock> Clone for RetryTimer<C> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<C: Clock> Copy for RetryTimer<C> {}

impl<C: Clock> RetryTimer<C> {
  /// Create a timer for a message first transmitted at `start`
  pub fn new(start: Instant<C>, strategy: Strategy, max_attempts: Attempts) -> Self {
    let seed = millis_between(Instant::new(0), start).0;
    let base = strategy.base(seed);

    Self { next: start.checked_add(base).unwrap_or(start),
           base,
           strategy,
           attempts: 1,
           max_attempts }
  }

  /// Poll the timer.
  ///
  /// `WouldBlock` until the current deadline passes; then `Retry`
  /// (advancing the deadline) while attempts remain, `Cry` after.
  pub fn what_should_i_do(&mut self, now: Instant<C>) -> nb::Result<YouShould, Infallible> {
    if now < self.next {
      return Err(nb::Error::WouldBlock);
    }

    if self.attempts >= self.max_attempts.0 {
      return Ok(YouShould::Cry);
    }

    self.attempts += 1;
    let delay = self.strategy.delay_after(self.base, self.attempts);
    self.next = now.checked_add(delay).unwrap_or(now);
    Ok(YouShould::Retry)
  }
}
