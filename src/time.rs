use embedded_time::Instant;

pub use embedded_time::duration::Milliseconds;

/// A duration, in milliseconds
pub type Millis = Milliseconds<u64>;

/// Supertrait of [`embedded_time::Clock`] pinning the
/// type of "ticks" to u64
pub trait Clock: embedded_time::Clock<T = u64> {}
impl<C: embedded_time::Clock<T = u64>> Clock for C {}

/// Milliseconds elapsed between two instants, saturating at zero when
/// `later` is not actually later.
pub fn millis_between<C: Clock>(earlier: Instant<C>, later: Instant<C>) -> Millis {
  if later < earlier {
    return Milliseconds(0);
  }

  later.checked_duration_since(&earlier)
       .and_then(|generic| Millis::try_from(generic).ok())
       .unwrap_or(Milliseconds(0))
}

/// Data associated with a timestamp
#[derive(Debug)]
pub struct Stamped<C: Clock, T>(pub T, pub Instant<C>);

impl<C: Clock, T: Clone> Clone for Stamped<C, T> {
  fn clone(&self) -> Self {
    Self(self.0.clone(), self.1)
  }
}

impl<C: Clock, T: Copy> Copy for Stamped<C, T> {}

impl<C: Clock, T> Stamped<C, T> {
  /// Borrow the data
  pub fn data(&self) -> &T {
    &self.0
  }

  /// Mutably borrow the data
  pub fn data_mut(&mut self) -> &mut T {
    &mut self.0
  }

  /// Copy the timestamp
  pub fn time(&self) -> Instant<C> {
    self.1
  }

  /// Discard the timestamp
  pub fn discard_timestamp(self) -> T {
    self.0
  }

  /// Has `window` elapsed between the timestamp and `now`?
  pub fn expired(&self, now: Instant<C>, window: Millis) -> bool {
    millis_between(self.1, now) >= window
  }
}
