//! A small cancellable completion cell.
//!
//! Every asynchronous edge in the engine (responses, separate
//! responses, observe deliveries) resolves a [`Promise`]. Promises are
//! runtime-agnostic; consumers either block on [`Promise::wait`] or
//! chain work with [`Promise::on_complete`].

use core::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::Error;

type Callback<T> = Box<dyn FnOnce(Result<T, Error>) + Send>;

enum State<T> {
  Pending(Vec<Callback<T>>),
  Done(Result<T, Error>),
}

struct Inner<T> {
  state: Mutex<State<T>>,
  done: Condvar,
}

/// The write-once result of an in-flight exchange.
///
/// Cloning is shallow; all clones resolve together. The first
/// completion wins, later ones are ignored. Cancelling is just
/// completing with [`Error::Cancelled`], which lets whoever registered
/// the exchange clean up through the same path as any other failure.
pub struct Promise<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
  fn clone(&self) -> Self {
    Self { inner: Arc::clone(&self.inner) }
  }
}

impl<T> fmt::Debug for Promise<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = match *self.inner.state.lock().expect("promise lock poisoned") {
      | State::Pending(_) => "Pending",
      | State::Done(Ok(_)) => "Fulfilled",
      | State::Done(Err(_)) => "Failed",
    };
    write!(f, "Promise({})", state)
  }
}

impl<T> Default for Promise<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Promise<T> {
  /// A promise nobody has resolved yet
  pub fn new() -> Self {
    Self { inner: Arc::new(Inner { state: Mutex::new(State::Pending(Vec::new())),
                                   done: Condvar::new() }) }
  }

  /// A promise born resolved
  pub fn resolved(result: Result<T, Error>) -> Self {
    Self { inner: Arc::new(Inner { state: Mutex::new(State::Done(result)),
                                   done: Condvar::new() }) }
  }

  /// Has this promise been completed (successfully or not)?
  pub fn is_resolved(&self) -> bool {
    matches!(*self.inner.state.lock().expect("promise lock poisoned"),
             State::Done(_))
  }

  /// Was this promise cancelled?
  pub fn is_cancelled(&self) -> bool {
    matches!(*self.inner.state.lock().expect("promise lock poisoned"),
             State::Done(Err(Error::Cancelled)))
  }

  /// Do these two handles resolve together?
  pub fn ptr_eq(&self, other: &Promise<T>) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }
}

impl<T: Clone + Send + 'static> Promise<T> {
  /// Resolve the promise.
  ///
  /// Returns whether this call was the one that resolved it.
  /// Callbacks run on the completing thread, outside the promise's
  /// own lock.
  pub fn complete(&self, result: Result<T, Error>) -> bool {
    let callbacks = {
      let mut state = self.inner.state.lock().expect("promise lock poisoned");
      match *state {
        | State::Done(_) => return false,
        | State::Pending(ref mut callbacks) => {
          let callbacks = core::mem::take(callbacks);
          *state = State::Done(result.clone());
          callbacks
        },
      }
    };

    self.inner.done.notify_all();
    for callback in callbacks {
      callback(result.clone());
    }

    true
  }

  /// Resolve successfully
  pub fn fulfill(&self, value: T) -> bool {
    self.complete(Ok(value))
  }

  /// Resolve exceptionally
  pub fn fail(&self, error: Error) -> bool {
    self.complete(Err(error))
  }

  /// Resolve with [`Error::Cancelled`]
  pub fn cancel(&self) -> bool {
    self.complete(Err(Error::Cancelled))
  }

  /// Run `f` with the result once there is one.
  ///
  /// Runs immediately (on the calling thread) if the promise already
  /// resolved.
  pub fn on_complete(&self, f: impl FnOnce(Result<T, Error>) + Send + 'static) {
    let ready = {
      let mut state = self.inner.state.lock().expect("promise lock poisoned");
      match *state {
        | State::Done(ref result) => Some((f, result.clone())),
        | State::Pending(ref mut callbacks) => {
          callbacks.push(Box::new(f));
          None
        },
      }
    };

    if let Some((f, result)) = ready {
      f(result);
    }
  }

  /// Resolve `other` whenever this promise resolves
  pub fn forward_to(&self, other: Promise<T>) {
    self.on_complete(move |result| {
          other.complete(result);
        });
  }

  /// The result, if there is one yet
  pub fn try_get(&self) -> Option<Result<T, Error>> {
    match *self.inner.state.lock().expect("promise lock poisoned") {
      | State::Done(ref result) => Some(result.clone()),
      | State::Pending(_) => None,
    }
  }

  /// Block the calling thread until the promise resolves
  pub fn wait(&self) -> Result<T, Error> {
    let mut state = self.inner.state.lock().expect("promise lock poisoned");
    loop {
      match *state {
        | State::Done(ref result) => return result.clone(),
        | State::Pending(_) => {
          state = self.inner
                      .done
                      .wait(state)
                      .expect("promise lock poisoned");
        },
      }
    }
  }

  /// Block until the promise resolves or `timeout` elapses
  pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, Error>> {
    let mut state = self.inner.state.lock().expect("promise lock poisoned");
    loop {
      match *state {
        | State::Done(ref result) => return Some(result.clone()),
        | State::Pending(_) => {
          let (next, waited) = self.inner
                                   .done
                                   .wait_timeout(state, timeout)
                                   .expect("promise lock poisoned");
          state = next;
          if waited.timed_out() {
            return match *state {
              | State::Done(ref result) => Some(result.clone()),
              | State::Pending(_) => None,
            };
          }
        },
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  use super::*;

  #[test]
  fn first_completion_wins() {
    let promise = Promise::new();
    assert!(promise.fulfill(1u32));
    assert!(!promise.fulfill(2));
    assert!(!promise.cancel());
    assert_eq!(promise.try_get(), Some(Ok(1)));
  }

  #[test]
  fn callbacks_run_once_resolved() {
    let promise = Promise::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = Arc::clone(&hits);
    promise.on_complete(move |result| {
             assert_eq!(result, Ok(7u32));
             h.fetch_add(1, Ordering::SeqCst);
           });
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    promise.fulfill(7);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // late registration fires immediately
    let h = Arc::clone(&hits);
    promise.on_complete(move |_| {
             h.fetch_add(1, Ordering::SeqCst);
           });
    assert_eq!(hits.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn cancellation_is_observable() {
    let promise = Promise::<u32>::new();
    assert!(!promise.is_cancelled());
    promise.cancel();
    assert!(promise.is_cancelled());
    assert_eq!(promise.try_get(), Some(Err(Error::Cancelled)));
  }

  #[test]
  fn forwarding_chains() {
    let a = Promise::new();
    let b = Promise::new();
    a.forward_to(b.clone());
    a.fulfill("ok");
    assert_eq!(b.try_get(), Some(Ok("ok")));
  }

  #[test]
  fn wait_timeout_expires() {
    let promise = Promise::<u32>::new();
    assert_eq!(promise.wait_timeout(Duration::from_millis(10)), None);

    promise.fulfill(3);
    assert_eq!(promise.wait_timeout(Duration::from_millis(10)), Some(Ok(3)));
  }
}
