//! Deduplication of inbound requests by message id.
//!
//! A datagram peer that retransmits a CON it never got our ACK for
//! must get the same response again, and the handler must not run
//! twice. The cache remembers every `(message id, peer)` it has seen
//! for a detection window, along with the response once one exists, so
//! retransmissions are answered from memory.

use core::fmt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use embedded_time::Instant;

use crate::config;
use crate::msg::{Id, Message};
use crate::net::Addrd;
use crate::promise::Promise;
use crate::service::{Service, SharedService};
use crate::time::{millis_between, Clock, Stamped};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
  id: Id,
  peer: SocketAddr,
}

#[derive(Debug, Clone)]
enum Slot {
  /// The first copy is still being handled
  Pending,
  /// The response we already gave
  Responded(Message),
}

/// What [`DedupCache::check_and_reserve`] found
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
  /// Never seen (within the window); a reservation now exists and the
  /// caller is on the hook to handle the message
  New,
  /// A copy is being handled right now; drop this one silently
  InFlight,
  /// We already responded; replay this verbatim
  Replay(Message),
}

struct CacheState<C: Clock> {
  entries: HashMap<Key, Stamped<C, Slot>>,
  last_sweep: Instant<C>,
  last_warn: Option<Instant<C>>,
}

/// The id-keyed duplicate detection cache
pub struct DedupCache<C: Clock> {
  cfg: config::Dedup,
  state: Mutex<CacheState<C>>,
}

impl<C: Clock> fmt::Debug for DedupCache<C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DedupCache")
     .field("cfg", &self.cfg)
     .field("len", &self.len())
     .finish()
  }
}

impl<C: Clock> DedupCache<C> {
  /// Create an empty cache
  pub fn new(cfg: config::Dedup) -> Self {
    Self { cfg,
           state: Mutex::new(CacheState { entries: HashMap::new(),
                                          last_sweep: Instant::new(0),
                                          last_warn: None }) }
  }

  /// How many ids are currently remembered
  pub fn len(&self) -> usize {
    self.state.lock().expect("dedup lock poisoned").entries.len()
  }

  /// Look `(id, peer)` up and reserve it if it is new.
  ///
  /// The reservation is what makes "exactly one handler invocation"
  /// hold when duplicates arrive back to back; the first caller to get
  /// [`CheckOutcome::New`] owns handling the message.
  pub fn check_and_reserve(&self, id: Id, peer: SocketAddr, now: Instant<C>) -> CheckOutcome {
    let key = Key { id, peer };
    let mut state = self.state.lock().expect("dedup lock poisoned");

    if let Some(entry) = state.entries.get(&key) {
      if !entry.expired(now, self.cfg.detection_window) {
        return match entry.data() {
          | Slot::Pending => CheckOutcome::InFlight,
          | Slot::Responded(resp) => CheckOutcome::Replay(resp.clone()),
        };
      }
    }

    state.entries.insert(key, Stamped(Slot::Pending, now));

    if state.entries.len() > self.cfg.max_entries {
      self.evict_oldest(&mut state, now);
    }

    CheckOutcome::New
  }

  /// Remember the response given to `(id, peer)` so retransmissions
  /// can replay it.
  pub fn store_response(&self, id: Id, peer: SocketAddr, resp: &Message) {
    let key = Key { id, peer };
    let mut state = self.state.lock().expect("dedup lock poisoned");
    if let Some(entry) = state.entries.get_mut(&key) {
      *entry.data_mut() = Slot::Responded(resp.clone());
    }
  }

  /// Drop entries older than the detection window.
  ///
  /// Rate-limited internally; safe to call on every engine tick.
  pub fn sweep(&self, now: Instant<C>) {
    let mut state = self.state.lock().expect("dedup lock poisoned");

    if millis_between(state.last_sweep, now) < self.cfg.sweep_interval
       && state.last_sweep != Instant::new(0)
    {
      return;
    }
    state.last_sweep = now;

    let window = self.cfg.detection_window;
    let before = state.entries.len();
    state.entries.retain(|_, entry| !entry.expired(now, window));

    let dropped = before - state.entries.len();
    if dropped > 0 {
      log::trace!(target: "croak", "dedup: swept {} expired ids", dropped);
    }
  }

  /// Oldest-first bulk eviction down to capacity minus a 1% margin, so
  /// a flood doesn't trigger an eviction per message.
  fn evict_oldest(&self, state: &mut CacheState<C>, now: Instant<C>) {
    let margin = (self.cfg.max_entries / 100).max(1);
    let target = self.cfg.max_entries.saturating_sub(margin);

    let mut by_age = state.entries
                          .iter()
                          .map(|(key, entry)| (*key, entry.time()))
                          .collect::<Vec<_>>();
    by_age.sort_by_key(|(_, time)| *time);

    let excess = state.entries.len().saturating_sub(target);
    for (key, _) in by_age.into_iter().take(excess) {
      state.entries.remove(&key);
    }

    let warn_due = match state.last_warn {
      | None => true,
      | Some(last) => millis_between(last, now) >= self.cfg.warn_interval,
    };
    if warn_due {
      state.last_warn = Some(now);
      log::warn!(target: "croak",
                 "dedup: over {} remembered ids, evicted {} oldest; duplicates may slip through",
                 self.cfg.max_entries,
                 excess);
    }
  }
}

/// The inbound pipeline stage wrapping a handler with deduplication.
///
/// Stream transports have no meaningful message id and should not be
/// given this stage at all; [`crate::core::Core`] only installs it for
/// datagram transports.
pub struct Dedup<C: Clock> {
  cache: Arc<DedupCache<C>>,
  clock: Arc<C>,
  inner: SharedService<Addrd<Message>, Option<Addrd<Message>>>,
}

impl<C: Clock> fmt::Debug for Dedup<C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Dedup").field("cache", &self.cache).finish()
  }
}

impl<C: Clock> Dedup<C> {
  /// Wrap `inner` with duplicate detection
  pub fn new(cache: Arc<DedupCache<C>>,
             clock: Arc<C>,
             inner: SharedService<Addrd<Message>, Option<Addrd<Message>>>)
             -> Self {
    Self { cache, clock, inner }
  }
}

impl<C: Clock + Send + Sync + 'static> Service<Addrd<Message>, Option<Addrd<Message>>> for Dedup<C> {
  fn apply(&self, req: Addrd<Message>) -> Promise<Option<Addrd<Message>>> {
    let now = match self.clock.try_now() {
      | Ok(now) => now,
      // a broken clock should degrade to "no dedup", not drop traffic
      | Err(_) => return self.inner.apply(req),
    };

    let (id, peer) = (req.data().id, req.addr());

    match self.cache.check_and_reserve(id, peer, now) {
      | CheckOutcome::New => {
        let out = Promise::new();
        let cache = Arc::clone(&self.cache);
        let chained = out.clone();
        self.inner.apply(req).on_complete(move |result| {
                             if let Ok(Some(ref resp)) = result {
                               cache.store_response(id, peer, resp.data());
                             }
                             chained.complete(result);
                           });
        out
      },
      | CheckOutcome::InFlight => {
        log::debug!(target: "croak",
                    "dedup: {:?} from {} still in flight, dropping duplicate",
                    id,
                    peer);
        Promise::resolved(Ok(None))
      },
      | CheckOutcome::Replay(resp) => {
        log::debug!(target: "croak",
                    "dedup: replaying response for {:?} from {}",
                    id,
                    peer);
        Promise::resolved(Ok(Some(Addrd(resp, peer))))
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;
  use crate::config::Dedup as DedupConfig;
  use crate::msg::{code, Message, Token, Type};
  use crate::service::service_fn;
  use crate::test::{self, ClockMock};
  use crate::time::Milliseconds;

  fn cfg() -> DedupConfig {
    DedupConfig { detection_window: Milliseconds(30_000),
                  max_entries: 100,
                  sweep_interval: Milliseconds(0),
                  warn_interval: Milliseconds(60_000) }
  }

  #[test]
  fn duplicates_reach_the_handler_once() {
    let clock = Arc::new(ClockMock::new());
    let cache = Arc::new(DedupCache::new(cfg()));
    let handled = Arc::new(AtomicUsize::new(0));

    let h = Arc::clone(&handled);
    let inner = service_fn(move |req: Addrd<Message>| {
      h.fetch_add(1, Ordering::SeqCst);
      Promise::resolved(Ok(Some(req.map(|m| m.response(code::CONTENT)))))
    });

    let stage = Dedup::new(cache, clock, inner);
    let req = Addrd(test::con_get(1, &[1], "frogs"), test::addr(1));

    let mut responses = 0;
    for _ in 0..5 {
      if let Some(Ok(Some(_))) = stage.apply(req.clone()).try_get() {
        responses += 1;
      }
    }

    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(responses, 5);
  }

  #[test]
  fn in_flight_duplicates_drop_silently() {
    let cache = DedupCache::<ClockMock>::new(cfg());
    let peer = test::addr(1);
    let now = ClockMock::instant(0);

    assert_eq!(cache.check_and_reserve(Id(9), peer, now), CheckOutcome::New);
    assert_eq!(cache.check_and_reserve(Id(9), peer, now),
               CheckOutcome::InFlight);

    // same id from another peer is a different message
    assert_eq!(cache.check_and_reserve(Id(9), test::addr(2), now),
               CheckOutcome::New);
  }

  #[test]
  fn expired_ids_are_new_again() {
    let cache = DedupCache::<ClockMock>::new(cfg());
    let peer = test::addr(1);

    assert_eq!(cache.check_and_reserve(Id(9), peer, ClockMock::instant(0)),
               CheckOutcome::New);

    cache.sweep(ClockMock::instant(31_000));
    assert_eq!(cache.len(), 0);

    assert_eq!(cache.check_and_reserve(Id(9), peer, ClockMock::instant(31_000)),
               CheckOutcome::New);
  }

  #[test]
  fn replay_returns_the_stored_response() {
    let cache = DedupCache::<ClockMock>::new(cfg());
    let peer = test::addr(1);
    let now = ClockMock::instant(0);

    cache.check_and_reserve(Id(4), peer, now);

    let resp = Message::new(Type::Ack, code::CONTENT, Id(4), Token::opaque(&[1]));
    cache.store_response(Id(4), peer, &resp);

    assert_eq!(cache.check_and_reserve(Id(4), peer, now),
               CheckOutcome::Replay(resp));
  }

  #[test]
  fn overflow_bulk_evicts_oldest() {
    let cache = DedupCache::<ClockMock>::new(cfg());
    let peer = test::addr(1);

    for n in 0..=100u64 {
      cache.check_and_reserve(Id(n as u16 + 1), peer, ClockMock::instant(n));
    }

    // 101 inserts into a 100-entry cache: oldest evicted down to 99
    assert_eq!(cache.len(), 99);
    assert_eq!(cache.check_and_reserve(Id(1), peer, ClockMock::instant(200)),
               CheckOutcome::New);
  }
}
