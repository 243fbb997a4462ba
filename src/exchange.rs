//! In-flight outbound exchanges: retransmission, ACK matching,
//! separate-response re-keying, timeouts.
//!
//! A confirmable message lives under its message id until the peer
//! acknowledges it. An empty ACK promises a separate response later,
//! at which point the exchange is re-keyed under its token and put on
//! a plain deadline; non-confirmable requests start out that way.

use core::fmt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use embedded_time::Instant;

use crate::config::Config;
use crate::error::Error;
use crate::msg::{Id, Message, Token, Type};
use crate::net::Addrd;
use crate::promise::Promise;
use crate::retry::{RetryTimer, YouShould};
use crate::service::Service;
use crate::time::{millis_between, Clock};

/// How urgently an outbound message needs to go out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
  /// Subject to the in-flight cap
  Normal,
  /// A block-wise continuation; exempt from the cap so a transfer
  /// that was admitted can always run to completion
  Block,
}

/// An outbound message plus its scheduling class
#[derive(Debug, Clone)]
pub struct Outgoing {
  /// The message and where it goes
  pub msg: Addrd<Message>,
  /// See [`Priority`]
  pub priority: Priority,
}

impl Outgoing {
  /// An ordinary outbound message
  pub fn new(msg: Addrd<Message>) -> Self {
    Self { msg,
           priority: Priority::Normal }
  }

  /// A block-wise continuation
  pub fn block(msg: Addrd<Message>) -> Self {
    Self { msg,
           priority: Priority::Block }
  }
}

/// How a live exchange is found when the peer talks back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
  /// Unacknowledged CON; ACK and RST reference the message id
  ById(Id, SocketAddr),
  /// Awaiting a (separate) response, which references the token
  ByToken(Token, SocketAddr),
}

enum Reliability<C: Clock> {
  Unacked(RetryTimer<C>),
  AwaitingSeparate { since: Instant<C> },
}

struct Exchange<C: Clock> {
  msg: Addrd<Message>,
  reliability: Reliability<C>,
  promise: Promise<Addrd<Message>>,
}

type Live<C> = Arc<Mutex<HashMap<Key, Exchange<C>>>>;

/// The registry of everything we have sent and not heard back about.
///
/// Promises are always completed after the registry lock is released,
/// so completion callbacks are free to call back in.
pub struct Exchanges<C: Clock> {
  cfg: Config,
  live: Live<C>,
}

impl<C: Clock> fmt::Debug for Exchanges<C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Exchanges").field("len", &self.len()).finish()
  }
}

impl<C: Clock> Exchanges<C> {
  /// Create an empty registry
  pub fn new(cfg: Config) -> Self {
    Self { cfg,
           live: Arc::new(Mutex::new(HashMap::new())) }
  }

  /// How many exchanges are live
  pub fn len(&self) -> usize {
    self.live.lock().expect("exchange lock poisoned").len()
  }

  /// Is the registry empty?
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Drop the entry under `key` when `promise` resolves, but only if
  /// the entry still belongs to that promise; the key may have been
  /// reused by a later exchange.
  fn attach_cleanup(live: &Live<C>, key: Key, promise: &Promise<Addrd<Message>>)
    where C: Send + Sync + 'static
  {
    let live = Arc::clone(live);
    let handle = promise.clone();
    promise.on_complete(move |_| {
             let mut live = live.lock().expect("exchange lock poisoned");
             let ours = live.get(&key)
                            .map(|exchange| exchange.promise.ptr_eq(&handle))
                            .unwrap_or(false);
             if ours {
               live.remove(&key);
             }
           });
  }

  /// Register an outbound message that awaits a reply.
  ///
  /// `Priority::Normal` registrations fail fast with
  /// [`Error::TooManyInFlight`] once [`Config::max_in_flight`] is
  /// reached. Cancelling the returned promise removes the entry.
  ///
  /// # Panics
  ///
  /// Two live exchanges under one key means the id/token provisioner
  /// broke its uniqueness contract; that is a caller bug, not a
  /// runtime condition, and it panics.
  pub fn register(&self,
                  out: &Outgoing,
                  now: Instant<C>)
                  -> Result<Promise<Addrd<Message>>, Error>
    where C: Send + Sync + 'static
  {
    let mut live = self.live.lock().expect("exchange lock poisoned");

    if out.priority == Priority::Normal && live.len() >= self.cfg.max_in_flight {
      return Err(Error::TooManyInFlight);
    }

    let (key, reliability) = match out.msg.data().ty {
      | Type::Con => {
        (Key::ById(out.msg.data().id, out.msg.addr()),
         Reliability::Unacked(RetryTimer::new(now,
                                              self.cfg.msg.con.retry_strategy,
                                              self.cfg.msg.con.max_attempts)))
      },
      | _ => {
        (Key::ByToken(out.msg.data().token, out.msg.addr()),
         Reliability::AwaitingSeparate { since: now })
      },
    };

    assert!(!live.contains_key(&key),
            "exchange already live under {:?}",
            key);

    let promise = Promise::new();
    live.insert(key,
                Exchange { msg: out.msg.clone(),
                           reliability,
                           promise: promise.clone() });
    drop(live);

    Self::attach_cleanup(&self.live, key, &promise);
    Ok(promise)
  }

  /// An ACK arrived.
  ///
  /// A piggybacked response resolves the exchange outright; an empty
  /// ACK re-keys it under the request token to await the separate
  /// response on the delayed deadline. Returns whether any exchange
  /// claimed the ACK.
  pub fn handle_ack(&self, ack: &Addrd<Message>, now: Instant<C>) -> bool
    where C: Send + Sync + 'static
  {
    let key = Key::ById(ack.data().id, ack.addr());
    let mut live = self.live.lock().expect("exchange lock poisoned");

    let Some(exchange) = live.remove(&key) else {
      return false;
    };

    if ack.data().is_response() {
      let complete = if ack.data().token == exchange.msg.data().token {
        Ok(ack.clone())
      } else {
        Err(Error::Protocol("piggybacked response token mismatch"))
      };
      drop(live);
      exchange.promise.complete(complete);
      return true;
    }

    if !exchange.msg.data().is_request() {
      // an acked notification or separate response; nothing more is
      // coming, the ACK itself is the conclusion
      drop(live);
      exchange.promise.fulfill(ack.clone());
      return true;
    }

    log::trace!(target: "croak",
                "exchange: {:?} promised a separate response",
                ack.data().id);

    let token_key = Key::ByToken(exchange.msg.data().token, ack.addr());
    let promise = exchange.promise.clone();
    let displaced = live.insert(token_key,
                                Exchange { msg: exchange.msg,
                                           reliability: Reliability::AwaitingSeparate { since: now },
                                           promise: exchange.promise });
    drop(live);

    if let Some(displaced) = displaced {
      log::warn!(target: "croak",
                 "exchange: token reused while {:?} was still live",
                 token_key);
      displaced.promise
               .fail(Error::Protocol("token reused by a newer exchange"));
    }

    Self::attach_cleanup(&self.live, token_key, &promise);
    true
  }

  /// An RST arrived; the referenced exchange fails with
  /// [`Error::Reset`]. Returns whether any exchange claimed it.
  pub fn handle_reset(&self, rst: &Addrd<Message>) -> bool
    where C: Send + Sync + 'static
  {
    let mut live = self.live.lock().expect("exchange lock poisoned");

    let key = Key::ById(rst.data().id, rst.addr());
    let exchange = match live.remove(&key) {
      | Some(exchange) => Some(exchange),
      // NON exchanges live under their token, but an RST still
      // references the message id we sent
      | None => {
        let token_key = live.iter()
                            .find(|(key, exchange)| {
                              matches!(key, Key::ByToken(_, peer)
                                       if *peer == rst.addr())
                              && exchange.msg.data().id == rst.data().id
                            })
                            .map(|(key, _)| *key);
        token_key.and_then(|key| live.remove(&key))
      },
    };

    drop(live);
    match exchange {
      | Some(exchange) => {
        exchange.promise.fail(Error::Reset);
        true
      },
      | None => false,
    }
  }

  /// A separate response arrived; resolve the exchange holding its
  /// token. Returns whether any exchange claimed it.
  pub fn handle_separate(&self, resp: &Addrd<Message>) -> bool
    where C: Send + Sync + 'static
  {
    let key = Key::ByToken(resp.data().token, resp.addr());
    let exchange = self.live
                       .lock()
                       .expect("exchange lock poisoned")
                       .remove(&key);

    match exchange {
      | Some(exchange) => {
        exchange.promise.fulfill(resp.clone());
        true
      },
      | None => false,
    }
  }

  /// Advance every timer: returns the messages due for
  /// retransmission and fails exchanges whose budget or deadline ran
  /// out with [`Error::Timeout`].
  pub fn tick(&self, now: Instant<C>) -> Vec<Addrd<Message>>
    where C: Send + Sync + 'static
  {
    let mut resends = Vec::new();
    let mut timed_out = Vec::new();
    let delayed_timeout = self.cfg.msg.non.delayed_response_timeout;

    let mut live = self.live.lock().expect("exchange lock poisoned");
    live.retain(|key, exchange| match exchange.reliability {
          | Reliability::Unacked(ref mut timer) => match timer.what_should_i_do(now) {
            | Err(nb::Error::WouldBlock) => true,
            | Ok(YouShould::Retry) => {
              log::trace!(target: "croak", "exchange: retransmitting {:?}", key);
              resends.push(exchange.msg.clone());
              true
            },
            | Ok(YouShould::Cry) => {
              timed_out.push(exchange.promise.clone());
              false
            },
          },
          | Reliability::AwaitingSeparate { since } => {
            if millis_between(since, now) >= delayed_timeout {
              timed_out.push(exchange.promise.clone());
              false
            } else {
              true
            }
          },
        });
    drop(live);

    for promise in timed_out {
      promise.fail(Error::Timeout);
    }

    resends
  }

  /// Fail every exchange with `peer`
  pub fn fail_peer(&self, peer: SocketAddr, error: Error)
    where C: Send + Sync + 'static
  {
    let mut live = self.live.lock().expect("exchange lock poisoned");
    let keys = live.keys()
                   .filter(|key| match key {
                     | Key::ById(_, addr) | Key::ByToken(_, addr) => *addr == peer,
                   })
                   .copied()
                   .collect::<Vec<_>>();
    let dropped = keys.into_iter()
                      .filter_map(|key| live.remove(&key))
                      .collect::<Vec<_>>();
    drop(live);

    for exchange in dropped {
      exchange.promise.fail(error.clone());
    }
  }

  /// Fail every live exchange; used at shutdown
  pub fn fail_all(&self, error: Error)
    where C: Send + Sync + 'static
  {
    let dropped = {
      let mut live = self.live.lock().expect("exchange lock poisoned");
      live.drain().map(|(_, exchange)| exchange).collect::<Vec<_>>()
    };

    for exchange in dropped {
      exchange.promise.fail(error.clone());
    }
  }
}

/// The terminal outbound stage: assign an id, register, then put it
/// on the wire.
pub struct ExchangeSend<C: Clock> {
  exchanges: Arc<Exchanges<C>>,
  clock: Arc<C>,
  ids: Arc<dyn crate::provision::ProvisionIds>,
  transmit: Arc<dyn Fn(&Addrd<Message>) -> Result<(), Error> + Send + Sync>,
}

impl<C: Clock> fmt::Debug for ExchangeSend<C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ExchangeSend")
     .field("exchanges", &self.exchanges)
     .finish()
  }
}

impl<C: Clock> ExchangeSend<C> {
  /// Build the stage from the shared registry, an id source, and a
  /// transmit function
  pub fn new(exchanges: Arc<Exchanges<C>>,
             clock: Arc<C>,
             ids: Arc<dyn crate::provision::ProvisionIds>,
             transmit: Arc<dyn Fn(&Addrd<Message>) -> Result<(), Error> + Send + Sync>)
             -> Self {
    Self { exchanges,
           clock,
           ids,
           transmit }
  }
}

impl<C: Clock + Send + Sync + 'static> Service<Outgoing, Addrd<Message>> for ExchangeSend<C> {
  fn apply(&self, out: Outgoing) -> Promise<Addrd<Message>> {
    let mut out = out;
    if out.msg.data().id == Id::UNSET {
      out.msg.data_mut().id = self.ids.next_id(out.msg.addr());
    }

    let now = match self.clock.try_now() {
      | Ok(now) => now,
      | Err(_) => return Promise::resolved(Err(Error::Clock)),
    };

    // fire-and-forget: a NON that is not a request awaits nothing
    if out.msg.data().ty == Type::Non && !out.msg.data().is_request() {
      return match (self.transmit)(&out.msg) {
        | Ok(()) => Promise::resolved(Ok(out.msg)),
        | Err(e) => Promise::resolved(Err(e)),
      };
    }

    let promise = match self.exchanges.register(&out, now) {
      | Ok(promise) => promise,
      | Err(e) => return Promise::resolved(Err(e)),
    };

    if let Err(e) = (self.transmit)(&out.msg) {
      // the cleanup hook attached at registration drops the entry
      promise.fail(e);
    }

    promise
  }
}
