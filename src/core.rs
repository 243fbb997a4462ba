//! The dispatcher: owns the component registries, composes the
//! pipelines, and classifies inbound traffic.
//!
//! The embedder owns the read loop and the timer: feed every decoded
//! message to [`Core::on_receive`] and call [`Core::tick`] at a
//! steady cadence (tens of milliseconds is plenty). Both are expected
//! to be driven from one thread; the promises handed out may be
//! waited on or chained from anywhere.

use core::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use embedded_time::Instant;

use crate::block::{BlockRecv, BlockSend};
use crate::config::Config;
use crate::csm::CsmStore;
use crate::dedup::{Dedup, DedupCache};
use crate::error::Error;
use crate::exchange::{ExchangeSend, Exchanges, Outgoing};
use crate::msg::{code, Id, Message, Token, Type};
use crate::net::{Addrd, Transport};
use crate::observe::Observations;
use crate::promise::Promise;
use crate::provision::{ProvisionIds, ProvisionTokens, Seeded};
use crate::service::SharedService;
use crate::time::{millis_between, Clock};

/// A live client-side observation
#[derive(Debug)]
pub struct Observation {
  /// The token the relation lives under
  pub token: Token,
  /// Resolves with the registration response
  pub registration: Promise<Addrd<Message>>,
  /// Resolves with the first notification; re-arm with
  /// [`Core::next_notification`]
  pub next: Promise<Addrd<Message>>,
}

/// The message-exchange engine.
///
/// Wires the duplicate cache, transaction registry, block-wise
/// stages, observation registry and CSM store around a transport and
/// an application handler.
pub struct Core<C: Clock, T: Transport> {
  cfg: Config,
  clock: Arc<C>,
  transport: Arc<T>,
  ids: Arc<dyn ProvisionIds>,
  tokens: Arc<dyn ProvisionTokens>,
  exchanges: Arc<Exchanges<C>>,
  dedup: Arc<DedupCache<C>>,
  observations: Arc<Observations>,
  csm: Arc<CsmStore>,
  block_recv: Arc<BlockRecv<C>>,
  inbound: SharedService<Addrd<Message>, Option<Addrd<Message>>>,
  outbound: SharedService<Outgoing, Addrd<Message>>,
}

impl<C: Clock, T: Transport> fmt::Debug for Core<C, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Core")
     .field("cfg", &self.cfg)
     .field("exchanges", &self.exchanges)
     .field("dedup", &self.dedup)
     .field("observations", &self.observations)
     .finish()
  }
}

impl<C, T> Core<C, T>
  where C: Clock + Send + Sync + 'static,
        T: Transport + 'static
{
  /// Build an engine with the default (ChaCha8-seeded) id and token
  /// provisioners.
  pub fn new(cfg: Config,
             clock: C,
             transport: T,
             handler: SharedService<Addrd<Message>, Option<Addrd<Message>>>)
             -> Self {
    let seed = clock.try_now()
                    .ok()
                    .map(|now| millis_between(Instant::new(0), now).0)
                    .unwrap_or(0);
    let seeded = Arc::new(Seeded::new(seed));
    Self::with_provisioners(cfg, clock, transport, handler, seeded.clone(), seeded)
  }

  /// Build an engine with injected id and token sources.
  pub fn with_provisioners(cfg: Config,
                           clock: C,
                           transport: T,
                           handler: SharedService<Addrd<Message>, Option<Addrd<Message>>>,
                           ids: Arc<dyn ProvisionIds>,
                           tokens: Arc<dyn ProvisionTokens>)
                           -> Self {
    let clock = Arc::new(clock);
    let transport = Arc::new(transport);
    let csm = Arc::new(CsmStore::new(cfg.capabilities));
    let exchanges = Arc::new(Exchanges::new(cfg));
    let dedup = Arc::new(DedupCache::new(cfg.dedup));
    let observations = Arc::new(Observations::new(Arc::clone(&tokens)));

    let transmit: Arc<dyn Fn(&Addrd<Message>) -> Result<(), Error> + Send + Sync> = {
      let transport = Arc::clone(&transport);
      Arc::new(move |msg: &Addrd<Message>| transport.transmit(msg))
    };

    let exchange_send: SharedService<Outgoing, Addrd<Message>> =
      Arc::new(ExchangeSend::new(Arc::clone(&exchanges),
                                 Arc::clone(&clock),
                                 Arc::clone(&ids),
                                 transmit));

    let outbound: SharedService<Outgoing, Addrd<Message>> =
      Arc::new(BlockSend::new(cfg.block, Arc::clone(&csm), exchange_send));

    let block_recv = Arc::new(BlockRecv::new(cfg.block,
                                             cfg.exchange_lifetime_millis(),
                                             Arc::clone(&csm),
                                             Arc::clone(&clock),
                                             handler));

    // stream transports have no message-id semantics worth
    // deduplicating on
    let inbound: SharedService<Addrd<Message>, Option<Addrd<Message>>> =
      if transport.is_connection_oriented() {
        Arc::clone(&block_recv) as SharedService<Addrd<Message>, Option<Addrd<Message>>>
      } else {
        Arc::new(Dedup::new(Arc::clone(&dedup),
                            Arc::clone(&clock),
                            Arc::clone(&block_recv)
                            as SharedService<Addrd<Message>, Option<Addrd<Message>>>))
      };

    Self { cfg,
           clock,
           transport,
           ids,
           tokens,
           exchanges,
           dedup,
           observations,
           csm,
           block_recv,
           inbound,
           outbound }
  }

  /// Assign an id if the message still has the placeholder, then put
  /// it on the wire. Transmit failures of fire-and-forget replies are
  /// logged, not propagated; there is nobody to propagate them to.
  fn reply(&self, mut msg: Addrd<Message>) {
    if msg.data().id == Id::UNSET && msg.data().ty != Type::Ack {
      msg.data_mut().id = self.ids.next_id(msg.addr());
    }

    if let Err(e) = self.transport.transmit(&msg) {
      log::warn!(target: "croak", "transmit to {} failed: {}", msg.addr(), e);
    }
  }

  /// Send a request.
  ///
  /// An empty token and an unset id are filled in from the
  /// provisioners. The promise resolves with the (reassembled)
  /// response, or fails with the error that ended the exchange.
  pub fn send(&self, msg: Addrd<Message>) -> Promise<Addrd<Message>> {
    let mut msg = msg;
    if msg.data().is_request() && msg.data().token.is_empty() {
      msg.data_mut().token = self.tokens.next_token();
    }

    self.outbound.apply(Outgoing::new(msg))
  }

  /// Register an observation of `path` on `peer` and send the
  /// observe-register GET.
  ///
  /// Each notification resolves one promise; call
  /// [`Core::next_notification`] after every delivery to keep
  /// observing.
  pub fn observe(&self, peer: SocketAddr, path: &str) -> Observation {
    let token = self.tokens.next_token();
    let next = self.observations.subscribe(token, path);

    let mut register = Message::new(Type::Con, code::GET, Id::UNSET, token);
    register.opts.uri_path = path.to_string();
    register.opts.observe = Some(0);

    let registration = self.outbound.apply(Outgoing::new(Addrd(register, peer)));

    Observation { token,
                  registration,
                  next }
  }

  /// Re-arm an observation for its next notification
  pub fn next_notification(&self, token: Token, path: &str) -> Promise<Addrd<Message>> {
    self.observations.subscribe(token, path)
  }

  /// Drop the relation under `token` and tell `peer` with an
  /// observe-deregister GET.
  pub fn unobserve(&self, peer: SocketAddr, token: Token, path: &str) -> Promise<Addrd<Message>> {
    self.observations.unsubscribe(token);

    let mut deregister = Message::new(Type::Con, code::GET, Id::UNSET, token);
    deregister.opts.uri_path = path.to_string();
    deregister.opts.observe = Some(1);
    self.outbound.apply(Outgoing::new(Addrd(deregister, peer)))
  }

  /// Server side: send a notification to an observer.
  ///
  /// A CON notification's promise resolves when the peer
  /// acknowledges; a NON notification resolves immediately after
  /// transmit.
  pub fn send_notification(&self,
                           peer: SocketAddr,
                           token: Token,
                           seq: u32,
                           mut note: Message)
                           -> Promise<Addrd<Message>> {
    note.token = token;
    note.opts.observe = Some(seq);
    self.outbound.apply(Outgoing::new(Addrd(note, peer)))
  }

  /// Feed one decoded inbound message to the engine
  pub fn on_receive(&self, msg: Addrd<Message>) {
    log::trace!(target: "croak",
                "recv {:?} {} {:?} from {}",
                msg.data().ty,
                msg.data().code,
                msg.data().id,
                msg.addr());

    if msg.data().is_signaling() {
      return self.handle_signaling(msg);
    }

    if msg.data().is_ping() {
      return self.reply(msg.as_ref().map(|m| m.reset()));
    }

    if msg.data().is_request() {
      return self.handle_request(msg);
    }

    let now = match self.clock.try_now() {
      | Ok(now) => now,
      | Err(_) => {
        log::warn!(target: "croak", "clock failed, dropping inbound message");
        return;
      },
    };

    match msg.data().ty {
      | Type::Ack => {
        if !self.exchanges.handle_ack(&msg, now) {
          log::debug!(target: "croak",
                      "stray ACK {:?} from {}, ignoring",
                      msg.data().id,
                      msg.addr());
        }
      },
      | Type::Reset => {
        if !self.exchanges.handle_reset(&msg) {
          log::debug!(target: "croak",
                      "stray RST {:?} from {}, ignoring",
                      msg.data().id,
                      msg.addr());
        }
      },
      | Type::Con | Type::Non => self.handle_separate_or_notification(msg),
    }
  }

  fn handle_separate_or_notification(&self, msg: Addrd<Message>) {
    if !msg.data().is_response() {
      log::debug!(target: "croak",
                  "unprocessable {:?} from {}, rejecting",
                  msg.data().id,
                  msg.addr());
      return self.reply(msg.as_ref().map(|m| m.reset()));
    }

    let needs_ack = msg.data().ty == Type::Con;
    let ack = msg.as_ref().map(|m| m.empty_ack());

    if self.exchanges.handle_separate(&msg) {
      if needs_ack {
        self.reply(ack);
      }
      return;
    }

    if self.observations.notify(msg.clone(), &self.outbound) {
      if needs_ack {
        self.reply(ack);
      }
      return;
    }

    // a response nobody asked for: tell the peer to stop
    log::debug!(target: "croak",
                "unmatched response {:?} from {}, rejecting",
                msg.data().id,
                msg.addr());
    self.reply(msg.as_ref().map(|m| m.reset()));
  }

  fn handle_request(&self, msg: Addrd<Message>) {
    let fallback = msg.data().response(code::INTERNAL_SERVER_ERROR);
    let peer = msg.addr();

    let transport = Arc::clone(&self.transport);
    let ids = Arc::clone(&self.ids);
    self.inbound.apply(msg).on_complete(move |result| {
                          let reply = match result {
                            | Ok(Some(reply)) => reply,
                            | Ok(None) => return,
                            | Err(e) => {
                              log::warn!(target: "croak",
                                         "handler failed for request from {}: {}",
                                         peer,
                                         e);
                              Addrd(fallback, peer)
                            },
                          };

                          let mut reply = reply;
                          if reply.data().id == Id::UNSET && reply.data().ty != Type::Ack {
                            reply.data_mut().id = ids.next_id(reply.addr());
                          }
                          if let Err(e) = transport.transmit(&reply) {
                            log::warn!(target: "croak",
                                       "transmit to {} failed: {}",
                                       reply.addr(),
                                       e);
                          }
                        });
  }

  fn handle_signaling(&self, msg: Addrd<Message>) {
    let peer = msg.addr();
    match msg.data().code {
      | code::CSM => {
        if let Err(e) = self.csm.apply(peer, msg.data()) {
          log::warn!(target: "croak", "bad CSM from {}: {}", peer, e);
          self.reply(Addrd(CsmStore::abort("bad CSM"), peer));
          self.on_disconnect(peer);
        }
      },
      | code::PING => self.reply(Addrd(CsmStore::pong(msg.data()), peer)),
      | code::PONG => {
        log::trace!(target: "croak", "pong from {}", peer);
      },
      | code::RELEASE | code::ABORT => {
        log::debug!(target: "croak",
                    "{} signaled {}, tearing down",
                    peer,
                    msg.data().code);
        self.on_disconnect(peer);
      },
      | other => {
        log::debug!(target: "croak",
                    "unknown signaling {} from {}, ignoring",
                    other,
                    peer);
      },
    }
  }

  /// Advance time-driven work: CON retransmissions, delayed-response
  /// and retry timeouts, the dedup sweep, stale assembly pruning.
  pub fn tick(&self) -> Result<(), Error> {
    let now = self.clock.try_now().map_err(|_| Error::Clock)?;

    for resend in self.exchanges.tick(now) {
      if let Err(e) = self.transport.transmit(&resend) {
        log::warn!(target: "croak",
                   "retransmit to {} failed: {}",
                   resend.addr(),
                   e);
      }
    }

    self.dedup.sweep(now);
    self.block_recv.prune(now);
    Ok(())
  }

  /// A connection-oriented transport got a new connection: announce
  /// our capabilities.
  pub fn on_connect(&self, peer: SocketAddr) {
    if !self.transport.is_connection_oriented() {
      return;
    }
    let announcement = self.csm.on_connect(peer);
    self.reply(Addrd(announcement, peer));
  }

  /// A connection went away: forget its capabilities and fail its
  /// exchanges.
  pub fn on_disconnect(&self, peer: SocketAddr) {
    self.csm.remove(peer);
    self.exchanges
        .fail_peer(peer, Error::ConnectionClosed);
  }

  /// Fail everything in flight; the engine stays usable but nothing
  /// survives the call.
  pub fn shutdown(&self) {
    self.observations.cancel_all();
    self.exchanges.fail_all(Error::ConnectionClosed);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::service::service_fn;
  use crate::test::{self, ClockMock, TransportMock};

  type Sent = Arc<std::sync::Mutex<Vec<Addrd<Message>>>>;

  fn echo_handler() -> SharedService<Addrd<Message>, Option<Addrd<Message>>> {
    service_fn(|req: Addrd<Message>| {
      let mut resp = req.data().response(code::CONTENT);
      resp.payload = req.data().payload.clone();
      Promise::resolved(Ok(Some(Addrd(resp, req.addr()))))
    })
  }

  fn engine(connection_oriented: bool)
            -> (Core<ClockMock, TransportMock>, Sent, Arc<ClockMock>) {
    let (transport, sent) = TransportMock::new(connection_oriented);
    let clock = ClockMock::new();
    let handle = clock.handle();
    let core = Core::with_provisioners(Config::default(),
                                       clock,
                                       transport,
                                       echo_handler(),
                                       Arc::new(test::Sequential::new()),
                                       Arc::new(test::Sequential::new()));
    (core, sent, handle)
  }

  #[test]
  fn ping_gets_reset() {
    let (core, sent, _) = engine(false);
    let ping = Message::new(Type::Con, code::EMPTY, Id(77), Token::default());
    core.on_receive(Addrd(ping, test::addr(1)));

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data().ty, Type::Reset);
    assert_eq!(sent[0].data().id, Id(77));
  }

  #[test]
  fn requests_get_piggybacked_responses_and_duplicates_replay() {
    let (core, sent, _) = engine(false);
    let req = Addrd(test::con_get(5, &[1], "frogs"), test::addr(1));

    core.on_receive(req.clone());
    core.on_receive(req);

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    for resp in sent.iter() {
      assert_eq!(resp.data().ty, Type::Ack);
      assert_eq!(resp.data().id, Id(5));
      assert_eq!(resp.data().code, code::CONTENT);
    }
  }

  #[test]
  fn send_resolves_on_piggybacked_response() {
    let (core, sent, _) = engine(false);
    let peer = test::addr(1);

    let mut req = Message::new(Type::Con, code::GET, Id::UNSET, Token::default());
    req.opts.uri_path = "frogs".into();
    let promise = core.send(Addrd(req, peer));

    let wire = sent.lock().unwrap().pop().unwrap();
    assert_ne!(wire.data().id, Id::UNSET);
    assert!(!wire.data().token.is_empty());

    let resp = wire.map(|m| m.response(code::CONTENT));
    core.on_receive(resp.clone());
    assert_eq!(promise.try_get(), Some(Ok(resp)));
  }

  #[test]
  fn empty_ack_then_separate_response_is_acknowledged() {
    let (core, sent, _) = engine(false);
    let peer = test::addr(1);

    let mut req = Message::new(Type::Con, code::GET, Id::UNSET, Token::default());
    req.opts.uri_path = "frogs".into();
    let promise = core.send(Addrd(req, peer));

    let wire = sent.lock().unwrap().pop().unwrap();
    core.on_receive(wire.as_ref().map(|m| m.empty_ack()));
    assert!(!promise.is_resolved());

    let mut separate = Message::new(Type::Con,
                                    code::CONTENT,
                                    Id(901),
                                    wire.data().token);
    separate.payload = b"ribbit".to_vec();
    core.on_receive(Addrd(separate, peer));

    assert_eq!(promise.try_get()
                      .unwrap()
                      .unwrap()
                      .data()
                      .payload,
               b"ribbit".to_vec());

    // the CON carrier got an empty ACK back
    let sent = sent.lock().unwrap();
    let ack = sent.last().unwrap();
    assert_eq!(ack.data().ty, Type::Ack);
    assert_eq!(ack.data().code, code::EMPTY);
    assert_eq!(ack.data().id, Id(901));
  }

  #[test]
  fn unacked_con_retransmits_then_fails() {
    let (core, sent, clock) = engine(false);
    let peer = test::addr(1);

    let req = Message::new(Type::Con, code::GET, Id::UNSET, Token::default());
    let promise = core.send(Addrd(req, peer));
    assert_eq!(sent.lock().unwrap().len(), 1);

    for ms in (0..60_000u64).step_by(100) {
      clock.set_millis(ms);
      core.tick().unwrap();
    }

    // initial send + 3 retransmissions
    assert_eq!(sent.lock().unwrap().len(), 4);
    assert_eq!(promise.try_get(), Some(Err(Error::Timeout)));
  }

  #[test]
  fn unmatched_response_gets_reset() {
    let (core, sent, _) = engine(false);
    let mut orphan = Message::new(Type::Con, code::CONTENT, Id(42), Token::opaque(&[9]));
    orphan.payload = b"?".to_vec();
    core.on_receive(Addrd(orphan, test::addr(1)));

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data().ty, Type::Reset);
    assert_eq!(sent[0].data().id, Id(42));
  }

  #[test]
  fn observe_registers_and_delivers() {
    let (core, sent, _) = engine(false);
    let peer = test::addr(1);

    let observation = core.observe(peer, "frogs");
    let register = sent.lock().unwrap().pop().unwrap();
    assert_eq!(register.data().opts.observe, Some(0));
    assert_eq!(register.data().token, observation.token);

    // registration response resolves the registration promise
    let mut reg_resp = register.data().response(code::CONTENT);
    reg_resp.opts.observe = Some(1);
    core.on_receive(Addrd(reg_resp, peer));
    assert!(observation.registration.is_resolved());

    // a CON notification resolves `next` and is acknowledged
    let mut note = Message::new(Type::Con, code::CONTENT, Id(300), observation.token);
    note.opts.observe = Some(2);
    note.payload = b"ribbit".to_vec();
    core.on_receive(Addrd(note, peer));

    assert_eq!(observation.next
                          .try_get()
                          .unwrap()
                          .unwrap()
                          .data()
                          .payload,
               b"ribbit".to_vec());

    let sent = sent.lock().unwrap();
    let ack = sent.last().unwrap();
    assert_eq!(ack.data().ty, Type::Ack);
    assert_eq!(ack.data().id, Id(300));
  }

  #[test]
  fn stream_ping_gets_pong() {
    let (core, sent, _) = engine(true);
    let peer = test::addr(1);

    let ping = Message::new(Type::Non, code::PING, Id::UNSET, Token::opaque(&[3]));
    core.on_receive(Addrd(ping, peer));

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data().code, code::PONG);
    assert_eq!(sent[0].data().token, Token::opaque(&[3]));
  }

  #[test]
  fn connect_announces_csm_and_disconnect_fails_exchanges() {
    let (core, sent, _) = engine(true);
    let peer = test::addr(1);

    core.on_connect(peer);
    assert_eq!(sent.lock().unwrap()[0].data().code, code::CSM);

    let req = Message::new(Type::Con, code::GET, Id::UNSET, Token::default());
    let promise = core.send(Addrd(req, peer));

    core.on_disconnect(peer);
    assert_eq!(promise.try_get(), Some(Err(Error::ConnectionClosed)));
  }

  #[test]
  fn release_tears_the_peer_down() {
    let (core, _, _) = engine(true);
    let peer = test::addr(1);

    let req = Message::new(Type::Con, code::GET, Id::UNSET, Token::default());
    let promise = core.send(Addrd(req, peer));

    let release = Message::new(Type::Non, code::RELEASE, Id::UNSET, Token::default());
    core.on_receive(Addrd(release, peer));
    assert_eq!(promise.try_get(), Some(Err(Error::ConnectionClosed)));
  }

  #[test]
  fn shutdown_fails_everything() {
    let (core, _, _) = engine(false);

    let req = Message::new(Type::Con, code::GET, Id::UNSET, Token::default());
    let promise = core.send(Addrd(req, test::addr(1)));
    let observation = core.observe(test::addr(2), "frogs");

    core.shutdown();
    assert_eq!(promise.try_get(), Some(Err(Error::ConnectionClosed)));
    assert!(observation.next.is_cancelled());
  }
}
