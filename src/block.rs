//! Block-wise transfer (RFC 7959, plus BERT from RFC 8323).
//!
//! [`BlockSend`] sits in the outbound pipeline: it fragments large
//! request payloads by Block1 and reassembles Block2 responses, so
//! whoever called [`crate::core::Core::send`] only ever sees whole
//! entities. [`BlockRecv`] sits in the inbound pipeline and does the
//! mirror image for requests we serve.

use core::fmt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use embedded_time::Instant;

use crate::config;
use crate::csm::{Capabilities, CsmStore};
use crate::error::Error;
use crate::exchange::Outgoing;
use crate::msg::{code, Block, BlockSize, Id, Message, Token};
use crate::net::Addrd;
use crate::promise::Promise;
use crate::service::{Service, SharedService};
use crate::time::{Clock, Stamped};

/// How many times the resource behind a Block2 transfer may change
/// (observed as an ETag change mid-transfer) before we stop
/// restarting and fail the exchange.
pub const MAX_RESOURCE_CHANGES: u8 = 3;

/// A payload carried under `block` is well-formed when every
/// non-final block is exactly full (whole 1024-byte units, for BERT)
/// and the final block is no more than full.
pub(crate) fn chunk_len_valid(len: usize, block: &Block) -> bool {
  match (block.size.is_bert(), block.more) {
    | (true, true) => len > 0 && len % 1024 == 0,
    | (true, false) => true,
    | (false, true) => len == block.size.len(),
    | (false, false) => len <= block.size.len(),
  }
}

/// How many block numbers a payload of `len` bytes advances
fn blocks_in(len: usize, size: BlockSize) -> u32 {
  (len / size.len()).max(1) as u32
}

// ---------------------------------------------------------------------
// client side
// ---------------------------------------------------------------------

/// Outbound pipeline stage: Block1 fragmentation and Block2
/// reassembly for requests we originate.
pub struct BlockSend {
  block_cfg: config::Block,
  csm: Arc<CsmStore>,
  inner: SharedService<Outgoing, Addrd<Message>>,
}

impl fmt::Debug for BlockSend {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BlockSend")
     .field("block_cfg", &self.block_cfg)
     .finish()
  }
}

impl BlockSend {
  /// Wrap the exchange layer with block-wise handling
  pub fn new(block_cfg: config::Block,
             csm: Arc<CsmStore>,
             inner: SharedService<Outgoing, Addrd<Message>>)
             -> Self {
    Self { block_cfg,
           csm,
           inner }
  }
}

impl Service<Outgoing, Addrd<Message>> for BlockSend {
  fn apply(&self, out: Outgoing) -> Promise<Addrd<Message>> {
    // notifications and other non-requests pass straight through
    if !out.msg.data().is_request() {
      return self.inner.apply(out);
    }

    let caps = self.csm.get(out.msg.addr());
    let max = caps.max_outbound_payload_size();

    if out.msg.data().payload.len() > max && caps.block_size().is_none() {
      return Promise::resolved(Err(Error::EntityTooLarge { max }));
    }

    Flow::start(self.block_cfg,
                caps,
                Arc::clone(&self.inner),
                out)
  }
}

struct FlowState {
  /// The whole request entity
  full: Vec<u8>,
  /// Template for the message currently in flight
  request: Message,
  /// Block1 size in use, when fragmenting
  block1_size: Option<BlockSize>,
  /// Request bytes the peer has accepted so far
  sent: usize,
  /// Response bytes collected so far
  assembled: Vec<u8>,
  /// Header source for the final assembled response
  resp_template: Option<Message>,
  /// ETag seen on the first Block2 response
  etag: Option<Vec<u8>>,
  /// The Block2 num we asked for, if any
  expected2: Option<(u32, BlockSize)>,
  restarts: u8,
}

/// One in-flight block-wise exchange, driven entirely by completion
/// callbacks on the inner service's promises.
struct Flow {
  block_cfg: config::Block,
  caps: Capabilities,
  inner: SharedService<Outgoing, Addrd<Message>>,
  out: Promise<Addrd<Message>>,
  peer: SocketAddr,
  state: Mutex<FlowState>,
}

enum Action {
  Deliver(Result<Addrd<Message>, Error>),
  Send(Message),
}

impl Flow {
  fn start(block_cfg: config::Block,
           caps: Capabilities,
           inner: SharedService<Outgoing, Addrd<Message>>,
           out: Outgoing)
           -> Promise<Addrd<Message>> {
    let peer = out.msg.addr();
    let mut request = out.msg.unwrap();
    let full = core::mem::take(&mut request.payload);

    // a request may arrive here already asking for a specific block2
    // window (the observe refetch path does); reassembly picks up
    // from there instead of block zero
    let expected2 = request.opts.block2.map(|b| (b.num, b.size));

    let mut state = FlowState { full,
                                request,
                                block1_size: None,
                                sent: 0,
                                assembled: Vec::new(),
                                resp_template: None,
                                etag: None,
                                expected2,
                                restarts: 0 };

    let max = caps.max_outbound_payload_size();
    if state.full.len() > max {
      // checked by the caller: a block size exists when we get here
      state.block1_size = caps.block_size();
    }

    let first = Self::next_request(&mut state, max);

    let flow = Arc::new(Flow { block_cfg,
                               caps,
                               inner,
                               out: Promise::new(),
                               peer,
                               state: Mutex::new(state) });

    flow.transmit(first, out.priority);
    flow.out.clone()
  }

  /// Build the next request message from the flow state.
  ///
  /// When fragmenting, slices the next Block1 window out of the full
  /// payload; Size1 rides along only on block zero.
  fn next_request(state: &mut FlowState, max: usize) -> Message {
    let mut msg = state.request.clone();
    msg.id = Id::UNSET;

    match state.block1_size {
      | None => {
        msg.payload = state.full.clone();
        state.sent = state.full.len();
      },
      | Some(size) => {
        let chunk = if size.is_bert() { max } else { size.len() };
        let end = (state.sent + chunk).min(state.full.len());
        let num = (state.sent / size.len()) as u32;
        let more = end < state.full.len();

        msg.opts.block1 = Some(Block::new(num, size, more));
        msg.opts.size1 = if num == 0 {
          Some(state.full.len() as u32)
        } else {
          None
        };
        msg.payload = state.full[state.sent..end].to_vec();
        state.sent = end;
      },
    }

    state.request = msg.clone();
    msg
  }

  fn transmit(self: &Arc<Self>, msg: Message, priority: crate::exchange::Priority) {
    let flow = Arc::clone(self);
    let out = Outgoing { msg: Addrd(msg, self.peer),
                         priority };
    self.inner
        .apply(out)
        .on_complete(move |result| flow.receive(result));
  }

  fn receive(self: &Arc<Self>, result: Result<Addrd<Message>, Error>) {
    let action = {
      let mut state = self.state.lock().expect("block flow lock poisoned");
      match result {
        | Err(e) => Action::Deliver(Err(e)),
        | Ok(resp) => self.classify(&mut state, resp),
      }
    };

    // the lock is released before acting: the inner service may
    // complete synchronously and recurse into receive
    match action {
      | Action::Deliver(result) => {
        self.out.complete(result);
      },
      | Action::Send(msg) => {
        self.transmit(msg, crate::exchange::Priority::Block);
      },
    }
  }

  fn classify(&self, state: &mut FlowState, resp: Addrd<Message>) -> Action {
    let max = self.caps.max_outbound_payload_size();

    // 4.13 carrying a Block1 hint: the peer wants smaller blocks
    if resp.data().code == code::REQUEST_ENTITY_TOO_LARGE
       && state.request.opts.block1.is_some()
    {
      let current = state.block1_size.unwrap_or(BlockSize::S1024);
      match resp.data().opts.block1.map(|b| b.size) {
        | Some(smaller) if smaller < current => {
          log::debug!(target: "croak",
                      "block: {} wants {:?} blocks, restarting",
                      self.peer,
                      smaller);
          state.block1_size = Some(smaller);
          state.sent = 0;
          return Action::Send(Self::next_request(state, max));
        },
        | _ => return Action::Deliver(Ok(resp)),
      }
    }

    let in_block1 = state.request
                         .opts
                         .block1
                         .map(|b| b.more)
                         .unwrap_or(false);
    if in_block1 {
      if resp.data().code != code::CONTINUE {
        // anything but 2.31 mid-transfer aborts and is the answer
        return Action::Deliver(Ok(resp));
      }

      let ours = state.request.opts.block1.unwrap_or(Block::new(0, BlockSize::S16, false));
      if let Some(echoed) = resp.data().opts.block1 {
        // the peer may shrink the size on block zero; numbering
        // rescales because `sent` is tracked in bytes
        if ours.num == 0 && echoed.size < ours.size {
          state.block1_size = Some(echoed.size);
        }
      }

      return Action::Send(Self::next_request(state, max));
    }

    if let Some(block2) = resp.data().opts.block2 {
      return self.receive_block2(state, resp, block2);
    }

    Action::Deliver(Ok(resp))
  }

  fn receive_block2(&self, state: &mut FlowState, resp: Addrd<Message>, block2: Block) -> Action {
    let expected_num = state.expected2.map(|(num, _)| num).unwrap_or(0);
    if block2.num != expected_num {
      return Action::Deliver(Err(Error::Protocol("block2 number mismatch")));
    }

    if !chunk_len_valid(resp.data().payload.len(), &block2) {
      return Action::Deliver(Err(Error::Protocol("block2 payload does not match block size")));
    }

    if state.assembled.is_empty() {
      state.etag = resp.data().opts.etag.clone();
    } else if state.etag != resp.data().opts.etag {
      if state.restarts >= MAX_RESOURCE_CHANGES {
        return Action::Deliver(Err(Error::Protocol("resource changed too many times during transfer")));
      }

      log::debug!(target: "croak",
                  "block: resource at {} changed mid-transfer, restarting",
                  self.peer);
      state.restarts += 1;
      state.assembled.clear();
      state.etag = None;
      state.expected2 = Some((0, block2.size));
      return Action::Send(Self::block2_request(state, 0, block2.size));
    }

    if state.assembled.len() + resp.data().payload.len() > self.block_cfg.max_transfer_size {
      return Action::Deliver(Err(Error::EntityTooLarge { max: self.block_cfg
                                                              .max_transfer_size }));
    }

    state.assembled.extend_from_slice(&resp.data().payload);
    state.resp_template = Some(resp.data().clone());

    if block2.more {
      let next = block2.num + blocks_in(resp.data().payload.len(), block2.size);
      state.expected2 = Some((next, block2.size));
      return Action::Send(Self::block2_request(state, next, block2.size));
    }

    // whole entity collected
    let mut assembled = match state.resp_template.take() {
      | Some(template) => template,
      | None => resp.data().clone(),
    };
    assembled.payload = core::mem::take(&mut state.assembled);
    assembled.opts.block2 = None;
    assembled.opts.size2 = None;
    Action::Deliver(Ok(Addrd(assembled, resp.addr())))
  }

  /// The follow-up request fetching block2 number `num`
  fn block2_request(state: &mut FlowState, num: u32, size: BlockSize) -> Message {
    let mut msg = state.request.clone();
    msg.id = Id::UNSET;
    msg.payload = Vec::new();
    msg.opts.block1 = None;
    msg.opts.size1 = None;
    msg.opts.block2 = Some(Block::new(num, size, false));
    state.request = msg.clone();
    msg
  }
}

// ---------------------------------------------------------------------
// server side
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AssemblyKey {
  path: String,
  peer: SocketAddr,
}

#[derive(Debug)]
struct Assembly {
  token: Token,
  payload: Vec<u8>,
}

/// Inbound pipeline stage: reassembles Block1 requests before the
/// handler sees them and slices oversized responses by Block2.
pub struct BlockRecv<C: Clock> {
  block_cfg: config::Block,
  lifetime: crate::time::Millis,
  csm: Arc<CsmStore>,
  clock: Arc<C>,
  assemblies: Mutex<HashMap<AssemblyKey, Stamped<C, Assembly>>>,
  inner: SharedService<Addrd<Message>, Option<Addrd<Message>>>,
}

impl<C: Clock> fmt::Debug for BlockRecv<C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BlockRecv")
     .field("block_cfg", &self.block_cfg)
     .finish()
  }
}

enum RecvAction {
  Reply(Message),
  Invoke(Message),
  Drop,
}

impl<C: Clock + Send + Sync + 'static> BlockRecv<C> {
  /// Wrap a handler with block-wise reassembly.
  ///
  /// `lifetime` bounds how long a half-finished assembly is kept;
  /// [`crate::config::Config::exchange_lifetime_millis`] is the
  /// natural choice.
  pub fn new(block_cfg: config::Block,
             lifetime: crate::time::Millis,
             csm: Arc<CsmStore>,
             clock: Arc<C>,
             inner: SharedService<Addrd<Message>, Option<Addrd<Message>>>)
             -> Self {
    Self { block_cfg,
           lifetime,
           csm,
           clock,
           assemblies: Mutex::new(HashMap::new()),
           inner }
  }

  /// Drop assemblies whose peer went quiet for longer than the
  /// configured lifetime.
  pub fn prune(&self, now: Instant<C>) {
    let lifetime = self.lifetime;
    let mut assemblies = self.assemblies.lock().expect("block recv lock poisoned");
    let before = assemblies.len();
    assemblies.retain(|_, assembly| !assembly.expired(now, lifetime));
    let dropped = before - assemblies.len();
    if dropped > 0 {
      log::debug!(target: "croak", "block: pruned {} stale assemblies", dropped);
    }
  }

  /// The Block1 state machine; returns what to do with the lock
  /// already released.
  fn accept_block(&self, req: &Addrd<Message>, block1: Block, now: Instant<C>) -> RecvAction {
    let key = AssemblyKey { path: req.data().opts.uri_path.clone(),
                            peer: req.addr() };
    let mut assemblies = self.assemblies.lock().expect("block recv lock poisoned");

    if !assemblies.contains_key(&key) {
      if block1.num != 0 {
        let mut reply = req.data().response(code::REQUEST_ENTITY_INCOMPLETE);
        reply.payload = b"no prior blocks".to_vec();
        return RecvAction::Reply(reply);
      }

      assemblies.insert(key.clone(),
                        Stamped(Assembly { token: req.data().token,
                                           payload: Vec::new() },
                                now));
    }

    let entry = match assemblies.get_mut(&key) {
      | Some(entry) => entry,
      | None => return RecvAction::Drop,
    };

    // every block of one transfer must carry the token that opened it
    if entry.data().token != req.data().token {
      assemblies.remove(&key);
      let mut reply = req.data().response(code::REQUEST_ENTITY_INCOMPLETE);
      reply.payload = b"Token mismatch".to_vec();
      return RecvAction::Reply(reply);
    }

    if !chunk_len_valid(req.data().payload.len(), &block1) {
      assemblies.remove(&key);
      let mut reply = req.data().response(code::BAD_REQUEST);
      reply.payload = b"block payload does not match block size".to_vec();
      return RecvAction::Reply(reply);
    }

    let expected = (entry.data().payload.len() / block1.size.len()) as u32;
    if block1.num > expected {
      assemblies.remove(&key);
      let mut reply = req.data().response(code::REQUEST_ENTITY_INCOMPLETE);
      reply.payload = b"block out of order".to_vec();
      return RecvAction::Reply(reply);
    }

    if block1.num < expected {
      // a retransmission of a block we already have; acknowledge it
      // again without appending
      log::debug!(target: "croak",
                  "block: duplicate block {} from {}, ignoring payload",
                  block1.num,
                  req.addr());
      let mut reply = req.data().response(code::CONTINUE);
      reply.opts.block1 = Some(block1);
      return RecvAction::Reply(reply);
    }

    if entry.data().payload.len() + req.data().payload.len() > self.block_cfg.max_transfer_size {
      assemblies.remove(&key);
      let mut reply = req.data().response(code::REQUEST_ENTITY_TOO_LARGE);
      reply.opts.size1 = Some(self.block_cfg.max_transfer_size as u32);
      return RecvAction::Reply(reply);
    }

    entry.data_mut().payload.extend_from_slice(&req.data().payload);

    if block1.more {
      let mut reply = req.data().response(code::CONTINUE);
      reply.opts.block1 = Some(block1);
      return RecvAction::Reply(reply);
    }

    // final block: the logical request is whole
    let assembly = match assemblies.remove(&key) {
      | Some(assembly) => assembly,
      | None => return RecvAction::Drop,
    };

    let mut whole = req.data().clone();
    whole.payload = assembly.discard_timestamp().payload;
    RecvAction::Invoke(whole)
  }

  /// Apply `inner` and slice the response by Block2 when it is too
  /// big for the peer.
  fn invoke_sliced(&self, req: Addrd<Message>) -> Promise<Option<Addrd<Message>>> {
    let caps = self.csm.get(req.addr());
    let requested = req.data().opts.block2;
    let wants_size2 = req.data().opts.size2.is_some();

    let out = Promise::new();
    let chained = out.clone();
    self.inner.apply(req).on_complete(move |result| {
                         let sliced = result.map(|opt| {
                                                opt.map(|resp| {
                                                      resp.map(|m| {
                                                            slice_block2(m,
                                                                         requested,
                                                                         wants_size2,
                                                                         &caps)
                                                          })
                                                    })
                                              });
                         chained.complete(sliced);
                       });
    out
  }
}

/// Carve the Block2 window `requested` (or block zero) out of an
/// oversized response.
fn slice_block2(mut resp: Message,
                requested: Option<Block>,
                wants_size2: bool,
                caps: &Capabilities)
                -> Message {
  // notifications are never sliced here; observe delivery has its own
  // first-block protocol
  if resp.opts.observe.is_some() {
    return resp;
  }

  let max = caps.max_outbound_payload_size();
  if requested.is_none() && resp.payload.len() <= max {
    return resp;
  }

  let size = match caps.block_size() {
    | Some(size) => requested.map(|b| b.size.min(size)).unwrap_or(size),
    // peer can't do block-wise: send it whole and let the transport
    // complain if it must
    | None => return resp,
  };

  let num = requested.map(|b| b.num).unwrap_or(0);
  let chunk = if size.is_bert() { max } else { size.len() };
  let offset = num as usize * size.len();

  if offset > resp.payload.len() {
    let mut bad = resp.clone();
    bad.payload = b"block2 out of range".to_vec();
    bad.code = code::BAD_REQUEST;
    bad.opts = crate::msg::Opts { uri_path: resp.opts.uri_path.clone(),
                                  ..Default::default() };
    return bad;
  }

  let total = resp.payload.len();
  let end = (offset + chunk).min(total);

  if wants_size2 && num == 0 {
    resp.opts.size2 = Some(total as u32);
  }
  resp.opts.block2 = Some(Block::new(num, size, end < total));
  resp.payload = resp.payload[offset..end].to_vec();
  resp
}

impl<C: Clock + Send + Sync + 'static> Service<Addrd<Message>, Option<Addrd<Message>>> for BlockRecv<C> {
  fn apply(&self, req: Addrd<Message>) -> Promise<Option<Addrd<Message>>> {
    let Some(block1) = req.data().opts.block1 else {
      return self.invoke_sliced(req);
    };

    let now = match self.clock.try_now() {
      | Ok(now) => now,
      | Err(_) => return Promise::resolved(Err(Error::Clock)),
    };

    match self.accept_block(&req, block1, now) {
      | RecvAction::Reply(reply) => Promise::resolved(Ok(Some(Addrd(reply, req.addr())))),
      | RecvAction::Drop => Promise::resolved(Ok(None)),
      | RecvAction::Invoke(whole) => {
        let peer = req.addr();
        let out = Promise::new();
        let chained = out.clone();
        self.invoke_sliced(Addrd(whole, peer))
            .on_complete(move |result| {
              // responses to the final block echo its Block1
              let echoed = result.map(|opt| {
                                    opt.map(|resp| {
                                          resp.map(|mut m| {
                                                m.opts.block1 = Some(block1);
                                                m
                                              })
                                        })
                                  });
              chained.complete(echoed);
            });
        out
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;
  use crate::msg::Type;
  use crate::service::service_fn;
  use crate::test::{self, ClockMock};
  use crate::time::Milliseconds;

  fn block_cfg() -> config::Block {
    config::Block { max_transfer_size: 4096 }
  }

  fn tiny_caps() -> Arc<CsmStore> {
    // max_message_size 16 forces 16-byte blocks
    Arc::new(CsmStore::new(Capabilities { max_message_size: 16,
                                          block_transfer: true }))
  }

  /// A peer that accepts Block1 fragments and remembers what it got
  fn accepting_peer() -> (Arc<Mutex<Vec<u8>>>, SharedService<Outgoing, Addrd<Message>>) {
    let got = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&got);
    let svc = service_fn(move |out: Outgoing| {
      let msg = out.msg.data();
      let block1 = msg.opts.block1.expect("peer expected a block1 option");
      sink.lock().unwrap().extend_from_slice(&msg.payload);

      let code = if block1.more { code::CONTINUE } else { code::CHANGED };
      let mut resp = msg.response(code);
      resp.opts.block1 = Some(block1);
      Promise::resolved(Ok(Addrd(resp, out.msg.addr())))
    });
    (got, svc)
  }

  #[test]
  fn fragments_21_bytes_into_16_and_5() {
    let (got, peer) = accepting_peer();
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&sizes);
    let spy = service_fn(move |out: Outgoing| {
      let b = out.msg.data().opts.block1.unwrap();
      seen.lock()
          .unwrap()
          .push((b.num, out.msg.data().payload.len(), b.more,
                 out.msg.data().opts.size1));
      peer.apply(out)
    });

    let stage = BlockSend::new(block_cfg(), tiny_caps(), spy);

    let mut req = test::con_get(0, &[1], "frogs");
    req.code = code::PUT;
    req.payload = b"123456789012345|abcde".to_vec();

    let promise = stage.apply(Outgoing::new(Addrd(req, test::addr(1))));
    let resp = promise.try_get().unwrap().unwrap();
    assert_eq!(resp.data().code, code::CHANGED);

    assert_eq!(got.lock().unwrap().as_slice(), b"123456789012345|abcde");
    assert_eq!(*sizes.lock().unwrap(),
               vec![(0, 16, true, Some(21)), (1, 5, false, None)]);
  }

  #[test]
  fn aborts_block1_on_non_continue() {
    let peer = service_fn(|out: Outgoing| {
      let mut resp = out.msg.data().response(code::NOT_FOUND);
      resp.opts.block1 = out.msg.data().opts.block1;
      Promise::resolved(Ok(Addrd(resp, out.msg.addr())))
    });

    let stage = BlockSend::new(block_cfg(), tiny_caps(), peer);
    let mut req = test::con_get(0, &[1], "frogs");
    req.code = code::PUT;
    req.payload = vec![0u8; 40];

    let resp = stage.apply(Outgoing::new(Addrd(req, test::addr(1))))
                    .try_get()
                    .unwrap()
                    .unwrap();
    assert_eq!(resp.data().code, code::NOT_FOUND);
  }

  #[test]
  fn too_large_without_block_support_fails_fast() {
    let caps = Arc::new(CsmStore::new(Capabilities { max_message_size: 16,
                                                     block_transfer: false }));
    let peer = service_fn(|_: Outgoing| panic!("nothing should be sent"));
    let stage = BlockSend::new(block_cfg(), caps, peer);

    let mut req = test::con_get(0, &[1], "frogs");
    req.code = code::PUT;
    req.payload = vec![0u8; 40];

    assert_eq!(stage.apply(Outgoing::new(Addrd(req, test::addr(1))))
                    .try_get(),
               Some(Err(Error::EntityTooLarge { max: 16 })));
  }

  #[test]
  fn reassembles_block2_responses() {
    let body: Vec<u8> = (0..40u8).collect();
    let served = body.clone();
    let peer = service_fn(move |out: Outgoing| {
      let req = out.msg.data();
      let num = req.opts.block2.map(|b| b.num).unwrap_or(0);
      let offset = num as usize * 16;
      let end = (offset + 16).min(served.len());

      let mut resp = req.response(code::CONTENT);
      resp.opts.etag = Some(vec![1]);
      resp.opts.block2 = Some(Block::new(num, BlockSize::S16, end < served.len()));
      resp.payload = served[offset..end].to_vec();
      Promise::resolved(Ok(Addrd(resp, out.msg.addr())))
    });

    let stage = BlockSend::new(block_cfg(), tiny_caps(), peer);
    let req = test::con_get(0, &[1], "frogs");

    let resp = stage.apply(Outgoing::new(Addrd(req, test::addr(1))))
                    .try_get()
                    .unwrap()
                    .unwrap();
    assert_eq!(resp.data().payload, body);
    assert_eq!(resp.data().opts.block2, None);
  }

  #[test]
  fn etag_change_restarts_then_gives_up() {
    // the resource changes on every fetch: etag never stabilizes
    let versions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&versions);
    let peer = service_fn(move |out: Outgoing| {
      let req = out.msg.data();
      let num = req.opts.block2.map(|b| b.num).unwrap_or(0);
      let version = if num == 0 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
      } else {
        counter.load(Ordering::SeqCst) + 1
      };

      let mut resp = req.response(code::CONTENT);
      resp.opts.etag = Some(vec![version as u8]);
      resp.opts.block2 = Some(Block::new(num, BlockSize::S16, num == 0));
      resp.payload = vec![0u8; if num == 0 { 16 } else { 5 }];
      Promise::resolved(Ok(Addrd(resp, out.msg.addr())))
    });

    let stage = BlockSend::new(block_cfg(), tiny_caps(), peer);
    let req = test::con_get(0, &[1], "frogs");

    assert_eq!(stage.apply(Outgoing::new(Addrd(req, test::addr(1))))
                    .try_get(),
               Some(Err(Error::Protocol("resource changed too many times during transfer"))));
    // initial fetch + MAX_RESOURCE_CHANGES restarts reached block 0
    assert_eq!(versions.load(Ordering::SeqCst),
               1 + usize::from(MAX_RESOURCE_CHANGES));
  }

  fn recv_stage(inner: SharedService<Addrd<Message>, Option<Addrd<Message>>>)
                -> BlockRecv<ClockMock> {
    BlockRecv::new(block_cfg(),
                   Milliseconds(240_000),
                   tiny_caps(),
                   Arc::new(ClockMock::new()),
                   inner)
  }

  fn put_block(token: &[u8], path: &str, num: u32, more: bool, payload: &[u8]) -> Addrd<Message> {
    let mut req = test::con_get(100 + num as u16, token, path);
    req.code = code::PUT;
    req.opts.block1 = Some(Block::new(num, BlockSize::S16, more));
    req.payload = payload.to_vec();
    Addrd(req, test::addr(1))
  }

  #[test]
  fn assembles_two_blocks_and_echoes_block1() {
    let handled = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&handled);
    let inner = service_fn(move |req: Addrd<Message>| {
      *sink.lock().unwrap() = Some(req.data().payload.clone());
      Promise::resolved(Ok(Some(req.map(|m| m.response(code::CHANGED)))))
    });

    let stage = recv_stage(inner);

    let first = stage.apply(put_block(&[9], "frogs", 0, true, b"123456789012345|"))
                     .try_get()
                     .unwrap()
                     .unwrap()
                     .unwrap();
    assert_eq!(first.data().code, code::CONTINUE);
    assert_eq!(first.data().opts.block1,
               Some(Block::new(0, BlockSize::S16, true)));
    assert!(handled.lock().unwrap().is_none());

    let last = stage.apply(put_block(&[9], "frogs", 1, false, b"abcde"))
                    .try_get()
                    .unwrap()
                    .unwrap()
                    .unwrap();
    assert_eq!(last.data().code, code::CHANGED);
    assert_eq!(last.data().opts.block1,
               Some(Block::new(1, BlockSize::S16, false)));
    assert_eq!(handled.lock().unwrap().as_deref(),
               Some(b"123456789012345|abcde".as_slice()));
  }

  #[test]
  fn token_mismatch_drops_the_assembly() {
    let inner = service_fn(|req: Addrd<Message>| {
      Promise::resolved(Ok(Some(req.map(|m| m.response(code::CHANGED)))))
    });
    let stage = recv_stage(inner);

    stage.apply(put_block(&[1], "frogs", 0, true, b"123456789012345|"));

    let clash = stage.apply(put_block(&[2], "frogs", 1, false, b"abcde"))
                     .try_get()
                     .unwrap()
                     .unwrap()
                     .unwrap();
    assert_eq!(clash.data().code, code::REQUEST_ENTITY_INCOMPLETE);
    assert_eq!(clash.data().payload, b"Token mismatch".to_vec());

    // the slate is clean: a fresh block zero starts over
    let fresh = stage.apply(put_block(&[3], "frogs", 0, true, b"123456789012345|"))
                     .try_get()
                     .unwrap()
                     .unwrap()
                     .unwrap();
    assert_eq!(fresh.data().code, code::CONTINUE);
  }

  #[test]
  fn nonzero_first_block_is_incomplete() {
    let inner = service_fn(|req: Addrd<Message>| {
      Promise::resolved(Ok(Some(req.map(|m| m.response(code::CHANGED)))))
    });
    let stage = recv_stage(inner);

    let reply = stage.apply(put_block(&[1], "frogs", 2, true, b"123456789012345|"))
                     .try_get()
                     .unwrap()
                     .unwrap()
                     .unwrap();
    assert_eq!(reply.data().code, code::REQUEST_ENTITY_INCOMPLETE);
  }

  #[test]
  fn duplicate_block_is_not_appended() {
    let handled = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&handled);
    let inner = service_fn(move |req: Addrd<Message>| {
      *sink.lock().unwrap() = Some(req.data().payload.clone());
      Promise::resolved(Ok(Some(req.map(|m| m.response(code::CHANGED)))))
    });
    let stage = recv_stage(inner);

    stage.apply(put_block(&[1], "frogs", 0, true, b"123456789012345|"));
    // the peer missed our 2.31 and resends block 0
    let again = stage.apply(put_block(&[1], "frogs", 0, true, b"123456789012345|"))
                     .try_get()
                     .unwrap()
                     .unwrap()
                     .unwrap();
    assert_eq!(again.data().code, code::CONTINUE);

    stage.apply(put_block(&[1], "frogs", 1, false, b"abcde"));
    assert_eq!(handled.lock().unwrap().as_deref(),
               Some(b"123456789012345|abcde".as_slice()));
  }

  #[test]
  fn oversized_assembly_is_too_large() {
    let inner = service_fn(|req: Addrd<Message>| {
      Promise::resolved(Ok(Some(req.map(|m| m.response(code::CHANGED)))))
    });
    let stage = BlockRecv::new(config::Block { max_transfer_size: 20 },
                               Milliseconds(240_000),
                               tiny_caps(),
                               Arc::new(ClockMock::new()),
                               inner);

    stage.apply(put_block(&[1], "frogs", 0, true, b"123456789012345|"));
    let reply = stage.apply(put_block(&[1], "frogs", 1, true, b"123456789012345|"))
                     .try_get()
                     .unwrap()
                     .unwrap()
                     .unwrap();
    assert_eq!(reply.data().code, code::REQUEST_ENTITY_TOO_LARGE);
    assert_eq!(reply.data().opts.size1, Some(20));
  }

  #[test]
  fn slices_large_responses_by_block2() {
    let body: Vec<u8> = (0..40u8).collect();
    let served = body.clone();
    let inner = service_fn(move |req: Addrd<Message>| {
      let mut resp = req.data().response(code::CONTENT);
      resp.payload = served.clone();
      Promise::resolved(Ok(Some(Addrd(resp, req.addr()))))
    });
    let stage = recv_stage(inner);

    let req = Addrd(test::con_get(1, &[5], "frogs"), test::addr(1));
    let first = stage.apply(req).try_get().unwrap().unwrap().unwrap();
    assert_eq!(first.data().opts.block2,
               Some(Block::new(0, BlockSize::S16, true)));
    assert_eq!(first.data().payload, body[..16].to_vec());

    // the client asks for the rest
    let mut req2 = test::con_get(2, &[5], "frogs");
    req2.opts.block2 = Some(Block::new(2, BlockSize::S16, false));
    let third = stage.apply(Addrd(req2, test::addr(1)))
                     .try_get()
                     .unwrap()
                     .unwrap()
                     .unwrap();
    assert_eq!(third.data().opts.block2,
               Some(Block::new(2, BlockSize::S16, false)));
    assert_eq!(third.data().payload, body[32..].to_vec());
  }

  #[test]
  fn stale_assemblies_are_pruned() {
    let inner = service_fn(|req: Addrd<Message>| {
      Promise::resolved(Ok(Some(req.map(|m| m.response(code::CHANGED)))))
    });
    let stage = recv_stage(inner);

    stage.apply(put_block(&[1], "frogs", 0, true, b"123456789012345|"));
    stage.prune(ClockMock::instant(300_000));

    // assembly is gone; the continuation is now out of order
    let reply = stage.apply(put_block(&[1], "frogs", 1, false, b"abcde"))
                     .try_get()
                     .unwrap()
                     .unwrap()
                     .unwrap();
    assert_eq!(reply.data().code, code::REQUEST_ENTITY_INCOMPLETE);
  }
}
