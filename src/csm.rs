//! Capability signaling (RFC 8323 section 5.3) for stream transports.
//!
//! Each side of a connection announces what it can handle in a 7.01
//! CSM; the usable capabilities of the connection are the pairwise
//! minimum of what both sides announced. Datagram peers never signal,
//! so they resolve to the locally-configured assumption.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::error::Error;
use crate::msg::{code, BlockSize, Id, Message, Token, Type};

/// What a peer (or we) can handle on one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
  /// Largest message, in bytes, the peer is willing to receive
  pub max_message_size: u32,
  /// Whether the peer does RFC 7959 block-wise transfer
  pub block_transfer: bool,
}

impl Default for Capabilities {
  fn default() -> Self {
    Self::BASE
  }
}

impl Capabilities {
  /// What RFC 8323 lets us assume before any CSM arrives
  pub const BASE: Capabilities = Capabilities { max_message_size: 1152,
                                                block_transfer: false };

  /// Pairwise minimum; what a connection can actually do is never more
  /// than what either end can.
  pub fn min(&self, other: &Capabilities) -> Capabilities {
    Capabilities { max_message_size: self.max_message_size.min(other.max_message_size),
                   block_transfer: self.block_transfer && other.block_transfer }
  }

  /// The block size outbound transfers should use, `None` when
  /// block-wise transfer is off the table.
  ///
  /// Above the 1152-byte base size the answer is always BERT; below
  /// it, the largest standard size that fits.
  pub fn block_size(&self) -> Option<BlockSize> {
    if !self.block_transfer {
      return None;
    }

    if self.max_message_size > 1152 {
      Some(BlockSize::Bert)
    } else {
      BlockSize::fit(self.max_message_size as usize)
    }
  }

  /// Most payload bytes one outbound message may carry.
  ///
  /// A BERT message packs as many whole 1024-byte units as fit with
  /// room left for the header; a standard block message carries one
  /// block; without block-wise transfer the announced message size is
  /// the only bound.
  pub fn max_outbound_payload_size(&self) -> usize {
    match self.block_size() {
      | Some(BlockSize::Bert) => {
        let units = (self.max_message_size as usize / 1024).saturating_sub(1).max(1);
        units * 1024
      },
      | Some(size) => size.len(),
      | None => self.max_message_size as usize,
    }
  }
}

/// Per-peer capability storage plus CSM message handling
#[derive(Debug)]
pub struct CsmStore {
  local: Capabilities,
  peers: Mutex<HashMap<SocketAddr, Capabilities>>,
}

impl CsmStore {
  /// `local` is both what we announce to stream peers and what we
  /// assume of datagram peers.
  pub fn new(local: Capabilities) -> Self {
    Self { local,
           peers: Mutex::new(HashMap::new()) }
  }

  /// Our own announced capabilities
  pub fn local(&self) -> Capabilities {
    self.local
  }

  /// A new connection: start the peer at [`Capabilities::BASE`] and
  /// get the 7.01 announcing our side.
  pub fn on_connect(&self, peer: SocketAddr) -> Message {
    self.peers
        .lock()
        .expect("csm lock poisoned")
        .insert(peer, self.local.min(&Capabilities::BASE));

    let mut csm = Message::new(Type::Non, code::CSM, Id::UNSET, Token::default());
    csm.opts.csm_max_message_size = Some(self.local.max_message_size);
    csm.opts.csm_block_transfer = self.local.block_transfer;
    csm
  }

  /// Merge an inbound 7.01 into what we know about `peer`.
  ///
  /// Merging only ever shrinks the effective capabilities.
  pub fn apply(&self, peer: SocketAddr, csm: &Message) -> Result<Capabilities, Error> {
    if csm.code != code::CSM {
      return Err(Error::Protocol("not a CSM message"));
    }

    let announced_size = csm.opts
                            .csm_max_message_size
                            .unwrap_or(Capabilities::BASE.max_message_size);
    if announced_size < 16 {
      return Err(Error::Protocol("CSM max-message-size below 16"));
    }

    let announced = Capabilities { max_message_size: announced_size,
                                   block_transfer: csm.opts.csm_block_transfer };
    let effective = self.local.min(&announced);

    log::debug!(target: "croak",
                "csm: {} announced {:?}, effective {:?}",
                peer,
                announced,
                effective);

    self.peers
        .lock()
        .expect("csm lock poisoned")
        .insert(peer, effective);
    Ok(effective)
  }

  /// What `peer` can do: the signaled capabilities for stream peers,
  /// the datagram assumption for everyone else.
  pub fn get(&self, peer: SocketAddr) -> Capabilities {
    self.peers
        .lock()
        .expect("csm lock poisoned")
        .get(&peer)
        .copied()
        .unwrap_or(self.local)
  }

  /// Connection gone; forget the peer
  pub fn remove(&self, peer: SocketAddr) {
    self.peers.lock().expect("csm lock poisoned").remove(&peer);
  }

  /// The 7.03 Pong answering a 7.02 Ping
  pub fn pong(ping: &Message) -> Message {
    Message::new(Type::Non, code::PONG, Id::UNSET, ping.token)
  }

  /// The 7.05 Abort we send when a peer breaks the signaling rules
  pub fn abort(why: &str) -> Message {
    let mut abort = Message::new(Type::Non, code::ABORT, Id::UNSET, Token::default());
    abort.payload = why.as_bytes().to_vec();
    abort
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test;

  #[test]
  fn merge_is_monotone_nonincreasing() {
    let local = Capabilities { max_message_size: 501,
                               block_transfer: false };
    let store = CsmStore::new(local);
    let peer = test::addr(1);

    let mut csm = Message::new(Type::Non, code::CSM, Id::UNSET, Token::default());
    csm.opts.csm_max_message_size = Some(10_000);
    csm.opts.csm_block_transfer = true;
    assert_eq!(store.apply(peer, &csm).unwrap(),
               Capabilities { max_message_size: 501,
                              block_transfer: false });

    csm.opts.csm_max_message_size = Some(300);
    csm.opts.csm_block_transfer = false;
    assert_eq!(store.apply(peer, &csm).unwrap(),
               Capabilities { max_message_size: 300,
                              block_transfer: false });
  }

  #[test]
  fn connect_assumes_base_until_csm() {
    let local = Capabilities { max_message_size: 4096,
                               block_transfer: true };
    let store = CsmStore::new(local);
    let peer = test::addr(1);

    let announcement = store.on_connect(peer);
    assert_eq!(announcement.code, code::CSM);
    assert_eq!(announcement.opts.csm_max_message_size, Some(4096));
    assert!(announcement.opts.csm_block_transfer);

    // peer hasn't signaled yet: base assumptions bound it
    assert_eq!(store.get(peer),
               Capabilities { max_message_size: 1152,
                              block_transfer: false });
  }

  #[test]
  fn datagram_peers_resolve_to_local_assumption() {
    let local = Capabilities { max_message_size: 1152,
                               block_transfer: true };
    let store = CsmStore::new(local);
    assert_eq!(store.get(test::addr(9)), local);
  }

  #[test]
  fn malformed_csm_is_a_protocol_error() {
    let store = CsmStore::new(Capabilities::BASE);
    let mut csm = Message::new(Type::Non, code::CSM, Id::UNSET, Token::default());
    csm.opts.csm_max_message_size = Some(4);
    assert_eq!(store.apply(test::addr(1), &csm),
               Err(Error::Protocol("CSM max-message-size below 16")));
  }

  #[test]
  fn bert_kicks_in_above_base_size() {
    let caps = Capabilities { max_message_size: 10_000,
                              block_transfer: true };
    assert_eq!(caps.block_size(), Some(BlockSize::Bert));
    assert_eq!(caps.max_outbound_payload_size(), 8 * 1024);

    let small = Capabilities { max_message_size: 1152,
                               block_transfer: true };
    assert_eq!(small.block_size(), Some(BlockSize::S1024));
    assert_eq!(small.max_outbound_payload_size(), 1024);

    let none = Capabilities { max_message_size: 1152,
                              block_transfer: false };
    assert_eq!(none.block_size(), None);
  }
}
