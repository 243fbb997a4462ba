//! Message-id and token generation.
//!
//! Both are injectable so tests (and embedders with their own
//! uniqueness story, e.g. ids partitioned across shards) can replace
//! them wholesale.

use std::net::SocketAddr;
use std::sync::Mutex;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::msg::{Id, Token};

/// Source of fresh message ids.
///
/// Ids only need to be unique per peer within the exchange lifetime,
/// which is why the peer address is offered; the default
/// implementation ignores it and keeps one rolling sequence.
pub trait ProvisionIds: Send + Sync {
  /// A message id not currently in use with `peer`
  fn next_id(&self, peer: SocketAddr) -> Id;
}

/// Source of fresh tokens
pub trait ProvisionTokens: Send + Sync {
  /// A token no live exchange is using
  fn next_token(&self) -> Token;
}

#[derive(Debug)]
struct SeededState {
  next_id: u16,
  rng: ChaCha8Rng,
}

/// The default provisioner: a ChaCha8-seeded rolling id sequence and
/// random 8-byte tokens.
#[derive(Debug)]
pub struct Seeded {
  state: Mutex<SeededState>,
}

impl Seeded {
  /// Create a provisioner from a seed
  pub fn new(seed: u64) -> Self {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let next_id = rng.gen();
    Self { state: Mutex::new(SeededState { next_id, rng }) }
  }
}

impl ProvisionIds for Seeded {
  fn next_id(&self, _peer: SocketAddr) -> Id {
    let mut state = self.state.lock().expect("provisioner lock poisoned");

    // Id(0) stays reserved as the "unassigned" placeholder
    if state.next_id == 0 {
      state.next_id = 1;
    }

    let id = Id(state.next_id);
    state.next_id = state.next_id.wrapping_add(1);
    id
  }
}

impl ProvisionTokens for Seeded {
  fn next_token(&self) -> Token {
    let mut state = self.state.lock().expect("provisioner lock poisoned");
    let bytes: [u8; 8] = state.rng.gen();
    Token::opaque(&bytes)
  }
}
