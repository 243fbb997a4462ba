//! Client-side observation relations (RFC 7641).
//!
//! The registry maps tokens to relations. Each delivery (one
//! notification) resolves the relation's promise and removes the
//! relation; a consumer that wants to keep observing re-subscribes
//! with the same token before the next notification lands, which the
//! single-threaded dispatch loop makes race-free.

use core::fmt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::exchange::Outgoing;
use crate::msg::{code, Block, Id, Message, Token, Type};
use crate::net::Addrd;
use crate::promise::Promise;
use crate::provision::ProvisionTokens;
use crate::service::SharedService;

struct Relation {
  path: String,
  promise: Promise<Addrd<Message>>,
}

/// Token-keyed registry of live observations
pub struct Observations {
  relations: Mutex<HashMap<Token, Relation>>,
  tokens: Arc<dyn ProvisionTokens>,
}

impl fmt::Debug for Observations {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Observations")
     .field("len", &self.len())
     .finish()
  }
}

impl Observations {
  /// An empty registry; `tokens` supplies the fresh token a block-wise
  /// refetch request goes out under
  pub fn new(tokens: Arc<dyn ProvisionTokens>) -> Self {
    Self { relations: Mutex::new(HashMap::new()),
           tokens }
  }

  /// How many relations are live
  pub fn len(&self) -> usize {
    self.relations
        .lock()
        .expect("observe lock poisoned")
        .len()
  }

  /// Is the registry empty?
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Register interest in the next notification for `token`.
  ///
  /// A relation already registered under that token is replaced and
  /// its promise cancelled.
  pub fn subscribe(&self, token: Token, path: &str) -> Promise<Addrd<Message>> {
    let promise = Promise::new();
    let previous = self.relations
                       .lock()
                       .expect("observe lock poisoned")
                       .insert(token,
                               Relation { path: path.to_string(),
                                          promise: promise.clone() });

    if let Some(previous) = previous {
      log::debug!(target: "croak",
                  "observe: replacing relation under {:?}",
                  token);
      previous.promise.cancel();
    }

    promise
  }

  /// Is a relation registered under `token`?
  pub fn is_registered(&self, token: Token) -> bool {
    self.relations
        .lock()
        .expect("observe lock poisoned")
        .contains_key(&token)
  }

  /// Drop (and cancel) the relation under `token`
  pub fn unsubscribe(&self, token: Token) -> bool {
    let removed = self.relations
                      .lock()
                      .expect("observe lock poisoned")
                      .remove(&token);
    match removed {
      | Some(relation) => {
        relation.promise.cancel();
        true
      },
      | None => false,
    }
  }

  /// Deliver a notification.
  ///
  /// Returns whether a relation claimed it; an unclaimed notification
  /// is the dispatcher's cue to RST. A notification without an
  /// Observe option or with a non-2.xx code is terminal and delivered
  /// as-is. A notification carrying only its first block is completed
  /// through `refetch` (a GET for everything after block zero) before
  /// delivery.
  pub fn notify(&self,
                note: Addrd<Message>,
                refetch: &SharedService<Outgoing, Addrd<Message>>)
                -> bool {
    let token = note.data().token;
    let relation = self.relations
                       .lock()
                       .expect("observe lock poisoned")
                       .remove(&token);
    let Some(relation) = relation else {
      return false;
    };

    let terminal = note.data().opts.observe.is_none() || !note.data().code.is_success();
    if terminal {
      log::debug!(target: "croak",
                  "observe: relation under {:?} ended with {}",
                  token,
                  note.data().code);
      relation.promise.complete(Ok(note));
      return true;
    }

    match note.data().opts.block2 {
      | Some(block2) if block2.num == 0 && block2.more => {
        if !crate::block::chunk_len_valid(note.data().payload.len(), &block2) {
          relation.promise
                  .fail(Error::Protocol("notification payload does not match block size"));
          return true;
        }
        Self::fetch_rest(relation, note, block2, self.tokens.next_token(), refetch);
        true
      },
      | _ => {
        relation.promise.complete(Ok(note));
        true
      },
    }
  }

  /// A blocked notification only carries block zero; fetch the rest
  /// with a plain GET starting at block one and deliver the
  /// concatenation, provided the representation did not change under
  /// us.
  fn fetch_rest(relation: Relation,
                note: Addrd<Message>,
                block2: Block,
                token: Token,
                refetch: &SharedService<Outgoing, Addrd<Message>>) {
    let mut req = Message::new(Type::Con, code::GET, Id::UNSET, token);
    req.opts.uri_path = relation.path.clone();
    req.opts.block2 = Some(Block::new(1, block2.size, false));

    let promise = relation.promise;
    let first_etag = note.data().opts.etag.clone();
    let peer = note.addr();

    // continues a delivery already underway; exempt from the cap like
    // any other block continuation
    refetch.apply(Outgoing::block(Addrd(req, peer)))
           .on_complete(move |result| match result {
             | Ok(rest) if rest.data().code == code::CONTENT => {
               if rest.data().opts.etag != first_etag {
                 promise.fail(Error::Protocol("notification changed while fetching its blocks"));
                 return;
               }

               let mut full = note;
               full.data_mut()
                   .payload
                   .extend_from_slice(&rest.data().payload);
               full.data_mut().opts.block2 = None;
               promise.complete(Ok(full));
             },
             | Ok(_) => {
               promise.fail(Error::Protocol("unexpected code fetching notification blocks"));
             },
             | Err(e) => {
               promise.fail(e);
             },
           });
  }

  /// Cancel every relation; used at shutdown
  pub fn cancel_all(&self) {
    let relations = {
      let mut map = self.relations.lock().expect("observe lock poisoned");
      map.drain().map(|(_, relation)| relation).collect::<Vec<_>>()
    };
    for relation in relations {
      relation.promise.cancel();
    }
  }
}
