//! The already-decoded CoAP message model the engine operates on.
//!
//! Parsing and serializing the wire format is explicitly somebody
//! else's job; everything here assumes a codec sits between the engine
//! and the socket.

use core::fmt;

use tinyvec::ArrayVec;

/// Options, block descriptors, block sizes
pub mod opt;

pub use opt::{Block, BlockSize, Opts};

/// Message type (RFC 7252 section 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
  /// Confirmable; retransmitted until acknowledged
  Con,
  /// Non-confirmable
  Non,
  /// Acknowledgement
  Ack,
  /// Reset
  Reset,
}

/// A 16-bit message id, scoped to a peer address.
///
/// `Id(0)` is reserved by this engine as "not yet assigned"; the
/// dispatcher fills it from the id provisioner right before transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Id(pub u16);

impl Id {
  /// The placeholder filled in at transmit time
  pub const UNSET: Id = Id(0);
}

/// A 0-8 byte token correlating requests with responses
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token(pub ArrayVec<[u8; 8]>);

impl Token {
  /// Create a token from at most 8 bytes of data.
  ///
  /// Longer slices are truncated.
  pub fn opaque(data: &[u8]) -> Self {
    Self(data.iter().copied().take(8).collect())
  }

  /// The zero-length token
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl fmt::Debug for Token {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Token(0x")?;
    for byte in self.0.iter() {
      write!(f, "{:02x}", byte)?;
    }
    write!(f, ")")
  }
}

/// Message code, e.g. 0.01 GET or 2.05 Content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code {
  /// The class (numbers left of the dot)
  pub class: u8,
  /// The detail (numbers right of the dot)
  pub detail: u8,
}

/// What kind of message a [`Code`] belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
  /// 0.00; ping or empty ACK/RST
  Empty,
  /// 0.01-0.31
  Request,
  /// 2.00-5.31
  Response,
  /// 7.00-7.31; CoAP-over-TCP signaling
  Signaling,
}

impl Code {
  /// Create a code from its class and detail
  pub const fn new(class: u8, detail: u8) -> Self {
    Self { class, detail }
  }

  /// Which kind of message this code belongs on
  pub fn kind(&self) -> CodeKind {
    match (self.class, self.detail) {
      | (0, 0) => CodeKind::Empty,
      | (0, _) => CodeKind::Request,
      | (7, _) => CodeKind::Signaling,
      | _ => CodeKind::Response,
    }
  }

  /// Is this a 2.xx code?
  pub fn is_success(&self) -> bool {
    self.class == 2
  }
}

impl fmt::Display for Code {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{:02}", self.class, self.detail)
  }
}

/// The codes the engine produces or branches on
pub mod code {
  use super::Code;

  /// 0.00
  pub const EMPTY: Code = Code::new(0, 0);
  /// 0.01 GET
  pub const GET: Code = Code::new(0, 1);
  /// 0.02 POST
  pub const POST: Code = Code::new(0, 2);
  /// 0.03 PUT
  pub const PUT: Code = Code::new(0, 3);
  /// 0.04 DELETE
  pub const DELETE: Code = Code::new(0, 4);
  /// 2.01 Created
  pub const CREATED: Code = Code::new(2, 1);
  /// 2.03 Valid
  pub const VALID: Code = Code::new(2, 3);
  /// 2.04 Changed
  pub const CHANGED: Code = Code::new(2, 4);
  /// 2.05 Content
  pub const CONTENT: Code = Code::new(2, 5);
  /// 2.31 Continue
  pub const CONTINUE: Code = Code::new(2, 31);
  /// 4.00 Bad Request
  pub const BAD_REQUEST: Code = Code::new(4, 0);
  /// 4.04 Not Found
  pub const NOT_FOUND: Code = Code::new(4, 4);
  /// 4.08 Request Entity Incomplete
  pub const REQUEST_ENTITY_INCOMPLETE: Code = Code::new(4, 8);
  /// 4.13 Request Entity Too Large
  pub const REQUEST_ENTITY_TOO_LARGE: Code = Code::new(4, 13);
  /// 5.00 Internal Server Error
  pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);
  /// 7.01 CSM
  pub const CSM: Code = Code::new(7, 1);
  /// 7.02 Ping
  pub const PING: Code = Code::new(7, 2);
  /// 7.03 Pong
  pub const PONG: Code = Code::new(7, 3);
  /// 7.04 Release
  pub const RELEASE: Code = Code::new(7, 4);
  /// 7.05 Abort
  pub const ABORT: Code = Code::new(7, 5);
}

/// A decoded CoAP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
  /// Con / Non / Ack / Reset
  pub ty: Type,
  /// Message id; deduplication and ACK/RST correlation
  pub id: Id,
  /// Token; request/response correlation
  pub token: Token,
  /// Message code
  pub code: Code,
  /// Decoded options
  pub opts: Opts,
  /// The payload
  pub payload: Vec<u8>,
}

impl Message {
  /// Create a message with no options and no payload
  pub fn new(ty: Type, code: Code, id: Id, token: Token) -> Self {
    Self { ty,
           id,
           token,
           code,
           opts: Opts::default(),
           payload: Vec::new() }
  }

  /// A CoAP ping is an empty CON.
  pub fn is_ping(&self) -> bool {
    self.ty == Type::Con && self.code.kind() == CodeKind::Empty
  }

  /// Does this message carry a request code?
  pub fn is_request(&self) -> bool {
    self.code.kind() == CodeKind::Request
  }

  /// Does this message carry a response code?
  pub fn is_response(&self) -> bool {
    self.code.kind() == CodeKind::Response
  }

  /// Does this message carry a 7.xx signaling code?
  pub fn is_signaling(&self) -> bool {
    self.code.kind() == CodeKind::Signaling
  }

  /// A separate response is a response carried by CON or NON rather
  /// than piggybacked on an ACK.
  pub fn is_separate_response(&self) -> bool {
    self.is_response() && matches!(self.ty, Type::Con | Type::Non)
  }

  /// The empty ACK acknowledging this message
  pub fn empty_ack(&self) -> Message {
    Message::new(Type::Ack, code::EMPTY, self.id, Token::default())
  }

  /// The RST rejecting this message
  pub fn reset(&self) -> Message {
    Message::new(Type::Reset, code::EMPTY, self.id, Token::default())
  }

  /// Start a response to this request.
  ///
  /// CON requests get the response piggybacked on their ACK; NON
  /// requests get a NON response whose id is assigned at transmit
  /// time. The token is copied either way.
  pub fn response(&self, code: Code) -> Message {
    match self.ty {
      | Type::Con => Message::new(Type::Ack, code, self.id, self.token),
      | _ => Message::new(Type::Non, code, Id::UNSET, self.token),
    }
  }
}
