//! `croak` is a transport-agnostic CoAP message-exchange engine.
//!
//! It owns the middle of the protocol: everything between "a decoded
//! message arrived" and "the application saw a request / the caller's
//! promise resolved". That covers:
//! - reliability ([RFC 7252](https://datatracker.ietf.org/doc/html/rfc7252)):
//!   CON retransmission with jittered exponential backoff, piggybacked
//!   and separate responses, duplicate detection and replay
//! - block-wise transfers ([RFC 7959](https://datatracker.ietf.org/doc/html/rfc7959)),
//!   including BERT blocks and capability negotiation for
//!   connection-oriented transports ([RFC 8323](https://datatracker.ietf.org/doc/html/rfc8323))
//! - client-side observe relations ([RFC 7641](https://datatracker.ietf.org/doc/html/rfc7641))
//!
//! It deliberately does not own the wire: you bring a
//! [`net::Transport`] that moves already-decoded [`msg::Message`]s,
//! and a read loop that feeds [`core::Core::on_receive`] and calls
//! [`core::Core::tick`] periodically. Everything asynchronous is
//! expressed as a [`promise::Promise`], and the processing pipelines
//! are stacks of [`service::Service`]s, so behavior is added by
//! wrapping, not by subclassing.

// -
// deny
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![deny(missing_copy_implementations)]
#![cfg_attr(not(test), deny(unsafe_code))]
// -
// warnings
#![cfg_attr(not(test), warn(unreachable_pub))]


/// Block-wise transfers (RFC 7959 / RFC 8323 BERT)
pub mod block;

/// Engine configuration
pub mod config;

/// The dispatcher that ties everything together
pub mod core;

/// Capabilities & settings exchange for connection-oriented
/// transports (RFC 8323)
pub mod csm;

/// Duplicate detection & response replay
pub mod dedup;

/// Errors
pub mod error;

/// The transaction registry: matching responses to requests
pub mod exchange;

/// Messages, codes, options
pub mod msg;

/// Addressed data & the transport seam
pub mod net;

/// Client-side observe relations (RFC 7641)
pub mod observe;

/// Completion promises
pub mod promise;

/// Message-id and token provisioning
pub mod provision;

/// Customizable retrying of fallible operations
pub mod retry;

/// The middleware seam
pub mod service;

/// `std` clock
pub mod std;

/// Clocks & timestamps
pub mod time;
