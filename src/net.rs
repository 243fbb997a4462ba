use std::net::SocketAddr;

use crate::error::Error;
use crate::msg::Message;

/// Data that came from (or is headed to) a network peer
#[derive(PartialEq, Eq, Hash, Debug, Clone)]
pub struct Addrd<T>(pub T, pub SocketAddr);

impl<T> Addrd<T> {
  /// Borrow the contents of this Addressed
  pub fn as_ref(&self) -> Addrd<&T> {
    Addrd(self.data(), self.addr())
  }

  /// Discard the address and get the data in this Addressed
  pub fn unwrap(self) -> T {
    self.0
  }

  /// Map the data contained in this Addressed
  pub fn map<R>(self, f: impl FnOnce(T) -> R) -> Addrd<R> {
    Addrd(f(self.0), self.1)
  }

  /// Map the data contained in this Addressed (with a copy of the address)
  pub fn map_with_addr<R>(self, f: impl FnOnce(T, SocketAddr) -> R) -> Addrd<R> {
    Addrd(f(self.0, self.1), self.1)
  }

  /// Borrow the contents of the addressed item
  pub fn data(&self) -> &T {
    &self.0
  }

  /// Mutably borrow the contents of the addressed item
  pub fn data_mut(&mut self) -> &mut T {
    &mut self.0
  }

  /// Copy the address for the data
  pub fn addr(&self) -> SocketAddr {
    self.1
  }

  /// Turn the entire structure into something else
  pub fn fold<R>(self, f: impl FnOnce(T, SocketAddr) -> R) -> R {
    f(self.0, self.1)
  }
}

impl<T> AsMut<T> for Addrd<T> {
  fn as_mut(&mut self) -> &mut T {
    &mut self.0
  }
}

/// The seam between the engine and whatever moves bytes.
///
/// The engine only ever writes; inbound messages are fed to
/// [`crate::core::Core::on_receive`] by the embedder's read loop.
/// Implementations sit on top of the wire codec, so they accept
/// decoded [`Message`]s rather than datagrams.
pub trait Transport: Send + Sync {
  /// Serialize and transmit one message to its address.
  ///
  /// Failures map to [`Error::Transport`] and fail the exchange the
  /// message belonged to.
  fn transmit(&self, msg: &Addrd<Message>) -> Result<(), Error>;

  /// Stream transports (TCP, websockets) carry CSM signaling and
  /// skip message-id deduplication; datagram transports are the
  /// opposite.
  fn is_connection_oriented(&self) -> bool;
}
