//! The middleware seam the engine is built along.
//!
//! Instead of an inheritance chain, each concern (deduplication,
//! block-wise transfer, transaction management) is a [`Service`]
//! wrapping an inner one. The pipelines are composed once at
//! [`crate::core::Core::new`] and never change shape afterwards.

use std::sync::Arc;

use crate::promise::Promise;

/// One stage of a request pipeline.
///
/// `apply` must not block; long-lived work resolves the returned
/// promise later.
pub trait Service<Req, Res>: Send + Sync {
  /// Feed one request through this stage
  fn apply(&self, req: Req) -> Promise<Res>;
}

/// A shareable, type-erased [`Service`]
pub type SharedService<Req, Res> = Arc<dyn Service<Req, Res>>;

impl<Req, Res, F> Service<Req, Res> for F where F: Fn(Req) -> Promise<Res> + Send + Sync
{
  fn apply(&self, req: Req) -> Promise<Res> {
    self(req)
  }
}

/// Lift a closure into a [`SharedService`]
pub fn service_fn<Req, Res, F>(f: F) -> SharedService<Req, Res>
  where F: Fn(Req) -> Promise<Res> + Send + Sync + 'static,
        Req: 'static,
        Res: 'static
{
  Arc::new(f)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn closures_are_services() {
    let double = service_fn(|n: u32| Promise::resolved(Ok(n * 2)));
    assert_eq!(double.apply(21).try_get(), Some(Ok(42)));
  }
}
