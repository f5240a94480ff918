use async_trait::async_trait;

use crate::error::RecycleResult;

/// The four user-supplied operations a [`Pool`](crate::Pool) drives:
/// `create`, `recycle` (a.k.a. dispose/release), `ping`, and `destroy`.
///
/// Only `create` and `recycle` are required; `ping` defaults to always
/// succeeding and `destroy` defaults to a no-op.
#[async_trait]
pub trait Manager<T, E>: Send + Sync {
    /// Create a new instance of `T`. Called by the pool whenever it
    /// needs to grow (initial fill, `min` top-up, or to serve a queued
    /// request it cannot satisfy from the available set).
    async fn create(&self) -> Result<T, E>;

    /// Try to recycle (gracefully dispose of) an instance of `T`. Runs
    /// whenever a resource is removed from the pool: idle reap,
    /// explicit `remove`, or pool shutdown.
    async fn recycle(&self, obj: &mut T) -> RecycleResult<E>;

    /// Health-check a resource immediately before handing it to a
    /// consumer. Defaults to always succeeding.
    async fn ping(&self, _obj: &mut T) -> RecycleResult<E> {
        Ok(())
    }

    /// Forcefully and unconditionally tear down a resource, fire and
    /// forget. Defaults to a no-op. Errors are only ever logged
    /// (`warn`), never propagated.
    async fn destroy(&self, _obj: T) {}
}
