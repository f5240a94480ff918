use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

/// Sync-callable half of releasing a resource back to its pool, so
/// [`Managed::drop`] can trigger it without needing `async fn drop`.
/// Implemented by `PoolInner<T, E>`; type-erased here so `Managed<T>`
/// does not need to carry the pool's error type `E`. Takes `Arc<Self>`
/// rather than `&self` so the implementation can spawn a task that
/// outlives this call without needing its own separately-held handle.
pub(crate) trait ReleaseSink<T>: Send + Sync {
    fn release(self: Arc<Self>, id: u64, value: T);
}

/// A resource on loan from a [`Pool`](crate::Pool).
///
/// `Deref`/`DerefMut` make it transparent to use as `&T`/`&mut T`, and
/// dropping it returns the resource to the pool automatically. Prefer
/// the explicit [`Pool::release`](crate::Pool::release)/
/// [`Pool::remove`](crate::Pool::remove)/
/// [`Pool::destroy`](crate::Pool::destroy) methods when you need to
/// distinguish a graceful release from a forced teardown; a bare
/// `drop` always performs a graceful release.
pub struct Managed<T> {
    value: Option<T>,
    id: u64,
    sink: Weak<dyn ReleaseSink<T>>,
}

impl<T> Managed<T> {
    pub(crate) fn new(id: u64, value: T, sink: Weak<dyn ReleaseSink<T>>) -> Self {
        Managed {
            value: Some(value),
            id,
            sink,
        }
    }

    /// The id the pool allocated for this resource on insertion, used
    /// to track it independent of any structural equality on `T`.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Take the resource out, detaching it from automatic release.
    /// Used internally by `remove`/`destroy`, which take ownership of
    /// the value to hand to the user's teardown operation.
    pub(crate) fn take(mut self) -> (u64, T) {
        let value = self.value.take().expect("Managed value taken twice");
        let id = self.id;
        // Prevent Drop from also releasing: value is None, drop is a no-op.
        (id, value)
    }
}

impl<T> Deref for Managed<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().expect("Managed used after release")
    }
}

impl<T> DerefMut for Managed<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("Managed used after release")
    }
}

impl<T: fmt::Debug> fmt::Debug for Managed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Managed")
            .field("id", &self.id)
            .field("value", &self.value)
            .finish()
    }
}

impl<T> Drop for Managed<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            if let Some(sink) = self.sink.upgrade() {
                sink.release(self.id, value);
            }
            // If the pool is already gone there is nowhere to return
            // the resource to; it is simply dropped along with `self`,
            // which is the correct behavior once DESTROYED has already
            // torn down every resource it knew about.
        }
    }
}
