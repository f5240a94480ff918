use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::PoolError;

/// A pool's lifecycle, as a stream of typed events rather than named
/// callbacks: admissions, requeues after a failed ping, drains, and
/// both recoverable and fatal problems.
///
/// Subscribe with [`Pool::subscribe`](crate::Pool::subscribe). Every
/// variant is also mirrored to a `tracing` event at the same call
/// site, so nothing is silently lost if nobody subscribes.
#[derive(Debug, Clone)]
pub enum PoolEvent<E> {
    /// A new `ResourceRequest` was admitted to the queue.
    Request {
        /// The request's monotonic id.
        request_id: u64,
    },
    /// A resource failed its pre-use ping and was torn down; the
    /// request that triggered the ping remains queued at the head.
    Requeue {
        /// The request's monotonic id.
        request_id: u64,
    },
    /// The request queue became empty.
    Drain,
    /// A recoverable problem (ping failure, non-initial factory error,
    /// teardown failure, destroy panic) that did not change pool
    /// status.
    Warn(Arc<PoolWarning<E>>),
    /// A fatal or usage problem.
    Error(Arc<PoolError<E>>),
}

/// Non-fatal problems surfaced via [`PoolEvent::Warn`].
#[derive(Debug)]
pub enum PoolWarning<E> {
    /// `Manager::ping` failed or timed out.
    PingFailed(String),
    /// `Manager::create` failed while the pool was already `Live`.
    FactoryFailed(E),
    /// `Manager::recycle` failed; `destroy` was used as a fallback.
    TeardownFailed(String),
    /// `Manager::destroy` itself failed or panicked.
    DestroyFailed(String),
}

impl<E: fmt::Display> fmt::Display for PoolWarning<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolWarning::PingFailed(m) => write!(f, "ping failed: {m}"),
            PoolWarning::FactoryFailed(e) => write!(f, "factory failed: {e}"),
            PoolWarning::TeardownFailed(m) => write!(f, "teardown failed: {m}"),
            PoolWarning::DestroyFailed(m) => write!(f, "destroy failed: {m}"),
        }
    }
}

/// Internal broadcast-backed event sink shared by `Pool` and `Cluster`.
pub(crate) struct EventSink<E> {
    sender: broadcast::Sender<PoolEvent<E>>,
}

impl<E> EventSink<E>
where
    E: Clone,
{
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        EventSink { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PoolEvent<E>> {
        self.sender.subscribe()
    }

    pub(crate) fn emit(&self, event: PoolEvent<E>) {
        // No subscribers is the common case; a send error here just
        // means nobody is listening on the typed channel, which is
        // fine as long as the tracing mirror below still fires.
        let _ = self.sender.send(event);
    }
}

impl<E> EventSink<E>
where
    E: Clone + fmt::Display,
{
    pub(crate) fn request(&self, request_id: u64) {
        tracing::trace!(request_id, "resource request admitted");
        self.emit(PoolEvent::Request { request_id });
    }

    pub(crate) fn requeue(&self, request_id: u64) {
        tracing::debug!(request_id, "resource requeued after failed ping");
        self.emit(PoolEvent::Requeue { request_id });
    }

    pub(crate) fn drain(&self) {
        tracing::trace!("request queue drained");
        self.emit(PoolEvent::Drain);
    }

    pub(crate) fn warn(&self, warning: PoolWarning<E>) {
        tracing::warn!(%warning, "pool warning");
        self.emit(PoolEvent::Warn(Arc::new(warning)));
    }

    pub(crate) fn error(&self, error: PoolError<E>) {
        tracing::error!(%error, "pool error");
        self.emit(PoolEvent::Error(Arc::new(error)));
    }
}
