use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{PoolError, TimeoutType, UsageError};
use crate::events::EventSink;
use crate::managed::Managed;

/// The pool-side half of a [`ResourceRequest`]: owns the one-shot
/// sender and the exactly-once latch. Cloned (via `Arc`) between the
/// pool's request queue and the `ResourceRequest` handle returned to
/// the caller so either side can fulfil or abort it.
pub(crate) struct Fulfiller<T, E> {
    id: u64,
    created_at: Instant,
    fulfilled: AtomicBool,
    sender: StdMutex<Option<oneshot::Sender<Result<Managed<T>, PoolError<E>>>>>,
    timer: StdMutex<Option<JoinHandle<()>>>,
    events: std::sync::Arc<EventSink<E>>,
}

impl<T, E> Fulfiller<T, E>
where
    T: Send + 'static,
    E: Clone + std::fmt::Display + Send + Sync + 'static,
{
    fn complete(&self, result: Result<Managed<T>, PoolError<E>>) {
        if self
            .fulfilled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Already terminal: a redundant resolve/reject only emits
            // an `error` event, never a second callback.
            self.events.error(PoolError::Usage(UsageError::RedundantFulfill));
            return;
        }
        self.cancel_timer();
        let sender = self.sender.lock().unwrap().take();
        if let Some(sender) = sender {
            // A dropped receiver (the caller gave up on the future
            // without calling `abort`) is not an error condition.
            let _ = sender.send(result);
        }
    }

    pub(crate) fn resolve(&self, resource: Managed<T>) {
        self.complete(Ok(resource));
    }

    pub(crate) fn reject(&self, err: PoolError<E>) {
        self.complete(Err(err));
    }

    pub(crate) fn abort(&self, reason: Option<String>) {
        self.complete(Err(PoolError::aborted(reason)));
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.fulfilled.load(Ordering::Acquire)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Arm the timer against the absolute deadline `created_at +
    /// timeout`, not against "now" — matches the `createdAt + d`
    /// deadline semantics `set_timeout` must honor even when called
    /// well after construction. If that deadline has already passed,
    /// the remaining sleep is zero and rejection happens on the next
    /// scheduler tick rather than synchronously.
    fn arm_timer(self: &std::sync::Arc<Self>, timeout: Duration) {
        self.cancel_timer();
        let remaining = self
            .created_at
            .checked_add(timeout)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            this.reject(PoolError::Timeout(TimeoutType::Request, timeout));
        });
        *self.timer.lock().unwrap() = Some(handle);
    }

    /// Replace the deadline with `created_at + timeout`. `None`
    /// cancels the timer outright, leaving the request with no
    /// deadline. If the new deadline is already past, rejection is
    /// scheduled on the next tick rather than happening synchronously.
    pub(crate) fn set_timeout(self: &std::sync::Arc<Self>, timeout: Option<Duration>) {
        match timeout {
            Some(d) => self.arm_timer(d),
            None => self.cancel_timer(),
        }
    }

    pub(crate) fn clear_timeout(&self) {
        self.cancel_timer();
    }
}

/// A one-shot, timeout-aware result carrier returned by
/// [`Pool::acquire`](crate::Pool::acquire). Awaiting it yields the
/// resource once the pool fulfils the request; calling
/// [`abort`](ResourceRequest::abort) cancels it early.
///
/// `ResourceRequest` is a public handle: it can be awaited for its
/// result and independently aborted by whoever holds it, decoupling
/// the caller from the pool's internal dispatch timing.
pub struct ResourceRequest<T, E> {
    id: u64,
    fulfiller: std::sync::Arc<Fulfiller<T, E>>,
    receiver: oneshot::Receiver<Result<Managed<T>, PoolError<E>>>,
}

impl<T, E> ResourceRequest<T, E>
where
    T: Send + 'static,
    E: Clone + std::fmt::Display + Send + Sync + 'static,
{
    pub(crate) fn new(
        id: u64,
        timeout: Option<Duration>,
        events: std::sync::Arc<EventSink<E>>,
    ) -> (std::sync::Arc<Fulfiller<T, E>>, Self) {
        let (sender, receiver) = oneshot::channel();
        let fulfiller = std::sync::Arc::new(Fulfiller {
            id,
            created_at: Instant::now(),
            fulfilled: AtomicBool::new(false),
            sender: StdMutex::new(Some(sender)),
            timer: StdMutex::new(None),
            events,
        });
        if let Some(d) = timeout {
            fulfiller.arm_timer(d);
        }
        (
            fulfiller.clone(),
            ResourceRequest {
                id,
                fulfiller,
                receiver,
            },
        )
    }

    /// The request's monotonic id, assigned at `acquire` time.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once this request has resolved, rejected, or been
    /// aborted. A terminal request will never yield a value through
    /// `Future::poll` other than the one it already settled on.
    pub fn is_terminal(&self) -> bool {
        self.fulfiller.is_terminal()
    }

    /// Terminate this request early. `reason` becomes part of the
    /// rejection message (`"aborted: <reason or 'No reason given'>"`).
    /// Idempotent: aborting a request that already settled has no
    /// effect beyond an `error` event.
    pub fn abort(&self, reason: Option<String>) {
        self.fulfiller.abort(reason);
    }

    /// Replace this request's deadline. Passing `None` removes it
    /// entirely (an infinite deadline).
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.fulfiller.set_timeout(timeout);
    }

    /// Cancel this request's deadline without otherwise changing its
    /// state.
    pub fn clear_timeout(&self) {
        self.fulfiller.clear_timeout();
    }
}

impl<T, E> Future for ResourceRequest<T, E> {
    type Output = Result<Managed<T>, PoolError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // All fields are Unpin (Arc, u64, oneshot::Receiver), so
        // projecting through get_mut is sound without pin-project.
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The sender was dropped without completing, which this
            // crate never does in practice (the pool always resolves,
            // rejects, or the request's own timer rejects it), but a
            // defensive fallback keeps the Future total.
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::Closed(
                crate::error::ClosedReason::Destroyed,
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}
