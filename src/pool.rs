use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::{Backoff, ExponentialBackoff, PoolConfig};
use crate::error::{ClosedReason, ConfigError, PoolError, RecycleError, TimeoutType, UsageError};
use crate::events::{EventSink, PoolEvent, PoolWarning};
use crate::managed::{Managed, ReleaseSink};
use crate::manager::Manager;
use crate::request::{Fulfiller, ResourceRequest};

/// Bound satisfied by any error type this crate can carry through a
/// [`Pool`]: needs to be reported (`Display`/`Debug`), broadcast to
/// multiple event subscribers (`Clone`), and moved across the tasks
/// the pool spawns internally (`Send + Sync + 'static`).
pub trait ResourceError: fmt::Debug + fmt::Display + Clone + Send + Sync + 'static {}
impl<E: fmt::Debug + fmt::Display + Clone + Send + Sync + 'static> ResourceError for E {}

/// Pool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No factory call has yet succeeded.
    Initial,
    /// At least one factory call has succeeded; normal operation.
    Live,
    /// `end()` was called; draining to zero resources.
    Ending,
    /// Fully torn down. No further acquisitions are possible.
    Destroyed,
}

/// A snapshot of pool occupancy, returned by [`Pool::stats`].
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    /// Configured minimum pool size.
    pub min: usize,
    /// Configured maximum pool size.
    pub max: usize,
    /// `idle + checked_out`: every resource currently owned by the pool.
    pub allocated: usize,
    /// `max - checked_out`: remaining headroom including idle
    /// resources available for loan; prefer `allocated`/`queued`/`max`
    /// for unambiguous accounting.
    pub available: usize,
    /// Number of requests currently queued (not yet fulfilled).
    pub queued: usize,
    /// Configured request queue cap, if any.
    pub max_requests: Option<usize>,
}

struct IdleEntry<T> {
    id: u64,
    value: T,
    idle_since: Instant,
}

struct PoolState<T, E> {
    status: Status,
    live: bool,
    idle: VecDeque<IdleEntry<T>>,
    checked_out: HashSet<u64>,
    acquiring: usize,
    requests: VecDeque<Arc<Fulfiller<T, E>>>,
    outstanding_teardowns: usize,
    teardown_errors: Vec<String>,
    initial_started: Instant,
    initial_attempt: u32,
    backoff: Box<dyn Backoff>,
}

pub(crate) struct PoolInner<T, E> {
    manager: Arc<dyn Manager<T, E>>,
    pub(crate) config: PoolConfig,
    pub(crate) events: Arc<EventSink<E>>,
    state: Mutex<PoolState<T, E>>,
    dispatch_active: AtomicBool,
    redispatch_requested: AtomicBool,
    next_id: AtomicU64,
    progress: Notify,
    sync_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl<T, E> PoolInner<T, E> {
    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn cancel_sync_timer(&self) {
        if let Some(handle) = self.sync_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl<T, E> ReleaseSink<T> for PoolInner<T, E>
where
    T: Send + 'static,
    E: ResourceError,
{
    fn release(self: Arc<Self>, id: u64, value: T) {
        tokio::spawn(async move {
            release_internal(self, id, value).await;
        });
    }
}

/// A generic, async resource pool.
///
/// Cloning a `Pool` is cheap: it is an `Arc` handle over shared
/// state, and every clone refers to the same underlying pool.
pub struct Pool<T, E> {
    pub(crate) inner: Arc<PoolInner<T, E>>,
}

impl<T, E> Clone for Pool<T, E> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Pool<T, E>
where
    T: Send + 'static,
    E: ResourceError,
{
    /// Construct a pool with default configuration and the given `max`.
    pub fn new(manager: impl Manager<T, E> + 'static, max: usize) -> Result<Self, ConfigError> {
        Self::from_config(manager, PoolConfig::new(max))
    }

    /// Construct a pool from an explicit, validated [`PoolConfig`],
    /// retrying a failing factory with the default [`ExponentialBackoff`].
    /// Use [`from_config_with_backoff`](Pool::from_config_with_backoff)
    /// to supply a different retry policy.
    pub fn from_config(
        manager: impl Manager<T, E> + 'static,
        config: PoolConfig,
    ) -> Result<Self, ConfigError> {
        Self::from_config_with_backoff(manager, config, Box::new(ExponentialBackoff::default()))
    }

    /// Construct a pool from an explicit, validated [`PoolConfig`] and
    /// a caller-supplied [`Backoff`] generator, consulted while the
    /// pool is `Initial` and the factory keeps failing.
    pub fn from_config_with_backoff(
        manager: impl Manager<T, E> + 'static,
        config: PoolConfig,
        backoff: Box<dyn Backoff>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let inner = Arc::new(PoolInner {
            manager: Arc::new(manager),
            events: Arc::new(EventSink::new()),
            state: Mutex::new(PoolState {
                status: Status::Initial,
                live: false,
                idle: VecDeque::new(),
                checked_out: HashSet::new(),
                acquiring: 0,
                requests: VecDeque::new(),
                outstanding_teardowns: 0,
                teardown_errors: Vec::new(),
                initial_started: Instant::now(),
                initial_attempt: 0,
                backoff,
            }),
            config,
            dispatch_active: AtomicBool::new(false),
            redispatch_requested: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            progress: Notify::new(),
            sync_handle: StdMutex::new(None),
        });
        if let Some(interval) = inner.config.sync_interval {
            let handle = tokio::spawn(sync_loop(inner.clone(), interval));
            *inner.sync_handle.lock().unwrap() = Some(handle);
        }
        tokio::spawn(ensure_minimum(inner.clone()));
        Ok(Pool { inner })
    }

    /// Submit a request for a resource, with no capability requirement.
    ///
    /// Returns a [`ResourceRequest`] immediately; await it to obtain
    /// the resource (or abort it to cancel early).
    pub async fn acquire(&self) -> Result<ResourceRequest<T, E>, PoolError<E>> {
        self.acquire_matching(None).await
    }

    /// Submit a request for a resource, requiring this pool's declared
    /// `capabilities` be a superset of `capability`. Mainly useful when
    /// driving a `Pool` directly the same way a [`Cluster`](crate::Cluster)
    /// would.
    pub async fn acquire_matching(
        &self,
        capability: Option<&HashSet<String>>,
    ) -> Result<ResourceRequest<T, E>, PoolError<E>> {
        if let Some(cap) = capability {
            if !self.inner.config.capabilities.is_superset(cap) {
                return Err(PoolError::NoCapableMatch);
            }
        }
        let id = {
            let st = self.inner.state.lock().await;
            match st.status {
                Status::Ending => return Err(PoolError::Closed(ClosedReason::Ending)),
                Status::Destroyed => return Err(PoolError::Closed(ClosedReason::Destroyed)),
                _ => {}
            }
            if let Some(max_requests) = self.inner.config.max_requests {
                if st.requests.len() >= max_requests {
                    return Err(PoolError::Usage(UsageError::PoolFull));
                }
            }
            self.inner.alloc_id()
        };
        let (fulfiller, request) = ResourceRequest::new(
            id,
            self.inner.config.request_timeout,
            self.inner.events.clone(),
        );
        {
            let mut st = self.inner.state.lock().await;
            st.requests.push_back(fulfiller);
        }
        self.inner.events.request(id);
        trigger_dispatch(&self.inner);
        Ok(request)
    }

    /// Explicitly release a resource back to the pool. Equivalent to
    /// dropping the [`Managed`] handle; spelled out for callers who
    /// want the intent visible at the call site.
    pub fn release(&self, managed: Managed<T>) {
        drop(managed);
    }

    /// Gracefully remove a resource the caller is holding: runs the
    /// manager's `recycle` (falling back to `destroy` on timeout), and
    /// tops the pool back up toward `min` if still live.
    pub async fn remove(&self, managed: Managed<T>) -> Result<(), String> {
        let (id, value) = managed.take();
        {
            let mut st = self.inner.state.lock().await;
            st.checked_out.remove(&id);
        }
        let outcome = teardown(&self.inner, id, value).await;
        let live = matches!(self.inner.state.lock().await.status, Status::Live);
        if live {
            ensure_minimum(self.inner.clone()).await;
        }
        outcome
    }

    /// Forcefully tear down a resource the caller is holding,
    /// bypassing `recycle` entirely. Fire-and-forget: the user
    /// `destroy` operation's failures only ever surface as a warning.
    pub async fn destroy(&self, managed: Managed<T>) {
        let (id, value) = managed.take();
        {
            let mut st = self.inner.state.lock().await;
            st.checked_out.remove(&id);
        }
        destroy_now(&self.inner, value).await;
        self.inner.progress.notify_waiters();
        let live = matches!(self.inner.state.lock().await.status, Status::Live);
        if live {
            ensure_minimum(self.inner.clone()).await;
        }
    }

    /// Current occupancy snapshot.
    pub async fn stats(&self) -> Stats {
        let st = self.inner.state.lock().await;
        let allocated = st.idle.len() + st.checked_out.len();
        Stats {
            min: self.inner.config.min,
            max: self.inner.config.max,
            allocated,
            available: self.inner.config.max.saturating_sub(st.checked_out.len()),
            queued: st.requests.len(),
            max_requests: self.inner.config.max_requests,
        }
    }

    /// Current lifecycle status.
    pub async fn status(&self) -> Status {
        self.inner.state.lock().await.status
    }

    /// This pool's declared capability tags.
    pub fn capabilities(&self) -> &HashSet<String> {
        &self.inner.config.capabilities
    }

    /// This pool's configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Subscribe to this pool's typed event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PoolEvent<E>> {
        self.inner.events.subscribe()
    }

    /// Gracefully drain the pool: stop admitting new requests, reject
    /// everything still queued, tear down every idle resource now and
    /// every checked-out resource as it is released, and wait for all
    /// of that to finish. Returns any teardown error messages
    /// collected along the way.
    pub async fn end(&self) -> Vec<String> {
        end_internal(self.inner.clone()).await
    }

    /// Forcefully and immediately destroy the pool: reject every
    /// queued request and every idle resource with "Pool was
    /// destroyed", without waiting for checked-out resources. Any
    /// resource returned later is still routed to teardown, never
    /// silently dropped.
    pub async fn destroy_pool(&self) {
        destroy_pool_internal(self.inner.clone(), PoolError::Closed(ClosedReason::Destroyed)).await;
    }
}

// ---------------------------------------------------------------------------
// internal dispatch machinery
// ---------------------------------------------------------------------------

async fn with_timeout<F, O, E>(
    duration: Option<Duration>,
    kind: TimeoutType,
    future: F,
) -> Result<O, PoolError<E>>
where
    F: Future<Output = O>,
{
    match duration {
        Some(d) => match tokio::time::timeout(d, future).await {
            Ok(v) => Ok(v),
            Err(_) => Err(PoolError::Timeout(kind, d)),
        },
        None => Ok(future.await),
    }
}

fn trigger_dispatch<T, E>(inner: &Arc<PoolInner<T, E>>)
where
    T: Send + 'static,
    E: ResourceError,
{
    let inner = inner.clone();
    tokio::spawn(run_dispatch(inner));
}

async fn run_dispatch<T, E>(inner: Arc<PoolInner<T, E>>)
where
    T: Send + 'static,
    E: ResourceError,
{
    if inner.dispatch_active.swap(true, Ordering::AcqRel) {
        inner.redispatch_requested.store(true, Ordering::Release);
        return;
    }
    loop {
        dispatch_once(&inner).await;
        inner.dispatch_active.store(false, Ordering::Release);
        if !inner.redispatch_requested.swap(false, Ordering::AcqRel) {
            break;
        }
        if inner.dispatch_active.swap(true, Ordering::AcqRel) {
            break;
        }
    }
}

enum Action<T> {
    Done,
    PopTerminal,
    Ping(u64, T),
    Allocate,
}

async fn dispatch_once<T, E>(inner: &Arc<PoolInner<T, E>>)
where
    T: Send + 'static,
    E: ResourceError,
{
    loop {
        let action: Action<T> = {
            let mut st = inner.state.lock().await;
            if !matches!(st.status, Status::Initial | Status::Live) {
                Action::Done
            } else if st.requests.is_empty() {
                Action::Done
            } else if st.requests.front().unwrap().is_terminal() {
                Action::PopTerminal
            } else if let Some(entry) = st.idle.pop_front() {
                Action::Ping(entry.id, entry.value)
            } else if st.idle.len() + st.checked_out.len() + st.acquiring < inner.config.max {
                st.acquiring += 1;
                Action::Allocate
            } else {
                Action::Done
            }
        };
        match action {
            Action::Done => return,
            Action::PopTerminal => {
                let mut st = inner.state.lock().await;
                st.requests.pop_front();
                let empty = st.requests.is_empty();
                drop(st);
                if empty {
                    inner.events.drain();
                }
                continue;
            }
            Action::Ping(id, mut value) => {
                let ping_res = with_timeout(
                    Some(inner.config.ping_timeout),
                    TimeoutType::Ping,
                    inner.manager.ping(&mut value),
                )
                .await;
                if matches!(ping_res, Ok(Ok(()))) {
                    let mut st = inner.state.lock().await;
                    let head_live = st.requests.front().map(|r| !r.is_terminal()).unwrap_or(false);
                    if head_live {
                        let req = st.requests.pop_front().unwrap();
                        st.checked_out.insert(id);
                        let empty = st.requests.is_empty();
                        drop(st);
                        if empty {
                            inner.events.drain();
                        }
                        let sink: Weak<dyn ReleaseSink<T>> = Arc::downgrade(inner);
                        req.resolve(Managed::new(id, value, sink));
                    } else {
                        // Late arrival: the head request went terminal
                        // between being peeked and the ping completing.
                        // Never leak the resource; park it back up front.
                        st.idle.push_front(IdleEntry {
                            id,
                            value,
                            idle_since: Instant::now(),
                        });
                    }
                    continue;
                }
                let msg = match ping_res {
                    Ok(Err(RecycleError::Message(m))) => m,
                    Ok(Err(RecycleError::Backend(e))) => e.to_string(),
                    Err(PoolError::Timeout(_, d)) => format!("ping timed out after {:?}", d),
                    _ => "ping failed".to_string(),
                };
                inner.events.warn(PoolWarning::PingFailed(msg));
                let head_id = inner.state.lock().await.requests.front().map(|r| r.id());
                if let Some(rid) = head_id {
                    inner.events.requeue(rid);
                }
                let _ = teardown(inner, id, value).await;
                continue;
            }
            Action::Allocate => {
                tokio::spawn(allocate_resource(inner.clone()));
                return;
            }
        }
    }
}

/// Race the factory call against `acquire_timeout`. Whichever side
/// wins the one-shot latch performs the full accounting; the loser's
/// branch only logs, since it has nothing left to decrement.
async fn allocate_resource<T, E>(inner: Arc<PoolInner<T, E>>)
where
    T: Send + 'static,
    E: ResourceError,
{
    let latch = Arc::new(AtomicBool::new(false));
    let manager = inner.manager.clone();
    let inner_bg = inner.clone();
    let latch_bg = latch.clone();
    let mut create_task = tokio::spawn(async move {
        let result = manager.create().await;
        on_factory_complete(inner_bg, latch_bg, result).await;
    });

    match inner.config.acquire_timeout {
        None => {
            let _ = (&mut create_task).await;
        }
        Some(d) => {
            tokio::select! {
                _ = tokio::time::sleep(d) => {
                    if latch.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                        on_factory_timeout(inner.clone(), d).await;
                    }
                    // Otherwise the factory task already won the race and
                    // handled everything; let it keep running to completion
                    // in the background.
                }
                res = &mut create_task => {
                    let _ = res;
                }
            }
        }
    }
}

async fn on_factory_complete<T, E>(
    inner: Arc<PoolInner<T, E>>,
    latch: Arc<AtomicBool>,
    result: Result<T, E>,
) where
    T: Send + 'static,
    E: ResourceError,
{
    let won = latch
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok();
    match result {
        Ok(value) => {
            if won {
                let id = inner.alloc_id();
                let needs_teardown = {
                    let mut st = inner.state.lock().await;
                    st.acquiring -= 1;
                    st.live = true;
                    if st.status == Status::Initial {
                        st.status = Status::Live;
                    }
                    matches!(st.status, Status::Ending | Status::Destroyed)
                };
                inner.progress.notify_waiters();
                if needs_teardown {
                    // `end`/`destroy_pool` ran while this factory call
                    // was still in flight; the resource it produced
                    // must still be torn down rather than left idle
                    // where nothing will ever pick it up again.
                    let _ = teardown(&inner, id, value).await;
                } else {
                    {
                        let mut st = inner.state.lock().await;
                        st.idle.push_front(IdleEntry {
                            id,
                            value,
                            idle_since: Instant::now(),
                        });
                    }
                    trigger_dispatch(&inner);
                }
            } else {
                // The acquire timer already fired and decremented
                // `acquiring`; this resource was never inserted into
                // accounting. Route it through graceful teardown so it
                // is never silently dropped.
                tracing::debug!("late factory arrival after acquire timeout; tearing down");
                let _ = teardown(&inner, u64::MAX, value).await;
            }
        }
        Err(e) => {
            if won {
                let was_initial = {
                    let mut st = inner.state.lock().await;
                    st.acquiring -= 1;
                    st.status == Status::Initial
                };
                inner.progress.notify_waiters();
                if was_initial {
                    handle_initial_failure(&inner).await;
                } else {
                    inner.events.warn(PoolWarning::FactoryFailed(e));
                }
                trigger_dispatch(&inner);
            } else {
                inner.events.warn(PoolWarning::FactoryFailed(e));
            }
        }
    }
}

async fn on_factory_timeout<T, E>(inner: Arc<PoolInner<T, E>>, d: Duration)
where
    T: Send + 'static,
    E: ResourceError,
{
    let (was_initial, front) = {
        let mut st = inner.state.lock().await;
        st.acquiring -= 1;
        let front = st
            .requests
            .front()
            .filter(|r| !r.is_terminal())
            .map(|r| r.clone());
        (st.status == Status::Initial, front)
    };
    inner.progress.notify_waiters();
    inner.events.error(PoolError::Timeout(TimeoutType::Acquire, d));
    // The request this attempt was trying to satisfy is terminated
    // outright; a later `PopTerminal` dispatch drops it from the queue.
    if let Some(fulfiller) = front {
        fulfiller.reject(PoolError::Timeout(TimeoutType::Acquire, d));
    }
    if was_initial {
        handle_initial_failure(&inner).await;
    }
    // Avoid busy-looping a storm of failing factories: give dispatch a
    // short grace period before trying again.
    let inner2 = inner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger_dispatch(&inner2);
    });
}

/// Shared tail of the "factory failed/timed out while still Initial"
/// path: either retry after a backoff delay, or give up and destroy
/// the pool once `bail_after` is exceeded.
async fn handle_initial_failure<T, E>(inner: &Arc<PoolInner<T, E>>)
where
    T: Send + 'static,
    E: ResourceError,
{
    let exceeded = {
        let st = inner.state.lock().await;
        match inner.config.bail_after {
            None => false,
            Some(budget) => st.initial_started.elapsed() >= budget,
        }
    };
    if exceeded {
        destroy_pool_internal(
            inner.clone(),
            PoolError::Closed(ClosedReason::Destroyed),
        )
        .await;
        return;
    }
    let delay = {
        let mut st = inner.state.lock().await;
        let attempt = st.initial_attempt;
        st.initial_attempt += 1;
        st.acquiring += 1;
        st.backoff.next_delay(attempt)
    };
    let inner2 = inner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        allocate_resource(inner2).await;
    });
}

async fn ensure_minimum<T, E>(inner: Arc<PoolInner<T, E>>)
where
    T: Send + 'static,
    E: ResourceError,
{
    loop {
        let should_spawn = {
            let mut st = inner.state.lock().await;
            if !matches!(st.status, Status::Initial | Status::Live) {
                false
            } else if st.idle.len() + st.checked_out.len() + st.acquiring < inner.config.min {
                st.acquiring += 1;
                true
            } else {
                false
            }
        };
        if !should_spawn {
            break;
        }
        tokio::spawn(allocate_resource(inner.clone()));
    }
}

async fn reap<T, E>(inner: &Arc<PoolInner<T, E>>)
where
    T: Send + 'static,
    E: ResourceError,
{
    loop {
        let victim = {
            let mut st = inner.state.lock().await;
            let total = st.idle.len() + st.checked_out.len();
            if total <= inner.config.min {
                None
            } else {
                match st.idle.back() {
                    Some(back) if back.idle_since.elapsed() >= inner.config.idle_timeout => {
                        st.idle.pop_back()
                    }
                    _ => None,
                }
            }
        };
        match victim {
            Some(entry) => {
                let _ = teardown(inner, entry.id, entry.value).await;
            }
            None => break,
        }
    }
}

async fn sync_loop<T, E>(inner: Arc<PoolInner<T, E>>, interval: Duration)
where
    T: Send + 'static,
    E: ResourceError,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        {
            let st = inner.state.lock().await;
            if matches!(st.status, Status::Ending | Status::Destroyed) {
                break;
            }
        }
        ensure_minimum(inner.clone()).await;
        reap(&inner).await;
        trigger_dispatch(&inner);
    }
}

/// Graceful teardown of a resource already removed from `idle`/
/// `checked_out` accounting by the caller. Runs `Manager::recycle`
/// under `dispose_timeout`, falling back to a forceful `destroy` on
/// timeout. `id` is `u64::MAX` for resources that were never
/// registered (the late-factory-arrival case) and is used only for
/// tracing.
async fn teardown<T, E>(inner: &Arc<PoolInner<T, E>>, id: u64, mut value: T) -> Result<(), String>
where
    T: Send + 'static,
    E: ResourceError,
{
    {
        inner.state.lock().await.outstanding_teardowns += 1;
    }
    let dispose_dur = inner.config.dispose_timeout;
    let recycle_fut = inner.manager.recycle(&mut value);
    let timed: Result<Result<(), RecycleError<E>>, tokio::time::error::Elapsed> = match dispose_dur
    {
        Some(d) => tokio::time::timeout(d, recycle_fut).await,
        None => Ok(recycle_fut.await),
    };
    let outcome: Result<(), String> = match timed {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            let msg = match e {
                RecycleError::Message(m) => m,
                RecycleError::Backend(err) => err.to_string(),
            };
            inner
                .events
                .warn(PoolWarning::TeardownFailed(msg.clone()));
            Err(msg)
        }
        Err(_elapsed) => {
            let msg = format!(
                "dispose timed out after {:?}",
                dispose_dur.expect("timeout only fires when dispose_dur is Some")
            );
            inner
                .events
                .warn(PoolWarning::TeardownFailed(msg.clone()));
            destroy_now(inner, value).await;
            Err(msg)
        }
    };
    tracing::trace!(id, "teardown complete");
    {
        let mut st = inner.state.lock().await;
        st.outstanding_teardowns -= 1;
        if let Err(ref msg) = outcome {
            st.teardown_errors.push(msg.clone());
        }
    }
    inner.progress.notify_waiters();
    let live = matches!(inner.state.lock().await.status, Status::Live);
    if live {
        ensure_minimum(inner.clone()).await;
    }
    outcome
}

async fn destroy_now<T, E>(inner: &Arc<PoolInner<T, E>>, value: T)
where
    T: Send + 'static,
    E: ResourceError,
{
    let manager = inner.manager.clone();
    let handle = tokio::spawn(async move {
        manager.destroy(value).await;
    });
    if let Err(e) = handle.await {
        inner
            .events
            .warn(PoolWarning::DestroyFailed(format!("destroy panicked: {e}")));
    }
}

async fn release_internal<T, E>(inner: Arc<PoolInner<T, E>>, id: u64, value: T)
where
    T: Send + 'static,
    E: ResourceError,
{
    let mut st = inner.state.lock().await;
    if !st.checked_out.remove(&id) {
        drop(st);
        inner.events.error(PoolError::Usage(UsageError::NotMember));
        return;
    }
    match st.status {
        Status::Ending | Status::Destroyed => {
            drop(st);
            let _ = teardown(&inner, id, value).await;
        }
        _ => {
            st.idle.push_front(IdleEntry {
                id,
                value,
                idle_since: Instant::now(),
            });
            let empty = st.requests.is_empty();
            drop(st);
            if empty {
                inner.events.drain();
            }
            trigger_dispatch(&inner);
        }
    }
}

async fn end_internal<T, E>(inner: Arc<PoolInner<T, E>>) -> Vec<String>
where
    T: Send + 'static,
    E: ResourceError,
{
    let (pending, idle_snapshot) = {
        let mut st = inner.state.lock().await;
        st.status = Status::Ending;
        (
            st.requests.drain(..).collect::<Vec<_>>(),
            st.idle.drain(..).collect::<Vec<_>>(),
        )
    };
    inner.cancel_sync_timer();
    for req in pending {
        req.reject(PoolError::Closed(ClosedReason::Ending));
    }
    for entry in idle_snapshot {
        let inner2 = inner.clone();
        tokio::spawn(async move {
            let _ = teardown(&inner2, entry.id, entry.value).await;
        });
    }
    loop {
        let notified = inner.progress.notified();
        let done = {
            let st = inner.state.lock().await;
            st.idle.is_empty()
                && st.checked_out.is_empty()
                && st.acquiring == 0
                && st.outstanding_teardowns == 0
        };
        if done {
            break;
        }
        notified.await;
    }
    let mut st = inner.state.lock().await;
    st.status = Status::Destroyed;
    std::mem::take(&mut st.teardown_errors)
}

async fn destroy_pool_internal<T, E>(inner: Arc<PoolInner<T, E>>, fatal: PoolError<E>)
where
    T: Send + 'static,
    E: ResourceError,
{
    let (pending, idle_snapshot) = {
        let mut st = inner.state.lock().await;
        if st.status == Status::Destroyed {
            return;
        }
        st.status = Status::Destroyed;
        (
            st.requests.drain(..).collect::<Vec<_>>(),
            st.idle.drain(..).collect::<Vec<_>>(),
        )
    };
    inner.cancel_sync_timer();
    inner.events.error(fatal);
    for req in pending {
        req.reject(PoolError::Closed(ClosedReason::Destroyed));
    }
    for entry in idle_snapshot {
        destroy_now(&inner, entry.value).await;
    }
    inner.progress.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::Manager;
    use crate::test_support::{CountingManager, TestError};
    use async_trait::async_trait;

    fn test_config(max: usize) -> PoolConfig {
        PoolConfig {
            min: 0,
            max,
            max_requests: None,
            acquire_timeout: Some(Duration::from_secs(5)),
            dispose_timeout: Some(Duration::from_secs(5)),
            ping_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            sync_interval: None,
            request_timeout: None,
            bail_after: None,
            capabilities: Default::default(),
        }
    }

    #[tokio::test]
    async fn acquire_and_release_reuses_resource() {
        let (mgr, counters) = CountingManager::new();
        let pool: Pool<u32, TestError> = Pool::from_config(mgr, test_config(2)).unwrap();
        let req = pool.acquire().await.unwrap();
        let managed = req.await.unwrap();
        let value = *managed;
        pool.release(managed);
        let req2 = pool.acquire().await.unwrap();
        let managed2 = req2.await.unwrap();
        assert_eq!(*managed2, value);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    }

    // max=1; acquire A; acquire B; after a delay release A. B is
    // fulfilled only once A is released, and gets the same resource.
    #[tokio::test]
    async fn s1_max_honored_and_fifo() {
        let (mgr, _counters) = CountingManager::new();
        let pool: Pool<u32, TestError> = Pool::from_config(mgr, test_config(1)).unwrap();
        let req_a = pool.acquire().await.unwrap();
        let managed_a = req_a.await.unwrap();
        let first_value = *managed_a;

        let req_b = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!req_b.is_terminal());

        pool.release(managed_a);
        let managed_b = req_b.await.unwrap();
        assert_eq!(*managed_b, first_value);
    }

    // min=max=1; ping fails on its 3rd call. First two acquires
    // yield the same resource; the third yields a different one.
    #[tokio::test]
    async fn s2_ping_failure_recycles() {
        let (mut mgr, counters) = CountingManager::new();
        mgr.fail_ping_on_nth.store(3, Ordering::SeqCst);
        let mut cfg = test_config(1);
        cfg.min = 1;
        let pool: Pool<u32, TestError> = Pool::from_config(mgr, cfg).unwrap();

        let r1 = pool.acquire().await.unwrap().await.unwrap();
        let v1 = *r1;
        pool.release(r1);

        let r2 = pool.acquire().await.unwrap().await.unwrap();
        let v2 = *r2;
        pool.release(r2);
        assert_eq!(v1, v2);

        let r3 = pool.acquire().await.unwrap().await.unwrap();
        let v3 = *r3;
        assert_ne!(v3, v1);
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
    }

    // acquire_timeout=10ms; a factory call that returns late must
    // still be torn down, never silently dropped.
    #[tokio::test(flavor = "multi_thread")]
    async fn s3_late_factory_arrival_is_torn_down() {
        let (mut mgr, counters) = CountingManager::new();
        mgr.create_delay = Some(Duration::from_millis(60));
        let mut cfg = test_config(2);
        cfg.acquire_timeout = Some(Duration::from_millis(10));
        let pool: Pool<u32, TestError> = Pool::from_config(mgr, cfg).unwrap();

        let req = pool.acquire().await.unwrap();
        let result = req.await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counters.recycled.load(Ordering::SeqCst), 1);
    }

    // min=1; acquire two; call end(); release each later. end()
    // only completes once both teardowns have run.
    #[tokio::test]
    async fn s4_graceful_end_waits_for_outstanding() {
        let (mgr, counters) = CountingManager::new();
        let pool: Pool<u32, TestError> = Pool::from_config(mgr, test_config(2)).unwrap();
        let a = pool.acquire().await.unwrap().await.unwrap();
        let b = pool.acquire().await.unwrap().await.unwrap();

        let pool2 = pool.clone();
        let end_handle = tokio::spawn(async move { pool2.end().await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!end_handle.is_finished());
        pool.release(a);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!end_handle.is_finished());
        pool.release(b);

        let errors = end_handle.await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(counters.recycled.load(Ordering::SeqCst), 2);
        assert_eq!(pool.status().await, Status::Destroyed);
    }

    // acquire_timeout disabled, factory never returns; destroy the
    // pool while the acquire is pending. The acquire must fail with a
    // "destroyed" error.
    #[tokio::test]
    async fn s5_destroy_pool_rejects_pending() {
        struct HangingManager;
        #[async_trait]
        impl Manager<u32, TestError> for HangingManager {
            async fn create(&self) -> Result<u32, TestError> {
                std::future::pending::<()>().await;
                unreachable!()
            }
            async fn recycle(&self, _obj: &mut u32) -> crate::error::RecycleResult<TestError> {
                Ok(())
            }
        }
        let mut cfg = test_config(1);
        cfg.acquire_timeout = None;
        let pool: Pool<u32, TestError> = Pool::from_config(HangingManager, cfg).unwrap();
        let req = pool.acquire().await.unwrap();

        let pool2 = pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            pool2.destroy_pool().await;
        });

        let result = req.await;
        assert!(matches!(result, Err(PoolError::Closed(ClosedReason::Destroyed))));
    }

    // min=1, idle_timeout=10ms, sync_interval=10ms; acquire two,
    // release both; within 100ms allocated should settle back to 1.
    #[tokio::test]
    async fn s6_reap_to_min() {
        let (mgr, _counters) = CountingManager::new();
        let mut cfg = test_config(2);
        cfg.min = 1;
        cfg.idle_timeout = Duration::from_millis(10);
        cfg.sync_interval = Some(Duration::from_millis(10));
        let pool: Pool<u32, TestError> = Pool::from_config(mgr, cfg).unwrap();

        let a = pool.acquire().await.unwrap().await.unwrap();
        let b = pool.acquire().await.unwrap().await.unwrap();
        pool.release(a);
        pool.release(b);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let stats = pool.stats().await;
        assert_eq!(stats.allocated, 1);
    }

    #[tokio::test]
    async fn pool_full_rejects_excess_requests() {
        let (mgr, _counters) = CountingManager::new();
        let mut cfg = test_config(1);
        cfg.max_requests = Some(1);
        cfg.acquire_timeout = None;
        let pool: Pool<u32, TestError> = Pool::from_config(mgr, cfg).unwrap();
        let _held = pool.acquire().await.unwrap().await.unwrap();
        let _queued = pool.acquire().await.unwrap();
        let rejected = pool.acquire().await;
        assert!(matches!(
            rejected,
            Err(PoolError::Usage(UsageError::PoolFull))
        ));
    }

    #[tokio::test]
    async fn abort_returns_resource_to_available() {
        let (mgr, counters) = CountingManager::new();
        let pool: Pool<u32, TestError> = Pool::from_config(mgr, test_config(1)).unwrap();
        let held = pool.acquire().await.unwrap().await.unwrap();
        let queued = pool.acquire().await.unwrap();
        queued.abort(Some("give up".to_string()));
        pool.release(held);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = pool.stats().await;
        assert_eq!(stats.allocated, 1);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    }

    // A custom Backoff passed through from_config_with_backoff must be
    // the one actually consulted while the pool retries a failing
    // factory, not the default ExponentialBackoff.
    #[tokio::test]
    async fn from_config_with_backoff_uses_supplied_policy() {
        use std::sync::atomic::AtomicUsize;

        struct FixedBackoff {
            calls: Arc<AtomicUsize>,
        }
        impl Backoff for FixedBackoff {
            fn next_delay(&mut self, _attempt: u32) -> Duration {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Duration::from_millis(5)
            }
            fn reset(&self) -> Box<dyn Backoff> {
                Box::new(FixedBackoff {
                    calls: self.calls.clone(),
                })
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let (mgr, counters) = CountingManager::new();
        mgr.fail_create_until.store(2, Ordering::SeqCst);
        let pool: Pool<u32, TestError> = Pool::from_config_with_backoff(
            mgr,
            test_config(1),
            Box::new(FixedBackoff {
                calls: calls.clone(),
            }),
        )
        .unwrap();

        let managed = pool.acquire().await.unwrap().await.unwrap();
        drop(managed);
        assert_eq!(counters.created.load(Ordering::SeqCst), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
