use std::time::Duration;

use thiserror::Error;

/// Errors produced by calling a pool operation incorrectly rather than
/// by any failure of the underlying resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// `release`/`remove` was called with a resource that is not a
    /// member of the pool it was called on.
    #[error("resource is not a member of this pool")]
    NotMember,
    /// `Pool::acquire` was called while `|requests| >= max_requests`.
    #[error("pool is full")]
    PoolFull,
    /// A `ResourceRequest` fulfillment method fired on an
    /// already-terminal request.
    #[error("redundant fulfill")]
    RedundantFulfill,
    /// Construction-time argument validation failure.
    #[error("{0}")]
    InvalidArgument(String),
}

/// Which operation a [`TimeoutType`](TimeoutType) timer belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutType {
    /// The factory (`Manager::create`) did not return in time.
    Acquire,
    /// `Manager::ping` did not return in time.
    Ping,
    /// `Manager::recycle`/dispose (graceful teardown) did not return in
    /// time.
    Dispose,
    /// A queued `ResourceRequest` exceeded its own deadline.
    Request,
}

impl std::fmt::Display for TimeoutType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TimeoutType::Acquire => "acquire",
            TimeoutType::Ping => "ping",
            TimeoutType::Dispose => "dispose",
            TimeoutType::Request => "request",
        };
        f.write_str(s)
    }
}

/// Why a pool stopped accepting new requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
    /// `Pool::end` was called and the pool is draining.
    Ending,
    /// The pool is fully torn down.
    Destroyed,
}

impl std::fmt::Display for ClosedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClosedReason::Ending => f.write_str("ending"),
            ClosedReason::Destroyed => f.write_str("destroyed"),
        }
    }
}

/// The error type returned by every fallible pool operation.
#[derive(Error, Debug, Clone)]
pub enum PoolError<E> {
    /// Caller violated the pool's contract.
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    /// An operation exceeded its configured deadline.
    #[error("{0} timed out after {1:?}")]
    Timeout(TimeoutType, Duration),

    /// The user-supplied factory/recycle operation returned an error.
    #[error("factory error: {0}")]
    Factory(E),

    /// A `ping`/`recycle` attempt failed with a plain message rather
    /// than a backend error.
    #[error("recycle failed: {0}")]
    Recycle(String),

    /// `acquire` was called after `end`/`destroy`, or the pool was
    /// destroyed while the request was still pending.
    #[error("pool was {0}")]
    Closed(ClosedReason),

    /// A `ResourceRequest` was aborted by its creator.
    #[error("aborted: {0}")]
    Aborted(String),

    /// No pool in a `Cluster` declares the requested capability set.
    #[error("no pools can fulfil capability")]
    NoCapableMatch,

    /// Every capability-matching pool in a `Cluster` is at capacity.
    #[error("no pools available")]
    NoPoolAvailable,

    /// `Cluster::acquire` was called after `Cluster::end`.
    #[error("cluster is ended")]
    ClusterEnded,
}

impl<E> PoolError<E> {
    pub(crate) fn aborted(reason: Option<String>) -> Self {
        PoolError::Aborted(reason.unwrap_or_else(|| "No reason given".to_string()))
    }
}

/// Result type for [`Manager::recycle`](crate::Manager::recycle) and
/// [`Manager::ping`](crate::Manager::ping).
pub type RecycleResult<E> = Result<(), RecycleError<E>>;

/// An error raised by a failed recycle/ping attempt.
#[derive(Error, Debug, Clone)]
pub enum RecycleError<E> {
    /// A plain message describing why recycling failed, not tied to
    /// the backend's own error type.
    #[error("{0}")]
    Message(String),
    /// An error surfaced by the backend itself.
    #[error("{0}")]
    Backend(E),
}

impl<E> From<RecycleError<E>> for PoolError<E> {
    fn from(err: RecycleError<E>) -> Self {
        match err {
            RecycleError::Message(msg) => PoolError::Recycle(msg),
            RecycleError::Backend(e) => PoolError::Factory(e),
        }
    }
}

/// Errors raised while validating or building a [`PoolConfig`](crate::PoolConfig).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric option was out of its required range.
    #[error("{field}: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
