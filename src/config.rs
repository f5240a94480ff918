use std::collections::HashSet;
use std::time::Duration;

use crate::error::ConfigError;

/// The retry-delay generator consulted while the pool is still
/// `Initial` and the factory keeps failing. Deliberately a trait
/// rather than a fixed formula, so callers can swap in their own
/// retry policy; [`ExponentialBackoff`] is the usable default.
pub trait Backoff: Send + Sync {
    /// Return the delay before the next retry, or `None` once the
    /// caller should give up (the retry budget tracking against
    /// `bail_after` happens in the pool, not here).
    fn next_delay(&mut self, attempt: u32) -> Duration;

    /// Clone this backoff generator into a fresh, reset instance for a
    /// new retry sequence.
    fn reset(&self) -> Box<dyn Backoff>;
}

/// Simple doubling backoff with a cap, the default [`Backoff`].
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Construct a backoff starting at `base` and never exceeding `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        ExponentialBackoff { base, max }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff::new(Duration::from_millis(50), Duration::from_secs(5))
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&mut self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        let scaled = self.base.checked_mul(factor as u32).unwrap_or(self.max);
        scaled.min(self.max)
    }

    fn reset(&self) -> Box<dyn Backoff> {
        Box::new(*self)
    }
}

/// Immutable-after-construction configuration for a [`Pool`](crate::Pool).
///
/// Every tunable is a distinct, typed field rather than a loose map of
/// options: a field that does not exist cannot be misspelled into
/// silent nonsense.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolConfig {
    /// Minimum number of resources the synchronizer keeps warm.
    pub min: usize,
    /// Maximum number of resources, idle plus checked out plus
    /// in-flight factory calls.
    pub max: usize,
    /// Maximum depth of the FIFO request queue. `None` means
    /// unbounded.
    pub max_requests: Option<usize>,
    /// Deadline for a single `Manager::create` call. `None` disables
    /// the guard.
    pub acquire_timeout: Option<Duration>,
    /// Deadline for a single `Manager::recycle` (graceful teardown)
    /// call, after which `destroy` is used as a fallback. `None`
    /// disables both the guard and the destroy-fallback.
    pub dispose_timeout: Option<Duration>,
    /// Deadline for a single `Manager::ping` call.
    pub ping_timeout: Duration,
    /// How long a resource may sit idle before the reaper removes it
    /// (only above `min`).
    pub idle_timeout: Duration,
    /// Interval of the background synchronizer (`ensure_minimum` +
    /// `reap`). `None` disables both.
    pub sync_interval: Option<Duration>,
    /// Per-request deadline. `None` means no deadline.
    pub request_timeout: Option<Duration>,
    /// How long, cumulatively, `Initial`-state factory failures may be
    /// retried before the pool gives up and transitions to
    /// `Destroyed`. `None` means retry forever.
    pub bail_after: Option<Duration>,
    /// Opaque capability tags this pool declares, used by
    /// [`Cluster`](crate::Cluster) to match requests to pools.
    #[cfg_attr(feature = "serde", serde(default))]
    pub capabilities: HashSet<String>,
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("max_requests", &self.max_requests)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("dispose_timeout", &self.dispose_timeout)
            .field("ping_timeout", &self.ping_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("sync_interval", &self.sync_interval)
            .field("request_timeout", &self.request_timeout)
            .field("bail_after", &self.bail_after)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min: 0,
            max: 10,
            max_requests: None,
            acquire_timeout: Some(Duration::from_secs(30)),
            dispose_timeout: Some(Duration::from_secs(30)),
            ping_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            sync_interval: Some(Duration::from_secs(10)),
            request_timeout: None,
            bail_after: None,
            capabilities: HashSet::new(),
        }
    }
}

impl PoolConfig {
    /// Shorthand for `PoolConfig { max, ..Default::default() }`.
    pub fn new(max: usize) -> Self {
        PoolConfig {
            max,
            ..Default::default()
        }
    }

    /// Start building a config with [`PoolConfigBuilder`].
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    /// Check the invariants this config must hold: `min <= max`,
    /// `max >= 1`, and `idle_timeout` only meaningful when
    /// `sync_interval` is set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max == 0 {
            return Err(ConfigError::invalid("max", "must be at least 1"));
        }
        if self.min > self.max {
            return Err(ConfigError::invalid(
                "min",
                format!("cannot be greater than max ({} > {})", self.min, self.max),
            ));
        }
        if let Some(n) = self.max_requests {
            if n == 0 {
                return Err(ConfigError::invalid("max_requests", "must be at least 1"));
            }
        }
        if self.sync_interval.is_none() && self.idle_timeout != Duration::ZERO {
            // A nonzero idle_timeout with no sync_interval has no
            // reaper to ever honor it, so a caller who set a real
            // idle_timeout almost certainly meant to also keep the
            // synchronizer running.
            return Err(ConfigError::invalid(
                "idle_timeout",
                "sync_interval is required to be set whenever idle_timeout is nonzero",
            ));
        }
        Ok(())
    }
}

/// Builder for [`PoolConfig`].
#[derive(Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Set `min`.
    pub fn min(mut self, min: usize) -> Self {
        self.config.min = min;
        self
    }
    /// Set `max`.
    pub fn max(mut self, max: usize) -> Self {
        self.config.max = max;
        self
    }
    /// Set `max_requests`.
    pub fn max_requests(mut self, max_requests: Option<usize>) -> Self {
        self.config.max_requests = max_requests;
        self
    }
    /// Set `acquire_timeout`.
    pub fn acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }
    /// Set `dispose_timeout`.
    pub fn dispose_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.dispose_timeout = timeout;
        self
    }
    /// Set `ping_timeout`.
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }
    /// Set `idle_timeout`.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }
    /// Set `sync_interval`.
    pub fn sync_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.sync_interval = interval;
        self
    }
    /// Set `request_timeout`.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }
    /// Set `bail_after`.
    pub fn bail_after(mut self, bail_after: Option<Duration>) -> Self {
        self.config.bail_after = bail_after;
        self
    }
    /// Set `capabilities`.
    pub fn capabilities(mut self, capabilities: HashSet<String>) -> Self {
        self.config.capabilities = capabilities;
        self
    }
    /// Validate and produce the final [`PoolConfig`].
    pub fn build(self) -> Result<PoolConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_min_greater_than_max() {
        let cfg = PoolConfig {
            min: 5,
            max: 2,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_max() {
        let cfg = PoolConfig {
            max: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_idle_timeout_without_sync_interval() {
        let cfg = PoolConfig {
            sync_interval: None,
            idle_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn allows_zero_idle_timeout_without_sync_interval() {
        let cfg = PoolConfig {
            sync_interval: None,
            idle_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn builder_roundtrips() {
        let cfg = PoolConfig::builder()
            .min(1)
            .max(4)
            .build()
            .expect("valid config");
        assert_eq!(cfg.min, 1);
        assert_eq!(cfg.max, 4);
    }

    #[test]
    fn exponential_backoff_caps_out() {
        let mut b = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(100));
        assert_eq!(b.next_delay(0), Duration::from_millis(10));
        assert_eq!(b.next_delay(1), Duration::from_millis(20));
        assert_eq!(b.next_delay(10), Duration::from_millis(100));
    }
}
