//! Shared test doubles used by `pool`, `cluster`, and `request` tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RecycleError;
use crate::manager::Manager;

#[derive(Debug, Clone, thiserror::Error)]
#[error("test error: {0}")]
pub(crate) struct TestError(pub String);

#[derive(Default)]
pub(crate) struct Counters {
    pub created: AtomicUsize,
    pub recycled: AtomicUsize,
    pub pinged: AtomicUsize,
    pub destroyed: AtomicUsize,
}

/// A `Manager<u32, TestError>` double with counters and optional
/// injected failures/delays, reused across every module's tests.
pub(crate) struct CountingManager {
    pub counters: Arc<Counters>,
    pub next_value: AtomicU32,
    pub fail_create_until: AtomicUsize,
    pub fail_ping_on_nth: AtomicUsize,
    pub create_delay: Option<Duration>,
}

impl CountingManager {
    pub(crate) fn new() -> (Self, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (
            CountingManager {
                counters: counters.clone(),
                next_value: AtomicU32::new(0),
                fail_create_until: AtomicUsize::new(0),
                fail_ping_on_nth: AtomicUsize::new(0),
                create_delay: None,
            },
            counters,
        )
    }
}

#[async_trait]
impl Manager<u32, TestError> for CountingManager {
    async fn create(&self) -> Result<u32, TestError> {
        if let Some(d) = self.create_delay {
            tokio::time::sleep(d).await;
        }
        let attempt = self.counters.created.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_create_until.load(Ordering::SeqCst) {
            return Err(TestError("create failed".into()));
        }
        Ok(self.next_value.fetch_add(1, Ordering::SeqCst))
    }

    async fn recycle(&self, _obj: &mut u32) -> crate::error::RecycleResult<TestError> {
        self.counters.recycled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self, _obj: &mut u32) -> crate::error::RecycleResult<TestError> {
        let n = self.counters.pinged.fetch_add(1, Ordering::SeqCst) + 1;
        let fail_on = self.fail_ping_on_nth.load(Ordering::SeqCst);
        if fail_on != 0 && n == fail_on {
            return Err(RecycleError::Message("ping failed".into()));
        }
        Ok(())
    }

    async fn destroy(&self, _obj: u32) {
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}
