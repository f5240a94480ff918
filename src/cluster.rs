use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::PoolError;
use crate::events::PoolEvent;
use crate::managed::Managed;
use crate::pool::{Pool, ResourceError, Status};
use crate::request::ResourceRequest;

/// A capability-matched load balancer across several [`Pool`]s.
///
/// Routing is a thin scheduling layer on top of ordinary pools: the
/// [`ResourceRequest`]/[`Managed`] a `Cluster` hands back is exactly
/// the one its chosen pool would have produced, so releasing the
/// resource routes straight back to that pool with no extra
/// bookkeeping here.
pub struct Cluster<T, E> {
    pools: Vec<Pool<T, E>>,
    ended: Arc<AtomicBool>,
}

impl<T, E> Clone for Cluster<T, E> {
    fn clone(&self) -> Self {
        Cluster {
            pools: self.pools.clone(),
            ended: self.ended.clone(),
        }
    }
}

impl<T, E> Default for Cluster<T, E> {
    fn default() -> Self {
        Cluster {
            pools: Vec::new(),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<T, E> Cluster<T, E>
where
    T: Send + 'static,
    E: ResourceError,
{
    /// An empty cluster; add pools with [`add_pool`](Cluster::add_pool).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cluster from an existing set of pools.
    pub fn from_pools(pools: Vec<Pool<T, E>>) -> Self {
        Cluster {
            pools,
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register another pool with the cluster.
    pub fn add_pool(&mut self, pool: Pool<T, E>) {
        self.pools.push(pool);
    }

    /// The pools currently registered with this cluster.
    pub fn pools(&self) -> &[Pool<T, E>] {
        &self.pools
    }

    /// Route a request to the pool with the most headroom among those
    /// whose declared capabilities are a superset of `capability`.
    /// Headroom is `max - allocated - queued`; ties favor whichever
    /// pool was registered first. Pools that are `Ending`/`Destroyed`
    /// are never selected.
    pub async fn acquire(
        &self,
        capability: &HashSet<String>,
    ) -> Result<ResourceRequest<T, E>, PoolError<E>> {
        if self.ended.load(Ordering::Acquire) {
            return Err(PoolError::ClusterEnded);
        }
        let candidates: Vec<&Pool<T, E>> = self
            .pools
            .iter()
            .filter(|p| p.capabilities().is_superset(capability))
            .collect();
        if candidates.is_empty() {
            return Err(PoolError::NoCapableMatch);
        }

        let mut best: Option<(&Pool<T, E>, i64)> = None;
        for pool in candidates {
            if matches!(pool.status().await, Status::Ending | Status::Destroyed) {
                continue;
            }
            let stats = pool.stats().await;
            let score = stats.max as i64 - stats.allocated as i64 - stats.queued as i64;
            let better = match best {
                Some((_, best_score)) => score > best_score,
                None => true,
            };
            if better {
                best = Some((pool, score));
            }
        }

        match best {
            Some((pool, _)) => pool.acquire_matching(Some(capability)).await,
            None => Err(PoolError::NoPoolAvailable),
        }
    }

    /// Submit a request with no capability requirement, scored purely
    /// on headroom across every live pool in the cluster.
    pub async fn acquire_any(&self) -> Result<ResourceRequest<T, E>, PoolError<E>> {
        self.acquire(&HashSet::new()).await
    }

    /// Subscribe to every registered pool's event stream at once.
    pub fn subscribe_all(&self) -> Vec<broadcast::Receiver<PoolEvent<E>>> {
        self.pools.iter().map(|p| p.subscribe()).collect()
    }

    /// Release a resource obtained through this cluster. `Managed<T>`
    /// already carries a direct link back to the pool that produced
    /// it, so this is equivalent to dropping it; spelled out as its
    /// own method so the operation is named at the `Cluster` level
    /// too.
    pub fn release(&self, managed: Managed<T>) {
        drop(managed);
    }

    /// Mark the cluster ended and gracefully drain every registered
    /// pool (see [`Pool::end`]). Once this returns, further calls to
    /// `acquire`/`acquire_any` fail with [`PoolError::ClusterEnded`].
    /// Returns every pool's teardown errors, concatenated.
    pub async fn end(&self) -> Vec<String> {
        self.ended.store(true, Ordering::Release);
        let mut errors = Vec::new();
        for pool in &self.pools {
            errors.extend(pool.end().await);
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::test_support::{CountingManager, TestError};

    fn pool_with_capabilities(max: usize, caps: &[&str]) -> Pool<u32, TestError> {
        let (mgr, _counters) = CountingManager::new();
        let mut cfg = PoolConfig::new(max);
        cfg.acquire_timeout = Some(std::time::Duration::from_secs(5));
        cfg.sync_interval = None;
        cfg.capabilities = caps.iter().map(|s| s.to_string()).collect();
        Pool::from_config(mgr, cfg).unwrap()
    }

    #[tokio::test]
    async fn rejects_when_no_pool_has_capability() {
        let mut cluster = Cluster::new();
        cluster.add_pool(pool_with_capabilities(4, &["gpu"]));
        let mut needed = HashSet::new();
        needed.insert("tpu".to_string());
        let result = cluster.acquire(&needed).await;
        assert!(matches!(result, Err(PoolError::NoCapableMatch)));
    }

    #[tokio::test]
    async fn prefers_pool_with_more_headroom() {
        let mut cluster = Cluster::new();
        let small = pool_with_capabilities(1, &["gpu"]);
        let large = pool_with_capabilities(4, &["gpu"]);
        cluster.add_pool(small.clone());
        cluster.add_pool(large.clone());

        // Fill the small pool's only slot so it has zero headroom.
        let _held = small.acquire().await.unwrap().await.unwrap();

        let mut needed = HashSet::new();
        needed.insert("gpu".to_string());
        let req = cluster.acquire(&needed).await.unwrap();
        let managed = req.await.unwrap();

        let large_stats = large.stats().await;
        assert_eq!(large_stats.allocated, 1);
        drop(managed);
    }

    #[tokio::test]
    async fn end_drains_pools_and_rejects_further_acquires() {
        let mut cluster = Cluster::new();
        cluster.add_pool(pool_with_capabilities(2, &["gpu"]));
        let mut needed = HashSet::new();
        needed.insert("gpu".to_string());

        let managed = cluster.acquire(&needed).await.unwrap().await.unwrap();
        cluster.release(managed);

        let errors = cluster.end().await;
        assert!(errors.is_empty());

        let result = cluster.acquire(&needed).await;
        assert!(matches!(result, Err(PoolError::ClusterEnded)));
    }
}
