//! `respool` is a generic async resource pool and capability-matched
//! load-balancing cluster.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//!
//! #[derive(Debug, Clone, thiserror::Error)]
//! #[error("connection failed")]
//! struct Error;
//!
//! struct Connection {}
//!
//! impl Connection {
//!     async fn new() -> Result<Self, Error> {
//!         Ok(Connection {})
//!     }
//!     async fn check_health(&self) -> bool {
//!         true
//!     }
//! }
//!
//! struct Manager {}
//!
//! #[async_trait]
//! impl respool::Manager<Connection, Error> for Manager {
//!     async fn create(&self) -> Result<Connection, Error> {
//!         Connection::new().await
//!     }
//!     async fn recycle(&self, conn: &mut Connection) -> respool::RecycleResult<Error> {
//!         if conn.check_health().await {
//!             Ok(())
//!         } else {
//!             Err(respool::RecycleError::Message("unhealthy".into()))
//!         }
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pool: respool::Pool<Connection, Error> = respool::Pool::new(Manager {}, 16)?;
//! let conn = pool.acquire().await?.await?;
//! drop(conn); // returns the connection to the pool
//! # Ok(())
//! # }
//! ```
//!
//! A single pool has one fixed backend and one fixed capacity. A
//! [`Cluster`] groups several pools — possibly of different
//! capabilities — and routes each request to whichever pool currently
//! has the most headroom.

mod cluster;
mod config;
mod error;
mod events;
mod managed;
mod manager;
mod pool;
mod request;
#[cfg(test)]
mod test_support;

pub use cluster::Cluster;
pub use config::{Backoff, ExponentialBackoff, PoolConfig, PoolConfigBuilder};
pub use error::{
    ClosedReason, ConfigError, PoolError, RecycleError, RecycleResult, TimeoutType, UsageError,
};
pub use events::{PoolEvent, PoolWarning};
pub use managed::Managed;
pub use manager::Manager;
pub use pool::{Pool, ResourceError, Stats, Status};
pub use request::ResourceRequest;
