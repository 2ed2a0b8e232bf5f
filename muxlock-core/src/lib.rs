//! Named database locks multiplexed over a small pool of shared connections.
//!
//! Database named locks (PostgreSQL advisory locks and the like) are owned by
//! a session, so holding many of them usually costs one connection each. A
//! [`MultiplexedPool`] instead piles locks onto connections that already hold
//! other locks, falling back to a dedicated connection only when the shared
//! ones are busy.
//!
//! ```no_run
//! # async fn demo() -> Result<(), muxlock_core::LockError> {
//! use std::time::Duration;
//! use muxlock_core::{LockPoolConfig, MultiplexedPool, PostgresBackend};
//!
//! let pool = MultiplexedPool::new(PostgresBackend::from_env(), &LockPoolConfig::load()?)?;
//! let handle = pool.acquire("reports/nightly", Some(Duration::from_secs(5))).await?;
//! // ... critical section ...
//! handle.release().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod handle;
pub mod key;
pub mod metrics;
pub mod pool;
pub mod registry;
mod slot;
mod transport;

pub use backend::{AcquireOutcome, LockBackend, MemoryBackend, MemoryDatabase, WaitMode};
#[cfg(feature = "postgres")]
pub use backend::PostgresBackend;
pub use config::LockPoolConfig;
pub use error::LockError;
pub use handle::{LockHandle, NamedLock};
pub use key::{KeyCharset, KeyRules, NamedLockKey};
pub use metrics::{AcquisitionTotals, PoolSnapshot};
pub use pool::MultiplexedPool;
pub use registry::PoolRegistry;
