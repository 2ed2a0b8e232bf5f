use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock `{name}`")]
    Timeout { name: String, waited: Duration },
    #[error("connection pool exhausted (max_connections={max_connections})")]
    PoolExhausted { max_connections: usize },
    #[error("connection pool closed")]
    PoolClosed,
    #[error("failed to open connection: {0}")]
    Connect(String),
    #[error("lock backend error: {0}")]
    Backend(String),
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("lock pool has been shut down")]
    ShutDown,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl LockError {
    /// True for failures caused by another holder rather than a fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }
}
