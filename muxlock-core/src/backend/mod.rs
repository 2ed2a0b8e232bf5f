//! Database lock backends.
//!
//! A backend is the pool's only view of the database: it opens physical
//! connections and runs the session-scoped named-mutex primitive on them.
//! Two implementations ship with the crate: an in-process [`memory`] database
//! and PostgreSQL advisory locks (feature `postgres`).

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{MemoryBackend, MemoryDatabase};
#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;

use std::future::Future;
use std::time::Duration;

use crate::error::LockError;
use crate::key::{KeyRules, NamedLockKey};

/// How long a database acquire call may wait for a competing holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    NonBlocking,
    BlockingWithTimeout(Duration),
    Blocking,
}

impl WaitMode {
    pub(crate) fn from_timeout(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) if timeout.is_zero() => WaitMode::NonBlocking,
            Some(timeout) => WaitMode::BlockingWithTimeout(timeout),
            None => WaitMode::Blocking,
        }
    }
}

/// Definite result of an acquire call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    TimedOut,
}

/// Connection factory plus named-lock primitive of one database target.
///
/// Locks are scoped to the connection (session): closing the connection
/// releases everything it holds. Acquiring a key the same session already
/// holds may succeed again, so callers must not rely on the backend for
/// in-process exclusion. Releasing a key that is not held must be benign.
pub trait LockBackend: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Human-readable connection target, used for logging and registry keys.
    fn target(&self) -> &str;

    /// Identifier constraints applied when normalizing lock names.
    fn key_rules(&self) -> KeyRules;

    fn open(&self) -> impl Future<Output = Result<Self::Connection, LockError>> + Send;

    fn acquire(
        &self,
        conn: &mut Self::Connection,
        key: &NamedLockKey,
        wait: WaitMode,
    ) -> impl Future<Output = Result<AcquireOutcome, LockError>> + Send;

    fn release(
        &self,
        conn: &mut Self::Connection,
        key: &NamedLockKey,
    ) -> impl Future<Output = Result<(), LockError>> + Send;
}
