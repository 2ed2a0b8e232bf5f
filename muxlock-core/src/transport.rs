//! Bounded pool of physical connections beneath the lock slots.
//!
//! Every slot borrows its connection from here, so `max_connections` caps the
//! number of database sessions the process opens for locking. Borrowing waits
//! on a semaphore; saturation is reported as [`LockError::PoolExhausted`] and
//! is never retried here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::backend::LockBackend;
use crate::error::LockError;

#[derive(Debug, Clone)]
pub(crate) struct TransportConfig {
    pub(crate) max_connections: usize,
    pub(crate) acquire_timeout: Duration,
    /// Zero disables idle eviction.
    pub(crate) idle_ttl: Duration,
}

struct IdleConnection<C> {
    conn: C,
    last_used: Instant,
}

struct IdleState<C> {
    idle: Vec<IdleConnection<C>>,
    closed: bool,
}

fn evict_idle<C>(state: &mut IdleState<C>, idle_ttl: Duration) -> usize {
    if idle_ttl.is_zero() {
        return 0;
    }
    let cutoff = Instant::now().checked_sub(idle_ttl).unwrap_or_else(Instant::now);
    let before = state.idle.len();
    state.idle.retain(|entry| entry.last_used >= cutoff);
    before - state.idle.len()
}

pub(crate) struct TransportPool<B: LockBackend> {
    backend: Arc<B>,
    config: TransportConfig,
    state: Mutex<IdleState<B::Connection>>,
    total: AtomicUsize,
    semaphore: Arc<Semaphore>,
}

/// Undoes a `total` reservation if connection creation does not finish.
struct CreateReservation<'a> {
    total: &'a AtomicUsize,
    armed: bool,
}

impl Drop for CreateReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.total.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl<B: LockBackend> TransportPool<B> {
    pub(crate) fn new(backend: Arc<B>, config: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            backend,
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config,
            state: Mutex::new(IdleState {
                idle: Vec::new(),
                closed: false,
            }),
            total: AtomicUsize::new(0),
        })
    }

    fn state(&self) -> MutexGuard<'_, IdleState<B::Connection>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn acquire_timeout(&self) -> Duration {
        self.config.acquire_timeout
    }

    pub(crate) fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    /// Connections currently open, borrowed or idle.
    pub(crate) fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub(crate) fn idle(&self) -> usize {
        self.state().idle.len()
    }

    /// Borrow a connection, waiting at most `wait` for a free permit.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        wait: Duration,
    ) -> Result<PooledConnection<B>, LockError> {
        let permit =
            match tokio::time::timeout(wait, self.semaphore.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(LockError::PoolClosed),
                Err(_) => {
                    return Err(LockError::PoolExhausted {
                        max_connections: self.config.max_connections,
                    })
                }
            };

        let idle_conn = {
            let mut state = self.state();
            if state.closed {
                return Err(LockError::PoolClosed);
            }
            self.evict_idle_locked(&mut state);
            state.idle.pop().map(|idle| idle.conn)
        };

        if let Some(conn) = idle_conn {
            return Ok(PooledConnection::new(conn, self.clone(), permit));
        }

        // A permit guarantees room below max_connections once idle entries
        // are accounted for.
        self.total.fetch_add(1, Ordering::SeqCst);
        let mut reservation = CreateReservation {
            total: &self.total,
            armed: true,
        };
        let conn = self.backend.open().await?;
        reservation.armed = false;
        debug!(
            target_db = self.backend.target(),
            total = self.total(),
            "opened lock connection"
        );
        Ok(PooledConnection::new(conn, self.clone(), permit))
    }

    fn release_connection(&self, conn: B::Connection) {
        let mut state = self.state();
        if state.closed {
            drop(state);
            self.drop_connection(conn);
            return;
        }
        self.evict_idle_locked(&mut state);
        state.idle.push(IdleConnection {
            conn,
            last_used: Instant::now(),
        });
    }

    fn drop_connection(&self, conn: B::Connection) {
        drop(conn);
        self.total.fetch_sub(1, Ordering::SeqCst);
    }

    fn evict_idle_locked(&self, state: &mut IdleState<B::Connection>) {
        let removed = evict_idle(state, self.config.idle_ttl);
        if removed > 0 {
            self.total.fetch_sub(removed, Ordering::SeqCst);
        }
    }

    pub(crate) fn evict_stale(&self) -> usize {
        let mut state = self.state();
        let before = state.idle.len();
        self.evict_idle_locked(&mut state);
        before - state.idle.len()
    }

    /// Close idle connections and refuse further borrows.
    pub(crate) fn close(&self) {
        let drained = {
            let mut state = self.state();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        self.total.fetch_sub(drained.len(), Ordering::SeqCst);
        drop(drained);
        self.semaphore.close();
    }
}

/// A borrowed connection. Returned to the pool on drop unless marked as
/// errored, in which case it is closed.
pub(crate) struct PooledConnection<B: LockBackend> {
    conn: Option<B::Connection>,
    pool: Arc<TransportPool<B>>,
    _permit: OwnedSemaphorePermit,
    had_error: bool,
}

impl<B: LockBackend> PooledConnection<B> {
    fn new(conn: B::Connection, pool: Arc<TransportPool<B>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            pool,
            _permit: permit,
            had_error: false,
        }
    }

    pub(crate) fn connection_mut(&mut self) -> Result<&mut B::Connection, LockError> {
        self.conn
            .as_mut()
            .ok_or_else(|| LockError::Internal("pooled connection missing".to_string()))
    }

    /// Mark the session state as unknown; the connection will be closed.
    pub(crate) fn mark_error(&mut self) {
        self.had_error = true;
    }

    pub(crate) fn clear_error(&mut self) {
        self.had_error = false;
    }

    pub(crate) fn had_error(&self) -> bool {
        self.had_error
    }
}

impl<B: LockBackend> Drop for PooledConnection<B> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.had_error {
                self.pool.drop_connection(conn);
            } else {
                self.pool.release_connection(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, MemoryDatabase};

    fn pool(
        db: &Arc<MemoryDatabase>,
        max_connections: usize,
        idle_ttl: Duration,
    ) -> Arc<TransportPool<MemoryBackend>> {
        TransportPool::new(
            Arc::new(MemoryBackend::new(db.clone(), "mem")),
            TransportConfig {
                max_connections,
                acquire_timeout: Duration::from_millis(50),
                idle_ttl,
            },
        )
    }

    #[test]
    fn evict_idle_keeps_connections_when_ttl_is_zero() {
        let mut state: IdleState<()> = IdleState {
            idle: vec![IdleConnection {
                conn: (),
                last_used: Instant::now() - Duration::from_secs(5),
            }],
            closed: false,
        };
        assert_eq!(evict_idle(&mut state, Duration::ZERO), 0);
        assert_eq!(state.idle.len(), 1);
    }

    #[test]
    fn evict_idle_removes_only_stale_entries() {
        let mut state: IdleState<u8> = IdleState {
            idle: vec![
                IdleConnection {
                    conn: 1,
                    last_used: Instant::now() - Duration::from_secs(5),
                },
                IdleConnection {
                    conn: 2,
                    last_used: Instant::now(),
                },
            ],
            closed: false,
        };
        assert_eq!(evict_idle(&mut state, Duration::from_secs(1)), 1);
        assert_eq!(state.idle.len(), 1);
        assert_eq!(state.idle[0].conn, 2);
    }

    #[tokio::test]
    async fn returned_connections_are_reused() -> Result<(), LockError> {
        let db = MemoryDatabase::new();
        let transport = pool(&db, 2, Duration::ZERO);

        let first = transport.acquire(Duration::from_millis(50)).await?;
        drop(first);
        let _second = transport.acquire(Duration::from_millis(50)).await?;

        assert_eq!(db.opened_connections(), 1);
        assert_eq!(transport.total(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn saturated_pool_reports_exhaustion() -> Result<(), LockError> {
        let db = MemoryDatabase::new();
        let transport = pool(&db, 1, Duration::ZERO);

        let _held = transport.acquire(Duration::from_millis(50)).await?;
        let err = transport
            .acquire(Duration::from_millis(20))
            .await
            .err()
            .ok_or_else(|| LockError::Internal("expected exhaustion".to_string()))?;
        assert!(matches!(
            err,
            LockError::PoolExhausted { max_connections: 1 }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn errored_connections_are_closed_not_reused() -> Result<(), LockError> {
        let db = MemoryDatabase::new();
        let transport = pool(&db, 2, Duration::ZERO);

        let mut conn = transport.acquire(Duration::from_millis(50)).await?;
        conn.mark_error();
        drop(conn);

        assert_eq!(transport.total(), 0);
        assert_eq!(transport.idle(), 0);
        assert_eq!(db.open_connections(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_open_does_not_leak_capacity() -> Result<(), LockError> {
        let db = MemoryDatabase::new();
        let transport = pool(&db, 1, Duration::ZERO);

        db.set_fail_open(true);
        assert!(transport.acquire(Duration::from_millis(50)).await.is_err());
        db.set_fail_open(false);
        let _conn = transport.acquire(Duration::from_millis(50)).await?;
        assert_eq!(transport.total(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn closed_pool_rejects_borrows() {
        let db = MemoryDatabase::new();
        let transport = pool(&db, 1, Duration::ZERO);
        transport.close();
        assert!(matches!(
            transport.acquire(Duration::from_millis(10)).await,
            Err(LockError::PoolClosed)
        ));
    }
}
