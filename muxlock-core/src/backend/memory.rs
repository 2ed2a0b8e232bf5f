//! In-process lock database.
//!
//! `MemoryDatabase` behaves like a database server offering session-scoped
//! named locks: each opened connection is a session, a session may re-acquire
//! a key it already holds, and closing (dropping) a connection releases all of
//! its keys. It also counts calls and can inject faults, which is what the
//! pool's tests run against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{AcquireOutcome, LockBackend, WaitMode};
use crate::error::LockError;
use crate::key::{KeyRules, NamedLockKey};

struct Holder {
    session: u64,
    depth: u32,
}

#[derive(Default)]
struct DbState {
    locks: HashMap<String, Holder>,
    open_sessions: usize,
    peak_open_sessions: usize,
}

#[derive(Default)]
struct Faults {
    fail_acquires: AtomicUsize,
    fail_releases: AtomicUsize,
    fail_open: AtomicBool,
    release_delay_ms: AtomicU64,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Shared state standing in for a database server.
#[derive(Default)]
pub struct MemoryDatabase {
    state: Mutex<DbState>,
    released: Notify,
    next_session: AtomicU64,
    opened: AtomicU64,
    acquire_calls: AtomicU64,
    release_calls: AtomicU64,
    faults: Faults,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, DbState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_take(&self, key: &str, session: u64) -> bool {
        let mut state = self.state();
        match state.locks.get_mut(key) {
            Some(holder) if holder.session == session => {
                holder.depth += 1;
                true
            }
            Some(_) => false,
            None => {
                state
                    .locks
                    .insert(key.to_string(), Holder { session, depth: 1 });
                true
            }
        }
    }

    fn give_back(&self, key: &str, session: u64) {
        let mut state = self.state();
        let emptied = match state.locks.get_mut(key) {
            Some(holder) if holder.session == session => {
                holder.depth -= 1;
                holder.depth == 0
            }
            _ => false,
        };
        if emptied {
            state.locks.remove(key);
            drop(state);
            self.released.notify_waiters();
        }
    }

    fn open_session(&self) -> u64 {
        let session = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        self.opened.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        state.open_sessions += 1;
        state.peak_open_sessions = state.peak_open_sessions.max(state.open_sessions);
        session
    }

    fn close_session(&self, session: u64) {
        let mut state = self.state();
        state.open_sessions = state.open_sessions.saturating_sub(1);
        let before = state.locks.len();
        state.locks.retain(|_, holder| holder.session != session);
        let freed = before - state.locks.len();
        drop(state);
        debug!(session, freed, "memory session closed");
        if freed > 0 {
            self.released.notify_waiters();
        }
    }

    /// Whether any session currently holds `storage_key`.
    pub fn is_held(&self, storage_key: &str) -> bool {
        self.state().locks.contains_key(storage_key)
    }

    pub fn held_count(&self) -> usize {
        self.state().locks.len()
    }

    pub fn open_connections(&self) -> usize {
        self.state().open_sessions
    }

    pub fn peak_open_connections(&self) -> usize {
        self.state().peak_open_sessions
    }

    /// Total connections ever opened.
    pub fn opened_connections(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn acquire_calls(&self) -> u64 {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> u64 {
        self.release_calls.load(Ordering::SeqCst)
    }

    /// Make the next acquire call fail with a backend error.
    pub fn fail_next_acquire(&self) {
        self.faults.fail_acquires.fetch_add(1, Ordering::SeqCst);
    }

    /// Make the next release call fail; the key stays held by its session.
    pub fn fail_next_release(&self) {
        self.faults.fail_releases.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.faults.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Delay every release call, keeping the caller inside the slot gate.
    pub fn set_release_delay(&self, delay: Duration) {
        self.faults
            .release_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

/// One session on a [`MemoryDatabase`]. Dropping it closes the session.
pub struct MemoryConnection {
    session: u64,
    db: Arc<MemoryDatabase>,
}

impl MemoryConnection {
    pub fn session(&self) -> u64 {
        self.session
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.db.close_session(self.session);
    }
}

#[derive(Clone)]
pub struct MemoryBackend {
    db: Arc<MemoryDatabase>,
    target: String,
    rules: KeyRules,
}

impl MemoryBackend {
    pub fn new(db: Arc<MemoryDatabase>, target: impl Into<String>) -> Self {
        Self {
            db,
            target: target.into(),
            rules: KeyRules::default(),
        }
    }

    pub fn with_key_rules(mut self, rules: KeyRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }
}

impl LockBackend for MemoryBackend {
    type Connection = MemoryConnection;

    fn target(&self) -> &str {
        &self.target
    }

    fn key_rules(&self) -> KeyRules {
        self.rules
    }

    async fn open(&self) -> Result<MemoryConnection, LockError> {
        if self.db.faults.fail_open.load(Ordering::SeqCst) {
            return Err(LockError::Connect(format!(
                "memory database `{}` refused connection",
                self.target
            )));
        }
        Ok(MemoryConnection {
            session: self.db.open_session(),
            db: self.db.clone(),
        })
    }

    async fn acquire(
        &self,
        conn: &mut MemoryConnection,
        key: &NamedLockKey,
        wait: WaitMode,
    ) -> Result<AcquireOutcome, LockError> {
        self.db.acquire_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.db.faults.fail_acquires) {
            return Err(LockError::Backend(format!(
                "injected acquire failure for `{key}`"
            )));
        }

        let deadline = match wait {
            WaitMode::BlockingWithTimeout(timeout) => Instant::now().checked_add(timeout),
            _ => None,
        };

        loop {
            let notified = self.db.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.db.try_take(key.storage_key(), conn.session) {
                return Ok(AcquireOutcome::Granted);
            }

            match (wait, deadline) {
                (WaitMode::NonBlocking, _) => return Ok(AcquireOutcome::TimedOut),
                (WaitMode::BlockingWithTimeout(_), Some(deadline)) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(AcquireOutcome::TimedOut);
                    }
                }
                _ => notified.await,
            }
        }
    }

    async fn release(
        &self,
        conn: &mut MemoryConnection,
        key: &NamedLockKey,
    ) -> Result<(), LockError> {
        self.db.release_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.db.faults.release_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if take_one(&self.db.faults.fail_releases) {
            return Err(LockError::Backend(format!(
                "injected release failure for `{key}`"
            )));
        }
        self.db.give_back(key.storage_key(), conn.session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> NamedLockKey {
        NamedLockKey::normalize(name, &KeyRules::default())
    }

    #[tokio::test]
    async fn sessions_exclude_each_other_but_reenter_themselves() -> Result<(), LockError> {
        let db = MemoryDatabase::new();
        let backend = MemoryBackend::new(db.clone(), "mem");
        let mut first = backend.open().await?;
        let mut second = backend.open().await?;
        let k = key("jobs");

        let granted = backend.acquire(&mut first, &k, WaitMode::NonBlocking).await?;
        assert_eq!(granted, AcquireOutcome::Granted);
        let again = backend.acquire(&mut first, &k, WaitMode::NonBlocking).await?;
        assert_eq!(again, AcquireOutcome::Granted);
        let other = backend.acquire(&mut second, &k, WaitMode::NonBlocking).await?;
        assert_eq!(other, AcquireOutcome::TimedOut);
        Ok(())
    }

    #[tokio::test]
    async fn closing_a_session_frees_its_locks() -> Result<(), LockError> {
        let db = MemoryDatabase::new();
        let backend = MemoryBackend::new(db.clone(), "mem");
        let mut first = backend.open().await?;
        let k = key("jobs");
        backend.acquire(&mut first, &k, WaitMode::NonBlocking).await?;
        assert!(db.is_held("jobs"));

        drop(first);
        assert!(!db.is_held("jobs"));
        assert_eq!(db.open_connections(), 0);
        assert_eq!(db.peak_open_connections(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn blocking_acquire_wakes_on_release() -> Result<(), LockError> {
        let db = MemoryDatabase::new();
        let backend = Arc::new(MemoryBackend::new(db.clone(), "mem"));
        let mut holder = backend.open().await?;
        let k = key("jobs");
        backend.acquire(&mut holder, &k, WaitMode::NonBlocking).await?;

        let waiter_backend = backend.clone();
        let waiter_key = k.clone();
        let waiter = tokio::spawn(async move {
            let mut conn = waiter_backend.open().await?;
            waiter_backend
                .acquire(
                    &mut conn,
                    &waiter_key,
                    WaitMode::BlockingWithTimeout(Duration::from_secs(5)),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.release(&mut holder, &k).await?;
        let outcome = waiter
            .await
            .map_err(|e| LockError::Internal(e.to_string()))??;
        assert_eq!(outcome, AcquireOutcome::Granted);
        Ok(())
    }

    #[tokio::test]
    async fn blocking_acquire_times_out() -> Result<(), LockError> {
        let db = MemoryDatabase::new();
        let backend = MemoryBackend::new(db, "mem");
        let mut holder = backend.open().await?;
        let mut waiter = backend.open().await?;
        let k = key("jobs");
        backend.acquire(&mut holder, &k, WaitMode::NonBlocking).await?;

        let outcome = backend
            .acquire(
                &mut waiter,
                &k,
                WaitMode::BlockingWithTimeout(Duration::from_millis(50)),
            )
            .await?;
        assert_eq!(outcome, AcquireOutcome::TimedOut);
        Ok(())
    }

    #[tokio::test]
    async fn injected_faults_fire_once() -> Result<(), LockError> {
        let db = MemoryDatabase::new();
        let backend = MemoryBackend::new(db.clone(), "mem");
        let mut conn = backend.open().await?;
        let k = key("jobs");

        db.fail_next_acquire();
        assert!(backend
            .acquire(&mut conn, &k, WaitMode::NonBlocking)
            .await
            .is_err());
        assert_eq!(
            backend.acquire(&mut conn, &k, WaitMode::NonBlocking).await?,
            AcquireOutcome::Granted
        );

        db.fail_next_release();
        assert!(backend.release(&mut conn, &k).await.is_err());
        assert!(db.is_held("jobs"));
        backend.release(&mut conn, &k).await?;
        assert!(!db.is_held("jobs"));
        assert_eq!(db.acquire_calls(), 2);
        assert_eq!(db.release_calls(), 2);

        db.set_fail_open(true);
        assert!(matches!(backend.open().await, Err(LockError::Connect(_))));
        Ok(())
    }
}
