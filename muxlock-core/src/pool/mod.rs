//! The optimistic connection-multiplexing pool.
//!
//! A request for key `k` goes through at most two phases:
//!
//! 1. **Optimistic**: pick one open shared connection that does not already
//!    hold `k` and make a single non-blocking attempt on it. The attempt
//!    reports busy instead of waiting when the connection's gate is taken,
//!    even if the database would have granted the lock. It is never retried.
//! 2. **Dedicated**: borrow a connection from the transport pool and run the
//!    database acquire on it, blocking up to the caller's timeout when asked
//!    to. On success the connection becomes a new shared slot.
//!
//! Registration of a held key is a compare-and-insert under the pool mutex,
//! which is also what the sweeper and releases use, so at most one handle
//! exists per key.

mod sweeper;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::backend::{AcquireOutcome, LockBackend, WaitMode};
use crate::config::LockPoolConfig;
use crate::error::LockError;
use crate::handle::{HandleToken, LockHandle, NamedLock};
use crate::key::NamedLockKey;
use crate::metrics::{PoolMetrics, PoolSnapshot};
use crate::slot::{SharedSlot, SlotAttempt};
use crate::transport::TransportPool;

pub(crate) struct HeldEntry<B: LockBackend> {
    slot: Arc<SharedSlot<B>>,
    handle_id: u64,
    token: Weak<HandleToken>,
}

struct PoolState<B: LockBackend> {
    slots: Vec<Arc<SharedSlot<B>>>,
    held: HashMap<NamedLockKey, HeldEntry<B>>,
    cursor: usize,
    shut_down: bool,
}

#[derive(Debug, Clone, Copy)]
enum Request {
    /// Zero-wait attempt; contention is not an error.
    Try,
    Block(Option<Duration>),
}

enum Conflict {
    Held,
    ShutDown,
}

pub(crate) struct PoolInner<B: LockBackend> {
    backend: Arc<B>,
    transport: Arc<TransportPool<B>>,
    state: Mutex<PoolState<B>>,
    cleanup_interval_ms: AtomicU64,
    interval_changed: Arc<Notify>,
    slot_idle_grace: Duration,
    lease: Option<Duration>,
    sweeper_started: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    next_slot_id: AtomicU64,
    next_handle_id: AtomicU64,
    metrics: PoolMetrics,
}

/// Named locks for one database target, multiplexed over shared connections.
pub struct MultiplexedPool<B: LockBackend> {
    inner: Arc<PoolInner<B>>,
}

impl<B: LockBackend> Clone for MultiplexedPool<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: LockBackend> MultiplexedPool<B> {
    pub fn new(backend: B, config: &LockPoolConfig) -> Result<Self, LockError> {
        config.validate()?;
        let backend = Arc::new(backend);
        let transport = TransportPool::new(backend.clone(), config.transport());
        info!(
            target_db = backend.target(),
            max_connections = config.max_connections,
            cleanup_interval_seconds = config.cleanup_interval_seconds,
            lease_seconds = ?config.lease_seconds,
            "lock pool initialized"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                backend,
                transport,
                state: Mutex::new(PoolState {
                    slots: Vec::new(),
                    held: HashMap::new(),
                    cursor: 0,
                    shut_down: false,
                }),
                cleanup_interval_ms: AtomicU64::new(config.cleanup_interval().as_millis() as u64),
                interval_changed: Arc::new(Notify::new()),
                slot_idle_grace: config.slot_idle_grace(),
                lease: config.lease(),
                sweeper_started: AtomicBool::new(false),
                sweeper: Mutex::new(None),
                next_slot_id: AtomicU64::new(1),
                next_handle_id: AtomicU64::new(1),
                metrics: PoolMetrics::default(),
            }),
        })
    }

    pub fn target(&self) -> &str {
        self.inner.backend.target()
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn normalize(&self, name: &str) -> NamedLockKey {
        NamedLockKey::normalize(name, &self.inner.backend.key_rules())
    }

    /// A reusable lock object for `name`.
    pub fn lock(&self, name: &str) -> NamedLock<B> {
        NamedLock::new(self.clone(), self.normalize(name))
    }

    /// Wait up to `timeout` (forever when `None`) for `name`.
    ///
    /// Contention that outlasts the timeout is reported as
    /// [`LockError::Timeout`]. Dropping the returned future cancels the
    /// attempt without leaving anything registered.
    pub async fn acquire(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<LockHandle<B>, LockError> {
        self.acquire_key(self.normalize(name), timeout).await
    }

    /// Take `name` only if it is free right now.
    pub async fn try_acquire(&self, name: &str) -> Result<Option<LockHandle<B>>, LockError> {
        self.try_acquire_key(self.normalize(name)).await
    }

    pub async fn release(&self, handle: &LockHandle<B>) -> Result<(), LockError> {
        if !handle.belongs_to(&self.inner) {
            return Err(LockError::Internal(format!(
                "handle for `{}` belongs to a different pool",
                handle.name()
            )));
        }
        handle.release().await
    }

    #[instrument(level = "debug", skip(self, key), fields(key = %key))]
    pub(crate) async fn acquire_key(
        &self,
        key: NamedLockKey,
        timeout: Option<Duration>,
    ) -> Result<LockHandle<B>, LockError> {
        let name = key.name().to_string();
        let started = Instant::now();
        match self.inner.acquire(key, Request::Block(timeout)).await? {
            Some(handle) => Ok(handle),
            None => Err(LockError::Timeout {
                name,
                waited: started.elapsed(),
            }),
        }
    }

    #[instrument(level = "debug", skip(self, key), fields(key = %key))]
    pub(crate) async fn try_acquire_key(
        &self,
        key: NamedLockKey,
    ) -> Result<Option<LockHandle<B>>, LockError> {
        self.inner.acquire(key, Request::Try).await
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.inner.cleanup_interval()
    }

    /// Change the sweeper period; a running sweeper picks it up immediately.
    pub fn set_cleanup_interval(&self, interval: Duration) {
        let millis = (interval.as_millis() as u64).max(1);
        self.inner
            .cleanup_interval_ms
            .store(millis, Ordering::SeqCst);
        self.inner.interval_changed.notify_one();
        debug!(
            target_db = self.target(),
            cleanup_interval_ms = millis,
            "cleanup interval changed"
        );
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let (open_slots, poisoned_slots, held_locks) = {
            let state = self.inner.state();
            let poisoned = state.slots.iter().filter(|s| s.is_poisoned()).count();
            (state.slots.len(), poisoned, state.held.len())
        };
        PoolSnapshot {
            target: self.target().to_string(),
            open_slots,
            poisoned_slots,
            held_locks,
            transport_connections: self.inner.transport.total(),
            idle_connections: self.inner.transport.idle(),
            max_connections: self.inner.transport.max_connections(),
            cleanup_interval_ms: self.inner.cleanup_interval().as_millis() as u64,
            totals: self.inner.metrics.totals(),
        }
    }

    /// Stop the sweeper and close every connection, which ends all sessions
    /// and therefore every lock they held. Outstanding handles become
    /// released no-ops. Later acquisitions fail with [`LockError::ShutDown`].
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    pub fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run one cleanup pass now instead of waiting for the sweeper.
    pub async fn sweep_now(&self) {
        self.inner.sweep().await;
    }
}

impl<B: LockBackend> PoolInner<B> {
    fn state(&self) -> MutexGuard<'_, PoolState<B>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.load(Ordering::SeqCst))
    }

    fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(
                target_db = self.backend.target(),
                "no tokio runtime; abandoned locks will not be reclaimed until one is available"
            );
            self.sweeper_started.store(false, Ordering::SeqCst);
            return;
        }
        let handle = sweeper::spawn(self);
        *self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    /// Round-robin over slots that could take `key`.
    fn pick_candidate(state: &mut PoolState<B>, key: &NamedLockKey) -> Option<Arc<SharedSlot<B>>> {
        let n = state.slots.len();
        for offset in 0..n {
            let idx = (state.cursor + offset) % n;
            if state.slots[idx].accepts(key) {
                state.cursor = idx + 1;
                return Some(state.slots[idx].clone());
            }
        }
        None
    }

    async fn acquire(
        self: &Arc<Self>,
        key: NamedLockKey,
        request: Request,
    ) -> Result<Option<LockHandle<B>>, LockError> {
        let started = Instant::now();
        let deadline = match request {
            Request::Try => None,
            Request::Block(timeout) => timeout.and_then(|t| started.checked_add(t)),
        };
        self.ensure_sweeper();

        let candidate = {
            let mut state = self.state();
            if state.shut_down {
                return Err(LockError::ShutDown);
            }
            if state.held.contains_key(&key) {
                if matches!(request, Request::Try) {
                    PoolMetrics::incr(&self.metrics.contended);
                    debug!(key = %key, "lock already held in this process");
                    return Ok(None);
                }
                None
            } else {
                Self::pick_candidate(&mut state, &key)
            }
        };

        if let Some(slot) = candidate {
            match slot.try_acquire(&key).await {
                SlotAttempt::Acquired => {
                    match self.register(key.clone(), slot.clone(), false) {
                        Ok(handle) => {
                            PoolMetrics::incr(&self.metrics.optimistic);
                            return Ok(Some(handle));
                        }
                        Err(conflict) => {
                            return self.roll_back(key, slot, conflict, request).await
                        }
                    }
                }
                SlotAttempt::Contended => {
                    if matches!(request, Request::Try) {
                        PoolMetrics::incr(&self.metrics.contended);
                        return Ok(None);
                    }
                }
                SlotAttempt::Busy => {
                    PoolMetrics::incr(&self.metrics.fallbacks);
                    debug!(
                        key = %key,
                        slot = slot.id(),
                        "shared connection busy; using a dedicated connection"
                    );
                }
                SlotAttempt::Failed(err) => {
                    PoolMetrics::incr(&self.metrics.fallbacks);
                    debug!(
                        key = %key,
                        slot = slot.id(),
                        error = %err,
                        "shared connection failed; using a dedicated connection"
                    );
                    self.prune_if_poisoned(&slot);
                }
            }
        }

        self.acquire_dedicated(key, request, started, deadline).await
    }

    async fn acquire_dedicated(
        self: &Arc<Self>,
        key: NamedLockKey,
        request: Request,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<Option<LockHandle<B>>, LockError> {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let pool_timeout = self.transport.acquire_timeout();
        let (transport_wait, bounded_by_caller) = match remaining {
            Some(left) if left < pool_timeout => (left, true),
            _ => (pool_timeout, false),
        };

        let mut conn = match self.transport.acquire(transport_wait).await {
            Ok(conn) => conn,
            Err(LockError::PoolExhausted { .. }) if bounded_by_caller => {
                PoolMetrics::incr(&self.metrics.contended);
                return Err(LockError::Timeout {
                    name: key.name().to_string(),
                    waited: started.elapsed(),
                });
            }
            Err(err) => {
                PoolMetrics::incr(&self.metrics.failed);
                warn!(key = %key, error = %err, "no connection for dedicated lock acquisition");
                return Err(err);
            }
        };

        let wait = match request {
            Request::Try => WaitMode::NonBlocking,
            Request::Block(None) => WaitMode::Blocking,
            Request::Block(Some(_)) => WaitMode::from_timeout(
                deadline.map(|d| d.saturating_duration_since(Instant::now())),
            ),
        };

        // Until the call returns, the session's lock state is unknown and a
        // cancelled acquisition must not hand the connection back.
        conn.mark_error();
        let outcome = {
            let raw = conn.connection_mut()?;
            self.backend.acquire(raw, &key, wait).await
        };

        match outcome {
            Ok(AcquireOutcome::Granted) => conn.clear_error(),
            Ok(AcquireOutcome::TimedOut) => {
                conn.clear_error();
                PoolMetrics::incr(&self.metrics.contended);
                drop(conn);
                return match request {
                    Request::Try => Ok(None),
                    Request::Block(_) => Err(LockError::Timeout {
                        name: key.name().to_string(),
                        waited: started.elapsed(),
                    }),
                };
            }
            Err(err) => {
                PoolMetrics::incr(&self.metrics.failed);
                warn!(key = %key, error = %err, "dedicated lock acquisition failed");
                return Err(err);
            }
        }

        let slot_id = self.next_slot_id.fetch_add(1, Ordering::SeqCst);
        let slot = SharedSlot::with_key(slot_id, self.backend.clone(), conn, key.clone());
        match self.register(key.clone(), slot.clone(), true) {
            Ok(handle) => {
                PoolMetrics::incr(&self.metrics.dedicated);
                debug!(key = %key, slot = slot_id, "lock acquired on dedicated connection");
                Ok(Some(handle))
            }
            Err(conflict) => self.roll_back(key, slot, conflict, request).await,
        }
    }

    /// Compare-and-insert `key`; `fresh` slots join the shared set.
    fn register(
        self: &Arc<Self>,
        key: NamedLockKey,
        slot: Arc<SharedSlot<B>>,
        fresh: bool,
    ) -> Result<LockHandle<B>, Conflict> {
        let mut state = self.state();
        if state.shut_down {
            return Err(Conflict::ShutDown);
        }
        if state.held.contains_key(&key) {
            return Err(Conflict::Held);
        }
        let handle_id = self.next_handle_id.fetch_add(1, Ordering::SeqCst);
        let token = HandleToken::new(handle_id);
        state.held.insert(
            key.clone(),
            HeldEntry {
                slot: slot.clone(),
                handle_id,
                token: Arc::downgrade(&token),
            },
        );
        if fresh {
            state.slots.push(slot.clone());
        }
        Ok(LockHandle::new(token, key, slot, self.clone()))
    }

    async fn roll_back(
        self: &Arc<Self>,
        key: NamedLockKey,
        slot: Arc<SharedSlot<B>>,
        conflict: Conflict,
        request: Request,
    ) -> Result<Option<LockHandle<B>>, LockError> {
        warn!(key = %key, slot = slot.id(), "lock registered concurrently; rolling back");
        if let Err(err) = self.release_on_slot(key.clone(), slot).await {
            warn!(key = %key, error = %err, "rollback release failed");
        }
        match (conflict, request) {
            (Conflict::ShutDown, _) => Err(LockError::ShutDown),
            (Conflict::Held, Request::Try) => Ok(None),
            (Conflict::Held, Request::Block(_)) => Err(LockError::Timeout {
                name: key.name().to_string(),
                waited: Duration::ZERO,
            }),
        }
    }

    /// Release on a spawned task so a dropped caller future cannot stop the
    /// slot bookkeeping halfway.
    async fn release_on_slot(
        &self,
        key: NamedLockKey,
        slot: Arc<SharedSlot<B>>,
    ) -> Result<(), LockError> {
        let task_slot = slot.clone();
        let result = tokio::spawn(async move { task_slot.release(&key).await })
            .await
            .map_err(|e| LockError::Internal(format!("release task failed: {e}")))?;
        self.prune_if_poisoned(&slot);
        result
    }

    pub(crate) async fn release_entry(
        &self,
        key: NamedLockKey,
        handle_id: u64,
        slot: Arc<SharedSlot<B>>,
    ) -> Result<(), LockError> {
        {
            let mut state = self.state();
            if state
                .held
                .get(&key)
                .is_some_and(|entry| entry.handle_id == handle_id)
            {
                state.held.remove(&key);
            }
        }
        PoolMetrics::incr(&self.metrics.released);
        self.release_on_slot(key, slot).await
    }

    fn prune_if_poisoned(&self, slot: &Arc<SharedSlot<B>>) {
        if !slot.is_poisoned() {
            return;
        }
        let mut state = self.state();
        if slot.try_close_if_idle(self.slot_idle_grace) {
            state.slots.retain(|s| !Arc::ptr_eq(s, slot));
            PoolMetrics::incr(&self.metrics.slots_closed);
        }
    }

    async fn shutdown(&self) {
        let (slots, tokens) = {
            let mut state = self.state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            let tokens: Vec<_> = state
                .held
                .drain()
                .filter_map(|(_, entry)| entry.token.upgrade())
                .collect();
            (std::mem::take(&mut state.slots), tokens)
        };
        for token in &tokens {
            token.mark_released();
        }
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }

        let mut dropped = 0;
        for slot in &slots {
            dropped += slot.close().await;
        }
        PoolMetrics::add(&self.metrics.slots_closed, slots.len());
        self.transport.close();
        info!(
            target_db = self.backend.target(),
            closed_slots = slots.len(),
            dropped_locks = dropped,
            "lock pool shut down"
        );
    }
}

impl<B: LockBackend> Drop for PoolInner<B> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}
