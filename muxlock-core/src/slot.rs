//! A physical connection shared by several held locks.
//!
//! The gate is an async mutex that owns the connection, so at most one task
//! talks to the session at a time. Bookkeeping (`held`, activity, poisoning)
//! lives behind a plain mutex that is never held across an await.
//!
//! A slot is poisoned when a database call on it failed or was cancelled
//! mid-flight. Poisoned slots take no new locks and their connection is
//! closed, not returned to the transport pool, once no locks remain on it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::backend::{AcquireOutcome, LockBackend, WaitMode};
use crate::error::LockError;
use crate::key::NamedLockKey;
use crate::transport::PooledConnection;

/// Result of a single optimistic attempt on a slot.
#[derive(Debug)]
pub(crate) enum SlotAttempt {
    Acquired,
    /// The gate was taken, or the slot cannot accept new locks.
    Busy,
    /// The key is held, by this slot or by another session.
    Contended,
    Failed(LockError),
}

struct SlotState {
    held: HashSet<NamedLockKey>,
    last_activity: Instant,
    poisoned: bool,
    closed: bool,
}

/// Poisons the slot on drop while armed, covering both failed calls and
/// futures dropped mid-call.
struct CallGuard<'a> {
    state: &'a Mutex<SlotState>,
    armed: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .poisoned = true;
        }
    }
}

pub(crate) struct SharedSlot<B: LockBackend> {
    id: u64,
    backend: Arc<B>,
    gate: tokio::sync::Mutex<Option<PooledConnection<B>>>,
    state: Mutex<SlotState>,
}

impl<B: LockBackend> SharedSlot<B> {
    /// Wrap a connection that already holds `key`.
    pub(crate) fn with_key(
        id: u64,
        backend: Arc<B>,
        conn: PooledConnection<B>,
        key: NamedLockKey,
    ) -> Arc<Self> {
        let mut held = HashSet::new();
        held.insert(key);
        Arc::new(Self {
            id,
            backend,
            gate: tokio::sync::Mutex::new(Some(conn)),
            state: Mutex::new(SlotState {
                held,
                last_activity: Instant::now(),
                poisoned: false,
                closed: false,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn held_count(&self) -> usize {
        self.state().held.len()
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.state().poisoned
    }

    /// Whether an optimistic attempt for `key` is worth making here.
    pub(crate) fn accepts(&self, key: &NamedLockKey) -> bool {
        let state = self.state();
        !state.closed && !state.poisoned && !state.held.contains(key)
    }

    /// Assume the worst before a database call. The returned guard poisons
    /// the slot unless the call completes and is passed to `end_call`.
    fn begin_call(&self, conn: &mut PooledConnection<B>) -> CallGuard<'_> {
        conn.mark_error();
        CallGuard {
            state: &self.state,
            armed: true,
        }
    }

    fn end_call(&self, conn: &mut PooledConnection<B>, mut guard: CallGuard<'_>) {
        guard.armed = false;
        if !self.state().poisoned {
            conn.clear_error();
        }
    }

    /// One non-blocking attempt to take `key` on this slot's session.
    pub(crate) async fn try_acquire(&self, key: &NamedLockKey) -> SlotAttempt {
        let Ok(mut gate) = self.gate.try_lock() else {
            return SlotAttempt::Busy;
        };
        let Some(conn) = gate.as_mut() else {
            return SlotAttempt::Busy;
        };
        {
            let state = self.state();
            if state.poisoned || state.closed {
                return SlotAttempt::Busy;
            }
            // Session locks are re-entrant; the database would grant it again.
            if state.held.contains(key) {
                return SlotAttempt::Contended;
            }
        }

        let guard = self.begin_call(conn);
        let outcome = match conn.connection_mut() {
            Ok(raw) => {
                self.backend
                    .acquire(raw, key, WaitMode::NonBlocking)
                    .await
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(AcquireOutcome::Granted) => {
                self.end_call(conn, guard);
                let mut state = self.state();
                state.held.insert(key.clone());
                state.last_activity = Instant::now();
                debug!(
                    slot = self.id,
                    key = %key,
                    held = state.held.len(),
                    "multiplexed lock onto shared connection"
                );
                SlotAttempt::Acquired
            }
            Ok(AcquireOutcome::TimedOut) => {
                self.end_call(conn, guard);
                self.state().last_activity = Instant::now();
                SlotAttempt::Contended
            }
            Err(err) => {
                drop(guard);
                warn!(
                    slot = self.id,
                    key = %key,
                    error = %err,
                    "lock acquire failed on shared connection"
                );
                SlotAttempt::Failed(err)
            }
        }
    }

    /// Release `key` on this slot. The key leaves `held` even when the
    /// database call fails.
    pub(crate) async fn release(&self, key: &NamedLockKey) -> Result<(), LockError> {
        let mut gate = self.gate.lock().await;
        let result = match gate.as_mut() {
            // Closing the session already dropped every lock it held.
            None => Ok(()),
            Some(conn) => {
                let guard = self.begin_call(conn);
                let result = match conn.connection_mut() {
                    Ok(raw) => self.backend.release(raw, key).await,
                    Err(err) => Err(err),
                };
                if result.is_ok() {
                    self.end_call(conn, guard);
                }
                result
            }
        };

        let mut state = self.state();
        state.held.remove(key);
        state.last_activity = Instant::now();
        drop(state);
        drop(gate);

        if let Err(err) = &result {
            warn!(
                slot = self.id,
                key = %key,
                error = %err,
                "lock release failed; connection will be discarded"
            );
        }
        result
    }

    /// Close the slot if it holds nothing and is either poisoned or has been
    /// idle for at least `idle_grace`. Never waits for the gate.
    pub(crate) fn try_close_if_idle(&self, idle_grace: Duration) -> bool {
        let Ok(mut gate) = self.gate.try_lock() else {
            return false;
        };
        let conn = {
            let mut state = self.state();
            if state.closed {
                return true;
            }
            if !state.held.is_empty() {
                return false;
            }
            if !state.poisoned && state.last_activity.elapsed() < idle_grace {
                return false;
            }
            state.closed = true;
            gate.take()
        };
        drop(gate);
        debug!(
            slot = self.id,
            discarded = ?conn.as_ref().map(|c| c.had_error()),
            "closed idle lock connection"
        );
        drop(conn);
        true
    }

    /// Close the slot unconditionally, ending its session and every lock on
    /// it. Returns the number of keys that were still held.
    pub(crate) async fn close(&self) -> usize {
        let mut gate = self.gate.lock().await;
        let dropped = {
            let mut state = self.state();
            state.closed = true;
            let dropped = state.held.len();
            state.held.clear();
            dropped
        };
        if let Some(mut conn) = gate.take() {
            conn.mark_error();
        }
        dropped
    }
}
