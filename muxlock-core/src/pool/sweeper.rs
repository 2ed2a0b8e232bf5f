//! Periodic cleanup: reclaims abandoned locks and expired leases, then closes
//! shared connections that have been empty for the idle grace period.

use std::sync::{Arc, Weak};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::PoolInner;
use crate::backend::LockBackend;
use crate::metrics::PoolMetrics;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct SweepReport {
    pub(super) abandoned: usize,
    pub(super) expired: usize,
    pub(super) closed_slots: usize,
    pub(super) evicted_connections: usize,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub(super) fn spawn<B: LockBackend>(inner: &Arc<PoolInner<B>>) -> JoinHandle<()> {
    let pool = Arc::downgrade(inner);
    let changed = inner.interval_changed.clone();
    tokio::spawn(run(pool, changed))
}

/// The task holds only a weak reference so an unused pool can be dropped.
async fn run<B: LockBackend>(pool: Weak<PoolInner<B>>, changed: Arc<Notify>) {
    loop {
        let interval = match pool.upgrade() {
            Some(inner) => inner.cleanup_interval(),
            None => return,
        };
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            // Restart the wait with the new interval.
            _ = changed.notified() => continue,
        }

        let Some(inner) = pool.upgrade() else {
            return;
        };
        if inner.is_shut_down() {
            return;
        }
        let report = inner.sweep().await;
        if !report.is_empty() {
            debug!(
                target_db = inner.backend.target(),
                abandoned = report.abandoned,
                expired = report.expired,
                closed_slots = report.closed_slots,
                evicted_connections = report.evicted_connections,
                "cleanup pass finished"
            );
        }
    }
}

impl<B: LockBackend> PoolInner<B> {
    pub(super) async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let reclaim = {
            let mut state = self.state();
            if state.shut_down {
                return report;
            }
            let mut doomed = Vec::new();
            for (key, entry) in state.held.iter() {
                match entry.token.upgrade() {
                    None => {
                        report.abandoned += 1;
                        doomed.push(key.clone());
                    }
                    Some(token) => {
                        let expired = self
                            .lease
                            .is_some_and(|lease| token.lease_expired(lease));
                        if expired && token.mark_released() {
                            report.expired += 1;
                            doomed.push(key.clone());
                        }
                    }
                }
            }
            doomed
                .into_iter()
                .filter_map(|key| state.held.remove(&key).map(|entry| (key, entry.slot)))
                .collect::<Vec<_>>()
        };

        for (key, slot) in reclaim {
            info!(
                key = %key,
                slot = slot.id(),
                "reclaiming lock whose owner is gone or whose lease expired"
            );
            // Failure poisons the slot; it is closed below once empty.
            let _ = self.release_on_slot(key, slot).await;
        }
        PoolMetrics::add(&self.metrics.abandoned, report.abandoned);
        PoolMetrics::add(&self.metrics.leases_expired, report.expired);

        {
            let mut state = self.state();
            let before = state.slots.len();
            state
                .slots
                .retain(|slot| !slot.try_close_if_idle(self.slot_idle_grace));
            report.closed_slots = before - state.slots.len();
        }
        PoolMetrics::add(&self.metrics.slots_closed, report.closed_slots);
        report.evicted_connections = self.transport.evict_stale();
        report
    }
}
