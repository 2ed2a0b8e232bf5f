use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running counters of one pool.
#[derive(Default)]
pub(crate) struct PoolMetrics {
    pub(crate) optimistic: AtomicU64,
    pub(crate) dedicated: AtomicU64,
    pub(crate) contended: AtomicU64,
    pub(crate) fallbacks: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) released: AtomicU64,
    pub(crate) abandoned: AtomicU64,
    pub(crate) leases_expired: AtomicU64,
    pub(crate) slots_closed: AtomicU64,
}

impl PoolMetrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub(crate) fn totals(&self) -> AcquisitionTotals {
        AcquisitionTotals {
            optimistic: Self::get(&self.optimistic),
            dedicated: Self::get(&self.dedicated),
            contended: Self::get(&self.contended),
            optimistic_fallbacks: Self::get(&self.fallbacks),
            failed: Self::get(&self.failed),
            released: Self::get(&self.released),
            abandoned_reclaimed: Self::get(&self.abandoned),
            leases_expired: Self::get(&self.leases_expired),
            slots_closed: Self::get(&self.slots_closed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionTotals {
    /// Locks taken on an already-open shared connection.
    pub optimistic: u64,
    /// Locks that needed a connection of their own.
    pub dedicated: u64,
    /// Attempts that found the key held elsewhere.
    pub contended: u64,
    /// Optimistic attempts that fell through to a dedicated connection.
    pub optimistic_fallbacks: u64,
    pub failed: u64,
    pub released: u64,
    pub abandoned_reclaimed: u64,
    pub leases_expired: u64,
    pub slots_closed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub target: String,
    pub open_slots: usize,
    pub poisoned_slots: usize,
    pub held_locks: usize,
    pub transport_connections: usize,
    pub idle_connections: usize,
    pub max_connections: usize,
    pub cleanup_interval_ms: u64,
    pub totals: AcquisitionTotals,
}
