//! Caller-facing lock ownership.
//!
//! A [`LockHandle`] shares a small token with the pool: the pool only keeps a
//! `Weak` reference to it, so once every handle is gone the sweeper sees the
//! lock as abandoned. The token also carries the released flag, which makes
//! release idempotent and settles races between an owner releasing and the
//! sweeper reclaiming an expired lease: whoever flips the flag first releases.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::backend::LockBackend;
use crate::error::LockError;
use crate::key::NamedLockKey;
use crate::pool::{MultiplexedPool, PoolInner};
use crate::slot::SharedSlot;

pub(crate) struct HandleToken {
    id: u64,
    released: AtomicBool,
    renewed: Mutex<Instant>,
}

impl HandleToken {
    pub(crate) fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            released: AtomicBool::new(false),
            renewed: Mutex::new(Instant::now()),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Claim the right to release; false if someone already did.
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn renew(&self) {
        let mut renewed = self
            .renewed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *renewed = Instant::now();
    }

    pub(crate) fn lease_expired(&self, lease: Duration) -> bool {
        let renewed = self
            .renewed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        renewed.elapsed() > lease
    }
}

/// Ownership of one held named lock.
///
/// Release it with [`LockHandle::release`]. Dropping it without releasing is
/// allowed: the lock is then released by the pool's next cleanup pass.
pub struct LockHandle<B: LockBackend> {
    token: Arc<HandleToken>,
    key: NamedLockKey,
    slot: Arc<SharedSlot<B>>,
    pool: Arc<PoolInner<B>>,
}

impl<B: LockBackend> LockHandle<B> {
    pub(crate) fn new(
        token: Arc<HandleToken>,
        key: NamedLockKey,
        slot: Arc<SharedSlot<B>>,
        pool: Arc<PoolInner<B>>,
    ) -> Self {
        Self {
            token,
            key,
            slot,
            pool,
        }
    }

    pub fn name(&self) -> &str {
        self.key.name()
    }

    pub fn key(&self) -> &NamedLockKey {
        &self.key
    }

    /// True once released by the owner, by lease expiry, or by pool shutdown.
    pub fn is_released(&self) -> bool {
        self.token.is_released()
    }

    /// Renew the lease. Only matters when the pool is configured with
    /// `lease_seconds`.
    pub fn keep_alive(&self) {
        self.token.renew();
    }

    /// Release the lock. Calling it again is a no-op.
    pub async fn release(&self) -> Result<(), LockError> {
        if !self.token.mark_released() {
            return Ok(());
        }
        self.pool
            .release_entry(self.key.clone(), self.token.id(), self.slot.clone())
            .await
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolInner<B>>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }
}

impl<B: LockBackend> fmt::Debug for LockHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("name", &self.key.name())
            .field("storage_key", &self.key.storage_key())
            .field("slot", &self.slot.id())
            .field("released", &self.is_released())
            .finish()
    }
}

impl<B: LockBackend> Drop for LockHandle<B> {
    fn drop(&mut self) {
        if !self.token.is_released() {
            debug!(
                key = %self.key,
                slot = self.slot.id(),
                "lock handle dropped without release; next cleanup pass reclaims it"
            );
        }
    }
}

/// A named lock bound to a pool, reusable for repeated acquisitions.
pub struct NamedLock<B: LockBackend> {
    pool: MultiplexedPool<B>,
    key: NamedLockKey,
}

impl<B: LockBackend> Clone for NamedLock<B> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            key: self.key.clone(),
        }
    }
}

impl<B: LockBackend> NamedLock<B> {
    pub(crate) fn new(pool: MultiplexedPool<B>, key: NamedLockKey) -> Self {
        Self { pool, key }
    }

    pub fn name(&self) -> &str {
        self.key.name()
    }

    pub fn key(&self) -> &NamedLockKey {
        &self.key
    }

    /// Wait up to `timeout` (forever when `None`) for the lock.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<LockHandle<B>, LockError> {
        self.pool.acquire_key(self.key.clone(), timeout).await
    }

    pub async fn try_acquire(&self) -> Result<Option<LockHandle<B>>, LockError> {
        self.pool.try_acquire_key(self.key.clone()).await
    }
}
