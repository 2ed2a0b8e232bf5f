//! Pool registry - one [`MultiplexedPool`] per connection target.
//!
//! The registry:
//! - Creates a pool the first time a target is used
//! - Hands out the same pool for later requests on that target
//! - Shuts every pool down on request

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::{info, instrument};

use crate::backend::LockBackend;
use crate::config::LockPoolConfig;
use crate::error::LockError;
use crate::handle::NamedLock;
use crate::metrics::PoolSnapshot;
use crate::pool::MultiplexedPool;

type Connector<B> = dyn Fn(&str) -> Result<B, LockError> + Send + Sync;

/// Registry of lock pools keyed by connection target.
pub struct PoolRegistry<B: LockBackend> {
    pools: Arc<RwLock<HashMap<String, MultiplexedPool<B>>>>,
    config: LockPoolConfig,
    connect: Arc<Connector<B>>,
}

impl<B: LockBackend> Clone for PoolRegistry<B> {
    fn clone(&self) -> Self {
        Self {
            pools: self.pools.clone(),
            config: self.config.clone(),
            connect: self.connect.clone(),
        }
    }
}

impl<B: LockBackend> fmt::Debug for PoolRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("targets", &self.targets())
            .field("config", &self.config)
            .finish()
    }
}

impl<B: LockBackend> PoolRegistry<B> {
    /// `connect` builds a backend for a target string the first time the
    /// target is requested.
    pub fn new<F>(config: LockPoolConfig, connect: F) -> Result<Self, LockError>
    where
        F: Fn(&str) -> Result<B, LockError> + Send + Sync + 'static,
    {
        config.validate()?;
        info!(
            max_connections = config.max_connections,
            cleanup_interval_seconds = config.cleanup_interval_seconds,
            "lock pool registry initialized"
        );
        Ok(Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
            config,
            connect: Arc::new(connect),
        })
    }

    pub fn config(&self) -> &LockPoolConfig {
        &self.config
    }

    /// The pool for `target`, created on first use.
    #[instrument(level = "debug", skip(self))]
    pub fn pool(&self, target: &str) -> Result<MultiplexedPool<B>, LockError> {
        {
            let pools = self
                .pools
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(pool) = pools.get(target) {
                return Ok(pool.clone());
            }
        }

        let mut pools = self
            .pools
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Another caller may have created it between the two locks.
        if let Some(pool) = pools.get(target) {
            return Ok(pool.clone());
        }
        let backend = (self.connect)(target)?;
        let pool = MultiplexedPool::new(backend, &self.config)?;
        pools.insert(target.to_string(), pool.clone());
        info!(target_db = pool.target(), "created lock pool");
        Ok(pool)
    }

    pub fn lock(&self, target: &str, name: &str) -> Result<NamedLock<B>, LockError> {
        Ok(self.pool(target)?.lock(name))
    }

    pub fn targets(&self) -> Vec<String> {
        let pools = self
            .pools
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut targets: Vec<String> = pools.keys().cloned().collect();
        targets.sort();
        targets
    }

    pub fn snapshot(&self) -> Vec<PoolSnapshot> {
        let pools: Vec<MultiplexedPool<B>> = {
            let pools = self
                .pools
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pools.values().cloned().collect()
        };
        pools.iter().map(MultiplexedPool::snapshot).collect()
    }

    /// Shut down and forget every pool. A later `pool()` call starts fresh.
    pub async fn shutdown(&self) {
        let pools: Vec<MultiplexedPool<B>> = {
            let mut pools = self
                .pools
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pools.drain().map(|(_, pool)| pool).collect()
        };
        for pool in &pools {
            pool.shutdown().await;
        }
        info!(pools = pools.len(), "lock pool registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, MemoryDatabase};

    fn registry(db: Arc<MemoryDatabase>) -> Result<PoolRegistry<MemoryBackend>, LockError> {
        PoolRegistry::new(LockPoolConfig::default(), move |target| {
            Ok(MemoryBackend::new(db.clone(), target))
        })
    }

    #[tokio::test]
    async fn same_target_reuses_pool() -> Result<(), LockError> {
        let registry = registry(MemoryDatabase::new())?;
        let first = registry.pool("db-a")?;
        let second = registry.pool("db-a")?;
        let other = registry.pool("db-b")?;

        assert!(first.same_pool(&second));
        assert!(!first.same_pool(&other));
        assert_eq!(registry.targets(), vec!["db-a".to_string(), "db-b".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn connector_errors_are_surfaced() {
        let registry: PoolRegistry<MemoryBackend> =
            PoolRegistry::new(LockPoolConfig::default(), |target| {
                Err(LockError::Connect(format!("unknown target {target}")))
            })
            .expect("registry");
        assert!(matches!(registry.pool("nowhere"), Err(LockError::Connect(_))));
        assert!(registry.targets().is_empty());
    }

    #[tokio::test]
    async fn shutdown_forgets_pools() -> Result<(), LockError> {
        let db = MemoryDatabase::new();
        let registry = registry(db.clone())?;
        let pool = registry.pool("db-a")?;
        let handle = pool.acquire("job", None).await?;
        assert!(db.is_held("job"));

        registry.shutdown().await;
        assert!(handle.is_released());
        assert!(!db.is_held("job"));
        assert!(registry.targets().is_empty());

        let fresh = registry.pool("db-a")?;
        assert!(!fresh.same_pool(&pool));
        Ok(())
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = LockPoolConfig {
            max_connections: 0,
            ..LockPoolConfig::default()
        };
        let result: Result<PoolRegistry<MemoryBackend>, _> =
            PoolRegistry::new(config, |_| Err(LockError::Internal("unused".into())));
        assert!(matches!(result, Err(LockError::InvalidConfig(_))));
    }
}
