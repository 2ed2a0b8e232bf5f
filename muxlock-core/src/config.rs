use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LockError;
use crate::transport::TransportConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockPoolConfig {
    /// Seconds between sweeper passes. Adjustable at runtime per pool.
    pub cleanup_interval_seconds: u64,
    /// How long an empty shared connection is kept before it is closed.
    pub slot_idle_grace_seconds: u64,
    /// When set, a held lock whose owner has not called `keep_alive` within
    /// this many seconds is reclaimed even though its handle still exists.
    pub lease_seconds: Option<u64>,
    /// Upper bound on physical connections per pool.
    pub max_connections: usize,
    /// How long a dedicated acquisition waits for a free connection.
    pub connection_acquire_timeout_ms: u64,
    /// Idle connections older than this are closed; 0 keeps them forever.
    pub connection_idle_ttl_ms: u64,
}

impl Default for LockPoolConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            cleanup_interval_seconds: 20,
            slot_idle_grace_seconds: 20,
            lease_seconds: None,
            max_connections: cpus.saturating_mul(2).clamp(4, 16),
            connection_acquire_timeout_ms: 30_000,
            connection_idle_ttl_ms: 300_000,
        }
    }
}

impl LockPoolConfig {
    /// Defaults overridden by `MUXLOCK_*` environment variables.
    pub fn load() -> Result<Self, LockError> {
        let defaults_json = serde_json::to_string(&Self::default())
            .map_err(|e| LockError::InvalidConfig(format!("failed to serialize defaults: {e}")))?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(config::Environment::with_prefix("MUXLOCK"))
            .build()
            .map_err(|e| LockError::InvalidConfig(format!("failed to load configuration: {e}")))?;
        let cfg: LockPoolConfig = settings.try_deserialize().map_err(|e| {
            LockError::InvalidConfig(format!("failed to deserialize configuration: {e}"))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), LockError> {
        if self.cleanup_interval_seconds == 0 {
            return Err(LockError::InvalidConfig(
                "cleanup_interval_seconds must be greater than 0".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(LockError::InvalidConfig(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.lease_seconds == Some(0) {
            return Err(LockError::InvalidConfig(
                "lease_seconds must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn slot_idle_grace(&self) -> Duration {
        Duration::from_secs(self.slot_idle_grace_seconds)
    }

    pub fn lease(&self) -> Option<Duration> {
        self.lease_seconds.map(Duration::from_secs)
    }

    pub(crate) fn transport(&self) -> TransportConfig {
        TransportConfig {
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_millis(self.connection_acquire_timeout_ms),
            idle_ttl: Duration::from_millis(self.connection_idle_ttl_ms),
        }
    }
}
