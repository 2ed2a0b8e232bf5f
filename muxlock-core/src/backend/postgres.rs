//! PostgreSQL advisory locks.
//!
//! Session-level advisory locks are owned by the connection that took them and
//! disappear when it closes, which is the contract the pool relies on. Lock
//! keys are hashed into the `bigint` keyspace of `pg_advisory_lock`.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use siphasher::sip::SipHasher13;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use super::{AcquireOutcome, LockBackend, WaitMode};
use crate::error::LockError;
use crate::key::{KeyRules, NamedLockKey};

/// Overrides the `PG*` variables when set.
pub const CONNECTION_ENV: &str = "MUXLOCK_POSTGRES_CONNECTION";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PgSslMode {
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl PgSslMode {
    pub fn from_env() -> Self {
        let value = std::env::var("PGSSLMODE").unwrap_or_else(|_| "disable".to_string());
        Self::parse(value.as_str())
    }

    /// Unknown values fall back to `Disable`.
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "prefer" => Self::Prefer,
            "require" => Self::Require,
            "verify-ca" => Self::VerifyCa,
            "verify-full" => Self::VerifyFull,
            _ => Self::Disable,
        }
    }
}

enum TlsConfig {
    None,
    Prefer(MakeTlsConnector),
    Enforced(MakeTlsConnector),
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsConfig::None => write!(f, "TlsConfig::None"),
            TlsConfig::Prefer(_) => write!(f, "TlsConfig::Prefer(..)"),
            TlsConfig::Enforced(_) => write!(f, "TlsConfig::Enforced(..)"),
        }
    }
}

fn build_tls_connector(mode: PgSslMode) -> Result<MakeTlsConnector, LockError> {
    let builder_result = match mode {
        PgSslMode::Prefer | PgSslMode::Require => TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build(),
        PgSslMode::VerifyCa => TlsConnector::builder()
            .danger_accept_invalid_hostnames(true)
            .build(),
        PgSslMode::VerifyFull => TlsConnector::builder().build(),
        PgSslMode::Disable => {
            return Err(LockError::Connect(
                "PGSSLMODE=disable should not build a TLS connector".to_string(),
            ))
        }
    };
    let connector = builder_result.map_err(|e| {
        LockError::Connect(format!("failed to build TLS connector for {mode:?}: {e}"))
    })?;
    Ok(MakeTlsConnector::new(connector))
}

fn build_tls_config(mode: PgSslMode) -> Result<TlsConfig, LockError> {
    match mode {
        PgSslMode::Disable => Ok(TlsConfig::None),
        PgSslMode::Prefer => Ok(TlsConfig::Prefer(build_tls_connector(mode)?)),
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => {
            Ok(TlsConfig::Enforced(build_tls_connector(mode)?))
        }
    }
}

async fn connect_with_tls(
    connection_string: &str,
    connector: MakeTlsConnector,
) -> Result<Client, LockError> {
    let (client, connection) = tokio_postgres::connect(connection_string, connector)
        .await
        .map_err(|e| LockError::Connect(e.to_string()))?;
    spawn_connection(connection);
    Ok(client)
}

async fn connect_without_tls(connection_string: &str) -> Result<Client, LockError> {
    let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
        .await
        .map_err(|e| LockError::Connect(e.to_string()))?;
    spawn_connection(connection);
    Ok(client)
}

fn spawn_connection<T>(connection: T)
where
    T: std::future::Future<Output = std::result::Result<(), tokio_postgres::Error>>
        + Send
        + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "PostgreSQL connection error");
        }
    });
}

/// Map a storage key into the advisory lock keyspace.
pub fn advisory_key(storage_key: &str) -> i64 {
    let mut hasher = SipHasher13::new_with_key(&[0u8; 16]);
    storage_key.hash(&mut hasher);
    hasher.finish() as i64
}

/// Connection string with any password replaced by `***`.
fn redact_password(connection_string: &str) -> String {
    if let Some((scheme, rest)) = connection_string.split_once("://") {
        if let Some((userinfo, host)) = rest.split_once('@') {
            if let Some((user, _)) = userinfo.split_once(':') {
                return format!("{scheme}://{user}:***@{host}");
            }
        }
        return connection_string.to_string();
    }
    connection_string
        .split_whitespace()
        .map(|part| {
            if part.starts_with("password=") {
                "password=***"
            } else {
                part
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// One open PostgreSQL session.
pub struct PgConnection {
    client: Client,
}

impl PgConnection {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[derive(Clone)]
pub struct PostgresBackend {
    connection_string: String,
    display_target: String,
    ssl_mode: PgSslMode,
    rules: KeyRules,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("target", &self.display_target)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

impl PostgresBackend {
    /// Accepts both key/value and URL connection strings. The SSL mode comes
    /// from `PGSSLMODE`.
    pub fn new(connection_string: impl Into<String>) -> Self {
        let connection_string = connection_string.into();
        Self {
            display_target: redact_password(&connection_string),
            connection_string,
            ssl_mode: PgSslMode::from_env(),
            rules: KeyRules::default(),
        }
    }

    pub fn with_ssl_mode(mut self, ssl_mode: PgSslMode) -> Self {
        self.ssl_mode = ssl_mode;
        self
    }

    /// `MUXLOCK_POSTGRES_CONNECTION`, or a connection string assembled from
    /// the standard `PG*` variables.
    pub fn from_env() -> Self {
        Self::new(connection_string_from_env())
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn ssl_mode(&self) -> PgSslMode {
        self.ssl_mode
    }

    async fn lock_with_timeout(
        &self,
        client: &Client,
        lock_key: i64,
        timeout: Duration,
    ) -> Result<AcquireOutcome, LockError> {
        client
            .batch_execute(&format!("SET lock_timeout = {}", timeout.as_millis()))
            .await?;
        let result = client
            .query_one("SELECT pg_advisory_lock($1)", &[&lock_key])
            .await;
        let outcome = match result {
            Ok(_) => AcquireOutcome::Granted,
            Err(err) if err.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) => {
                AcquireOutcome::TimedOut
            }
            Err(err) => return Err(err.into()),
        };
        client.batch_execute("RESET lock_timeout").await?;
        Ok(outcome)
    }
}

pub fn connection_string_from_env() -> String {
    if let Ok(conn) = std::env::var(CONNECTION_ENV) {
        if !conn.trim().is_empty() {
            return conn;
        }
    }
    let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
    let user = std::env::var("PGUSER").unwrap_or_else(|_| "postgres".to_string());
    let dbname = std::env::var("PGDATABASE").unwrap_or_else(|_| "postgres".to_string());
    let password = std::env::var("PGPASSWORD").ok();

    let mut config = format!("host={host} port={port} user={user} dbname={dbname}");
    if let Some(pwd) = password {
        config.push_str(&format!(" password={pwd}"));
    }
    config
}

impl LockBackend for PostgresBackend {
    type Connection = PgConnection;

    fn target(&self) -> &str {
        &self.display_target
    }

    fn key_rules(&self) -> KeyRules {
        self.rules
    }

    async fn open(&self) -> Result<PgConnection, LockError> {
        let client = match build_tls_config(self.ssl_mode)? {
            TlsConfig::None => {
                debug!(target_db = %self.display_target, "connecting to PostgreSQL without TLS");
                connect_without_tls(&self.connection_string).await?
            }
            TlsConfig::Prefer(connector) => {
                match connect_with_tls(&self.connection_string, connector).await {
                    Ok(client) => client,
                    Err(err) => {
                        warn!(
                            error = %err,
                            "TLS connection failed in PGSSLMODE=prefer, retrying without TLS"
                        );
                        connect_without_tls(&self.connection_string).await?
                    }
                }
            }
            TlsConfig::Enforced(connector) => {
                debug!(
                    target_db = %self.display_target,
                    "connecting to PostgreSQL with TLS mode {:?}",
                    self.ssl_mode
                );
                connect_with_tls(&self.connection_string, connector).await?
            }
        };
        Ok(PgConnection { client })
    }

    async fn acquire(
        &self,
        conn: &mut PgConnection,
        key: &NamedLockKey,
        wait: WaitMode,
    ) -> Result<AcquireOutcome, LockError> {
        let lock_key = advisory_key(key.storage_key());
        debug!(
            lock_key = lock_key,
            key = %key,
            wait = ?wait,
            "attempting to acquire PostgreSQL advisory lock"
        );
        let outcome = match wait {
            // lock_timeout = 0 disables the timeout, so sub-millisecond waits
            // must not take the blocking path.
            WaitMode::BlockingWithTimeout(timeout) if timeout >= Duration::from_millis(1) => {
                self.lock_with_timeout(&conn.client, lock_key, timeout)
                    .await?
            }
            WaitMode::NonBlocking | WaitMode::BlockingWithTimeout(_) => {
                let row = conn
                    .client
                    .query_one("SELECT pg_try_advisory_lock($1)", &[&lock_key])
                    .await?;
                if row.get::<_, bool>(0) {
                    AcquireOutcome::Granted
                } else {
                    AcquireOutcome::TimedOut
                }
            }
            WaitMode::Blocking => {
                conn.client
                    .query_one("SELECT pg_advisory_lock($1)", &[&lock_key])
                    .await?;
                AcquireOutcome::Granted
            }
        };
        debug!(
            lock_key = lock_key,
            key = %key,
            outcome = ?outcome,
            "PostgreSQL advisory lock attempt finished"
        );
        Ok(outcome)
    }

    async fn release(&self, conn: &mut PgConnection, key: &NamedLockKey) -> Result<(), LockError> {
        let lock_key = advisory_key(key.storage_key());
        let row = conn
            .client
            .query_one("SELECT pg_advisory_unlock($1)", &[&lock_key])
            .await?;
        if !row.get::<_, bool>(0) {
            debug!(
                lock_key = lock_key,
                key = %key,
                "advisory lock was not held by this session"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssl_mode_parser_handles_supported_and_unknown_values() {
        assert_eq!(PgSslMode::parse("disable"), PgSslMode::Disable);
        assert_eq!(PgSslMode::parse("prefer"), PgSslMode::Prefer);
        assert_eq!(PgSslMode::parse("REQUIRE"), PgSslMode::Require);
        assert_eq!(PgSslMode::parse("verify-ca"), PgSslMode::VerifyCa);
        assert_eq!(PgSslMode::parse("verify-full"), PgSslMode::VerifyFull);
        assert_eq!(PgSslMode::parse("unknown-value"), PgSslMode::Disable);
    }

    #[test]
    fn tls_config_builder_maps_modes_to_expected_variants() -> Result<(), LockError> {
        assert!(matches!(build_tls_config(PgSslMode::Disable)?, TlsConfig::None));
        assert!(matches!(build_tls_config(PgSslMode::Prefer)?, TlsConfig::Prefer(_)));
        assert!(matches!(build_tls_config(PgSslMode::Require)?, TlsConfig::Enforced(_)));
        assert!(matches!(build_tls_config(PgSslMode::VerifyCa)?, TlsConfig::Enforced(_)));
        assert!(matches!(
            build_tls_config(PgSslMode::VerifyFull)?,
            TlsConfig::Enforced(_)
        ));
        assert!(build_tls_connector(PgSslMode::Disable).is_err());
        Ok(())
    }

    #[test]
    fn tls_config_debug_representation_is_redacted() -> Result<(), LockError> {
        assert_eq!(format!("{:?}", TlsConfig::None), "TlsConfig::None");
        assert_eq!(
            format!("{:?}", build_tls_config(PgSslMode::Prefer)?),
            "TlsConfig::Prefer(..)"
        );
        Ok(())
    }

    #[test]
    fn advisory_keys_are_deterministic() {
        assert_eq!(advisory_key("jobs/nightly"), advisory_key("jobs/nightly"));
        assert_ne!(advisory_key("jobs/nightly"), advisory_key("jobs/hourly"));
    }

    #[test]
    fn passwords_are_redacted_from_target() {
        let kv = PostgresBackend::new("host=db user=app password=secret dbname=locks")
            .with_ssl_mode(PgSslMode::Disable);
        assert_eq!(kv.target(), "host=db user=app password=*** dbname=locks");
        assert!(!format!("{kv:?}").contains("secret"));

        let url = PostgresBackend::new("postgres://app:secret@db:5432/locks");
        assert_eq!(url.target(), "postgres://app:***@db:5432/locks");
        assert_eq!(url.connection_string(), "postgres://app:secret@db:5432/locks");

        let no_password = PostgresBackend::new("postgres://app@db/locks");
        assert_eq!(no_password.target(), "postgres://app@db/locks");
    }

    #[test]
    fn connection_string_from_env_has_required_parts() {
        if std::env::var(CONNECTION_ENV).is_ok() {
            return;
        }
        let conn = connection_string_from_env();
        assert!(conn.contains("host="));
        assert!(conn.contains("port="));
        assert!(conn.contains("user="));
        assert!(conn.contains("dbname="));
    }
}
