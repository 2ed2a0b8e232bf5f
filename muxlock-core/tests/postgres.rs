//! Runs against a real server only when `MUXLOCK_TEST_POSTGRES` holds a
//! connection string; otherwise every test returns early.

#![cfg(feature = "postgres")]

use std::time::Duration;

use anyhow::{Context, Result};
use muxlock_core::backend::postgres::PgSslMode;
use muxlock_core::{LockPoolConfig, MultiplexedPool, PostgresBackend};

fn connection() -> Option<String> {
    std::env::var("MUXLOCK_TEST_POSTGRES")
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn pool(connection: &str) -> Result<MultiplexedPool<PostgresBackend>> {
    let backend = PostgresBackend::new(connection).with_ssl_mode(PgSslMode::parse(
        &std::env::var("PGSSLMODE").unwrap_or_default(),
    ));
    Ok(MultiplexedPool::new(
        backend,
        &LockPoolConfig {
            max_connections: 4,
            connection_acquire_timeout_ms: 5_000,
            ..LockPoolConfig::default()
        },
    )?)
}

#[tokio::test]
async fn advisory_locks_multiplex_and_exclude() -> Result<()> {
    let Some(conn) = connection() else {
        return Ok(());
    };
    let ours = pool(&conn)?;
    let theirs = pool(&conn)?;

    let a = ours.acquire("muxlock-test/a", Some(Duration::from_secs(5))).await?;
    let b = ours.acquire("muxlock-test/b", Some(Duration::from_secs(5))).await?;
    assert_eq!(ours.snapshot().open_slots, 1);

    assert!(theirs.try_acquire("muxlock-test/a").await?.is_none());
    let err = theirs
        .acquire("muxlock-test/b", Some(Duration::from_millis(200)))
        .await
        .err()
        .context("second session should time out")?;
    assert!(err.is_timeout(), "unexpected error: {err}");

    a.release().await?;
    let taken = theirs
        .try_acquire("muxlock-test/a")
        .await?
        .context("released lock should be free")?;

    taken.release().await?;
    b.release().await?;
    ours.shutdown().await;
    theirs.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_ends_server_side_locks() -> Result<()> {
    let Some(conn) = connection() else {
        return Ok(());
    };
    let ours = pool(&conn)?;
    let theirs = pool(&conn)?;

    let _held = ours.acquire("muxlock-test/shutdown", None).await?;
    ours.shutdown().await;

    let handle = theirs
        .acquire("muxlock-test/shutdown", Some(Duration::from_secs(5)))
        .await?;
    handle.release().await?;
    theirs.shutdown().await;
    Ok(())
}
