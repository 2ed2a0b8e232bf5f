//! muxlock - take, hold, or run a command under a named database lock

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use muxlock_core::backend::postgres::connection_string_from_env;
use muxlock_core::{LockHandle, LockPoolConfig, NamedLock, PoolRegistry, PostgresBackend};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code when the lock is held elsewhere (EX_TEMPFAIL).
const EXIT_LOCK_UNAVAILABLE: u8 = 75;

/// muxlock - named PostgreSQL advisory locks from the shell
#[derive(Parser, Debug)]
#[command(name = "muxlock")]
#[command(about = "Take, hold, or run a command under a named database lock", long_about = None)]
struct Args {
    /// PostgreSQL connection string (default: MUXLOCK_POSTGRES_CONNECTION or PG* variables)
    #[arg(short, long)]
    connection: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take the lock if it is free right now, then release it
    Try { name: String },
    /// Hold the lock until the duration elapses or Ctrl-C
    Hold {
        name: String,
        /// How long to wait for the lock (default: forever)
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// How long to hold it (default: until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Run a command while holding the lock; exits with the command's code
    Run {
        name: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_format, args.debug);

    let config = LockPoolConfig::load().context("failed to load configuration")?;
    let connection = args.connection.unwrap_or_else(connection_string_from_env);
    let registry = PoolRegistry::new(config, |target| Ok(PostgresBackend::new(target)))
        .context("failed to initialize lock pool registry")?;

    let result = match args.command {
        Command::Try { name } => {
            let lock = registry.lock(&connection, &name)?;
            try_once(&lock).await
        }
        Command::Hold {
            name,
            timeout_ms,
            seconds,
        } => {
            let lock = registry.lock(&connection, &name)?;
            hold(
                &lock,
                timeout_ms.map(Duration::from_millis),
                seconds.map(Duration::from_secs),
            )
            .await
        }
        Command::Run {
            name,
            timeout_ms,
            command,
        } => {
            let lock = registry.lock(&connection, &name)?;
            run(&lock, timeout_ms.map(Duration::from_millis), &command).await
        }
    };

    registry.shutdown().await;
    result
}

fn init_tracing(format: LogFormat, debug: bool) {
    let log_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn try_once(lock: &NamedLock<PostgresBackend>) -> Result<ExitCode> {
    match lock.try_acquire().await? {
        Some(handle) => {
            println!("acquired {}", lock.name());
            handle.release().await.context("failed to release lock")?;
            Ok(ExitCode::SUCCESS)
        }
        None => {
            println!("busy {}", lock.name());
            Ok(ExitCode::from(EXIT_LOCK_UNAVAILABLE))
        }
    }
}

/// `None` when the wait timed out.
async fn acquire(
    lock: &NamedLock<PostgresBackend>,
    timeout: Option<Duration>,
) -> Result<Option<LockHandle<PostgresBackend>>> {
    match lock.acquire(timeout).await {
        Ok(handle) => {
            info!(name = lock.name(), "lock acquired");
            Ok(Some(handle))
        }
        Err(err) if err.is_timeout() => {
            eprintln!("{err}");
            Ok(None)
        }
        Err(err) => Err(err).context("failed to acquire lock"),
    }
}

async fn hold(
    lock: &NamedLock<PostgresBackend>,
    timeout: Option<Duration>,
    duration: Option<Duration>,
) -> Result<ExitCode> {
    let Some(handle) = acquire(lock, timeout).await? else {
        return Ok(ExitCode::from(EXIT_LOCK_UNAVAILABLE));
    };
    println!("holding {}", lock.name());

    let elapsed = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(elapsed);
    let mut keep_alive = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = &mut elapsed => break,
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "failed to listen for Ctrl-C");
                }
                info!("received SIGINT, releasing lock");
                break;
            }
            _ = keep_alive.tick() => handle.keep_alive(),
        }
    }

    handle.release().await.context("failed to release lock")?;
    Ok(ExitCode::SUCCESS)
}

async fn run(
    lock: &NamedLock<PostgresBackend>,
    timeout: Option<Duration>,
    command: &[String],
) -> Result<ExitCode> {
    let Some((program, program_args)) = command.split_first() else {
        anyhow::bail!("no command given");
    };
    let Some(handle) = acquire(lock, timeout).await? else {
        return Ok(ExitCode::from(EXIT_LOCK_UNAVAILABLE));
    };

    // Release even when the command could not be started.
    let status = run_child(&handle, program, program_args).await;
    handle.release().await.context("failed to release lock")?;
    let status = status?;
    info!(name = lock.name(), status = %status, "command finished");
    let code = status.code().unwrap_or(1);
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

async fn run_child(
    handle: &LockHandle<PostgresBackend>,
    program: &str,
    args: &[String],
) -> Result<std::process::ExitStatus> {
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .spawn()
        .with_context(|| format!("failed to start `{program}`"))?;
    let mut keep_alive = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            status = child.wait() => return status.context("failed to wait for command"),
            _ = keep_alive.tick() => handle.keep_alive(),
        }
    }
}
