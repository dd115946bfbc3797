//! Keylock CLI - exercise and observe per-key locks

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use keylock::{KeyLock, KeyLockConfig, KeyLockError};
use keylock::locking::saturating_millis;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "keylock")]
#[command(author, version, about = "Exercise and observe per-key locks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Registry configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run several workers that take turns holding one key
    Contend {
        /// Key to contend on
        #[arg(short, long, default_value = "resource")]
        key: String,
        /// Number of concurrent workers
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
        /// How long each worker holds the key (ms)
        #[arg(long, default_value_t = 10)]
        hold_ms: u64,
    },

    /// Hold a key, then try to take it again with a bounded wait
    Wait {
        /// Key to wait on
        #[arg(short, long, default_value = "resource")]
        key: String,
        /// How long the first holder keeps the key (ms)
        #[arg(long, default_value_t = 100)]
        hold_ms: u64,
        /// Wait budget of the second caller (ms, 0 = immediate)
        #[arg(long, default_value_t = 50)]
        timeout_ms: u64,
    },

    /// Show that a round trip on one key completes while another is held
    Independent {
        /// How long key `a` stays held (ms)
        #[arg(long, default_value_t = 200)]
        hold_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("keylock=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => KeyLockConfig::load(path)?,
        None => KeyLockConfig::default(),
    };
    debug!(?config, "Loaded registry configuration");

    let keylock = KeyLock::with_config(config);
    let printer = (cli.format == OutputFormat::Json).then(|| spawn_event_printer(&keylock));

    let result = match cli.command {
        Commands::Contend {
            key,
            workers,
            hold_ms,
        } => cmd_contend(&keylock, &key, workers, hold_ms, cli.format).await,

        Commands::Wait {
            key,
            hold_ms,
            timeout_ms,
        } => cmd_wait(&keylock, &key, hold_ms, timeout_ms, cli.format).await,

        Commands::Independent { hold_ms } => cmd_independent(&keylock, hold_ms, cli.format).await,
    };

    // The event stream closes once the registry and every capability are gone
    drop(keylock);
    if let Some(printer) = printer {
        printer.await.context("Event printer task failed")?;
    }

    result
}

/// Print every lock event as one JSON line
fn spawn_event_printer(keylock: &KeyLock) -> JoinHandle<()> {
    let mut events = keylock.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => debug!(error = %e, "Failed to serialize lock event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "Event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn report(format: OutputFormat, text: String, json: serde_json::Value) {
    match format {
        OutputFormat::Text => println!("{}", text),
        OutputFormat::Json => println!("{}", json),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_contend(
    keylock: &KeyLock,
    key: &str,
    workers: usize,
    hold_ms: u64,
    format: OutputFormat,
) -> anyhow::Result<()> {
    if workers == 0 {
        bail!("--workers must be at least 1");
    }

    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(std::sync::Mutex::new(Vec::with_capacity(workers)));
    let start = Instant::now();

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let keylock = keylock.clone();
            let key = key.to_string();
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let unlock = keylock.acquire(key.as_str()).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                if let Ok(mut order) = order.lock() {
                    order.push(worker);
                }
                sleep(Duration::from_millis(hold_ms)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                unlock.unlock();
            })
        })
        .collect();

    for handle in handles {
        handle.await.context("Worker task failed")?;
    }

    let max_holders = max_seen.load(Ordering::SeqCst);
    let order = order
        .lock()
        .map(|order| order.clone())
        .unwrap_or_default();
    let elapsed_ms = saturating_millis(start.elapsed());
    info!(key, workers, max_holders, elapsed_ms, "Contention run finished");

    report(
        format,
        format!(
            "contend: {} workers on '{}', max concurrent holders {}, order {:?}, {}ms",
            workers, key, max_holders, order, elapsed_ms
        ),
        serde_json::json!({
            "command": "contend",
            "key": key,
            "workers": workers,
            "max_holders": max_holders,
            "order": order,
            "elapsed_ms": elapsed_ms,
        }),
    );

    if max_holders != 1 {
        bail!("mutual exclusion violated: {} concurrent holders", max_holders);
    }
    Ok(())
}

async fn cmd_wait(
    keylock: &KeyLock,
    key: &str,
    hold_ms: u64,
    timeout_ms: u64,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let unlock = keylock.acquire(key).await;
    let releaser = tokio::spawn(async move {
        sleep(Duration::from_millis(hold_ms)).await;
        unlock.unlock();
    });

    let start = Instant::now();
    let outcome = keylock
        .acquire_with_timeout(key, Duration::from_millis(timeout_ms))
        .await;
    let waited_ms = saturating_millis(start.elapsed());

    let (status, text) = match outcome {
        Ok(unlock) => {
            unlock.unlock();
            ("acquired", format!("wait: acquired '{}' after {}ms", key, waited_ms))
        }
        Err(KeyLockError::Timeout) => {
            ("timeout", format!("wait: timeout on '{}' after {}ms", key, waited_ms))
        }
    };

    releaser.await.context("Holder task failed")?;

    report(
        format,
        text,
        serde_json::json!({
            "command": "wait",
            "key": key,
            "outcome": status,
            "waited_ms": waited_ms,
        }),
    );
    Ok(())
}

async fn cmd_independent(
    keylock: &KeyLock,
    hold_ms: u64,
    format: OutputFormat,
) -> anyhow::Result<()> {
    if hold_ms == 0 {
        bail!("--hold-ms must be at least 1");
    }

    let held = keylock.acquire("a").await;

    let round_trip = {
        let keylock = keylock.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            keylock.acquire("b").await.unlock();
            start.elapsed()
        })
    };

    let elapsed = tokio::time::timeout(Duration::from_millis(hold_ms), round_trip)
        .await
        .context("round trip on 'b' waited for 'a'")?
        .context("Round trip task failed")?;
    let still_held = held.held_for() < Duration::from_millis(hold_ms);

    sleep(Duration::from_millis(hold_ms).saturating_sub(held.held_for())).await;
    held.unlock();

    let elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
    report(
        format,
        format!(
            "independent: round trip on 'b' took {}us while 'a' was held",
            elapsed_us
        ),
        serde_json::json!({
            "command": "independent",
            "round_trip_us": elapsed_us,
            "a_held": still_held,
        }),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_wait_args() {
        let cli = Cli::try_parse_from([
            "keylock",
            "wait",
            "--key",
            "k",
            "--hold-ms",
            "5",
            "--timeout-ms",
            "0",
        ])
        .unwrap();

        match cli.command {
            Commands::Wait {
                key,
                hold_ms,
                timeout_ms,
            } => {
                assert_eq!(key, "k");
                assert_eq!(hold_ms, 5);
                assert_eq!(timeout_ms, 0);
            }
            _ => panic!("expected wait"),
        }
    }

    #[test]
    fn test_global_format_flag() {
        let cli = Cli::try_parse_from(["keylock", "independent", "--format", "json"]).unwrap();
        assert!(cli.format == OutputFormat::Json);
        assert!(cli.config.is_none());
    }

    #[tokio::test]
    async fn test_contend_reports_single_holder() {
        let keylock = KeyLock::new();
        let result = cmd_contend(&keylock, "k", 3, 1, OutputFormat::Text).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_independent_rejects_zero_hold() {
        let keylock = KeyLock::new();
        let err = cmd_independent(&keylock, 0, OutputFormat::Text)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--hold-ms"));
        assert!(keylock.is_empty());
    }

    #[tokio::test]
    async fn test_contend_rejects_zero_workers() {
        let keylock = KeyLock::new();
        assert!(cmd_contend(&keylock, "k", 0, 1, OutputFormat::Text).await.is_err());
    }
}
