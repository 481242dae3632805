// src/lib.rs

pub mod cli;
pub mod clock;
pub mod config;
pub mod engine;
pub mod errors;
pub mod front;
pub mod handler;
pub mod ledger;
pub mod logging;
pub mod paths;
pub mod recovery;
pub mod retention;
pub mod snapshot;
pub mod transport;
pub mod trigger;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tracing::{debug, error, info};

use crate::cli::CliArgs;
use crate::clock::{Clock, SystemClock};
use crate::config::ConfigFile;
use crate::config::loader::load_and_validate;
use crate::engine::{Worker, WorkerContext};
use crate::handler::HandlerRegistry;
use crate::ledger::MemoryLedger;
use crate::snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};

/// Capacity of the worker's event channel.
const WORKER_CHANNEL_CAPACITY: usize = 256;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - ledger and snapshot store
/// - startup recovery
/// - the worker and its triggers
/// - the stdin message reader
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let ledger = match cfg.storage.ledger_path {
        Some(ref path) => Arc::new(MemoryLedger::open(path)?),
        None => Arc::new(MemoryLedger::new()),
    };
    let snapshots: Arc<dyn SnapshotStore> = match cfg.storage.snapshot_dir {
        Some(ref dir) => Arc::new(FileSnapshotStore::new(dir)),
        None => Arc::new(MemorySnapshotStore::new()),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Rows left mid-flight by a previous process must be settled before
    // the worker accepts anything.
    let report = recovery::recover(ledger.as_ref(), clock.as_ref()).await?;
    info!(
        runs_failed = report.runs_failed,
        tasks_reset = report.tasks_reset,
        "startup recovery done"
    );

    let ctx = WorkerContext {
        ledger: ledger.clone(),
        catalog: ledger.clone(),
        snapshots,
        handlers: HandlerRegistry::with_python(&cfg.python, &cfg.search),
        clock: clock.clone(),
        content_dir: cfg.tasks.content_dir.clone(),
    };
    let (worker, handle) = Worker::new(ctx, WORKER_CHANNEL_CAPACITY);

    let _time_trigger = trigger::spawn_time_trigger(
        ledger.clone(),
        clock.clone(),
        handle.clone(),
        cfg.tasks.content_dir.clone(),
        cfg.check_interval(),
    );

    let _retention = cfg
        .run_log_retention()
        .map(|window| retention::spawn_retention(ledger.clone(), clock.clone(), window));

    if !args.no_stdin {
        let handle = handle.clone();
        tokio::spawn(async move {
            let reader = BufReader::new(tokio::io::stdin());
            match transport::read_messages(reader, handle).await {
                Ok(count) => debug!(count, "stdin closed"),
                Err(err) => error!(error = %err, "reading front messages failed"),
            }
        });
    }

    // Ctrl-C → graceful shutdown.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = handle.shutdown().await;
        });
    }

    worker.run().await?;
    Ok(())
}

fn print_dry_run(cfg: &ConfigFile) {
    println!("jobvisor dry-run");
    println!("  tasks.check_interval = {}s", cfg.tasks.check_interval);
    println!("  tasks.content_dir = {}", cfg.tasks.content_dir.display());
    match cfg.run_log_retention() {
        Some(retention) => println!("  jobs.run_log_retention = {}s", retention.as_secs()),
        None => println!("  jobs.run_log_retention = disabled"),
    }
    match cfg.storage.ledger_path {
        Some(ref path) => println!("  storage.ledger_path = {}", path.display()),
        None => println!("  storage.ledger_path = (in memory)"),
    }
    match cfg.storage.snapshot_dir {
        Some(ref dir) => println!("  storage.snapshot_dir = {}", dir.display()),
        None => println!("  storage.snapshot_dir = (in memory)"),
    }
    println!("  python.venv_cmd = {}", cfg.python.venv_cmd);
    println!("  python.base_packages = {:?}", cfg.python.base_packages);
    println!("  python.numpy_packages = {:?}", cfg.python.numpy_packages);
    println!("  search = {}:{}", cfg.search.host, cfg.search.port);

    debug!("dry-run complete (no execution)");
}
