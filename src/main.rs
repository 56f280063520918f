//! sovl - run the SOVL orchestration layer
//!
//! Usage:
//!   sovl --config sovl_config.json --mode train --train-data data.jsonl
//!   sovl --config sovl_config.json --mode generate
//!   sovl --dump-config > sovl_config.json

use anyhow::Context;
use clap::Parser;
use sovl::runner::{self, Mode, RunOptions};
use sovl_core::Device;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "sovl",
    about = "SOVL runtime: wire, train, dream and checkpoint",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Path to the configuration file (JSON, or TOML by extension)
    #[arg(long, default_value = "sovl_config.json")]
    config: PathBuf,

    /// Compute device: cpu or cuda
    #[arg(long, default_value = "cpu")]
    device: Device,

    /// What to run
    #[arg(long, value_enum, default_value_t = Mode::Train)]
    mode: Mode,

    /// Number of training epochs
    #[arg(long, default_value_t = 10)]
    epochs: u32,

    /// Training batch size (defaults to training_config.batch_size)
    #[arg(long)]
    batch_size: Option<u64>,

    /// JSONL file of prompt/response pairs
    #[arg(long)]
    train_data: Option<PathBuf>,

    /// JSONL file used for validation and early stopping
    #[arg(long)]
    valid_data: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Save a checkpoint every N epochs
    #[arg(long, default_value_t = 1)]
    checkpoint_interval: u32,

    /// Run validation every N epochs
    #[arg(long, default_value_t = 1)]
    validate_every: u32,

    /// Checkpoint state file to resume from
    #[arg(long)]
    resume_from_checkpoint: Option<PathBuf>,

    /// Keep at most this many checkpoints
    #[arg(long, default_value_t = 5)]
    max_checkpoints: usize,

    /// Epochs without validation improvement before stopping
    #[arg(long)]
    max_patience: Option<u32>,

    /// Seconds between background memory health checks
    #[arg(long, default_value_t = 1.0)]
    monitor_interval: f64,

    /// Write a daily rolling log file into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    log_json: bool,

    /// Print a complete default configuration and exit
    #[arg(long, default_value_t = false)]
    dump_config: bool,
}

impl Cli {
    fn options(&self) -> RunOptions {
        RunOptions {
            config: self.config.clone(),
            device: self.device,
            mode: self.mode,
            epochs: self.epochs,
            batch_size: self.batch_size,
            train_data: self.train_data.clone(),
            valid_data: self.valid_data.clone(),
            checkpoint_interval: self.checkpoint_interval,
            validate_every: self.validate_every,
            resume_from_checkpoint: self.resume_from_checkpoint.clone(),
            max_checkpoints: self.max_checkpoints,
            max_patience: self.max_patience,
        }
    }
}

fn init_tracing(verbose: bool, json: bool, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let default_filter = if verbose { "sovl=debug,info" } else { "sovl=info,warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "sovl.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .with(file_layer)
        .init();
    Ok(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.dump_config {
        println!(
            "{}",
            serde_json::to_string_pretty(&sovl_core::config::default_document())?
        );
        return Ok(());
    }

    let _guard = init_tracing(cli.verbose, cli.log_json, cli.log_dir.as_deref())?;
    let monitor_every = Duration::try_from_secs_f64(cli.monitor_interval)
        .ok()
        .filter(|d| !d.is_zero())
        .context("--monitor-interval must be a positive number of seconds")?;

    let options = cli.options();
    let runner::Bootstrapped {
        system,
        checkpointer,
        events,
    } = runner::bootstrap(&options)
        .with_context(|| format!("starting from {}", options.config.display()))?;
    let system = Arc::new(system);
    info!(mode = ?options.mode, device = %options.device, "sovl started");

    let cancel = CancellationToken::new();
    let model_size = system
        .context()
        .config()
        .get_or("memory_config.model_size_bytes", 256u64 * 1024 * 1024);
    let monitor = system
        .memory_monitor()
        .clone()
        .spawn_periodic(model_size, monitor_every, cancel.child_token());

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing current epoch");
                cancel.cancel();
            }
        }
    });

    let worker = {
        let system = system.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || runner::run(&system, &checkpointer, &options, &cancel))
    };
    let outcome = worker.await.context("run task panicked")?;

    let checks = monitor.await.context("memory monitor panicked")?;
    info!(checks, events = events.len(), "memory monitor stopped");

    let summary = outcome?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
