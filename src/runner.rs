//! Run a SOVL system in one mode, checkpointing as it goes.

use crate::checkpoint::Checkpointer;
use crate::offline;
use crate::system::SovlSystem;
use crate::wiring::SystemBuilder;
use clap::ValueEnum;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sovl_core::{ConfigStore, Device, Error, EventLog, EventSink, Result, SubscriptionId, SystemContext};
use sovl_curiosity::TrainingRequest;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Generate,
    Dream,
}

#[derive(Clone, Debug)]
pub struct RunOptions {
    pub config: PathBuf,
    pub device: Device,
    pub mode: Mode,
    pub epochs: u32,
    pub batch_size: Option<u64>,
    pub train_data: Option<PathBuf>,
    pub valid_data: Option<PathBuf>,
    /// Save a checkpoint every N epochs.
    pub checkpoint_interval: u32,
    /// Validate every N epochs.
    pub validate_every: u32,
    pub resume_from_checkpoint: Option<PathBuf>,
    pub max_checkpoints: usize,
    /// Overrides `training_config.max_patience`.
    pub max_patience: Option<u32>,
}

impl RunOptions {
    pub fn new(config: impl Into<PathBuf>, mode: Mode) -> Self {
        Self {
            config: config.into(),
            device: Device::Cpu,
            mode,
            epochs: 1,
            batch_size: None,
            train_data: None,
            valid_data: None,
            checkpoint_interval: 1,
            validate_every: 1,
            resume_from_checkpoint: None,
            max_checkpoints: 5,
            max_patience: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub epochs_run: u32,
    pub best_valid_loss: Option<f64>,
    pub stopped_early: bool,
    pub cancelled: bool,
    pub question: Option<String>,
    pub dreamed: bool,
    pub checkpoints: Vec<PathBuf>,
}

/// Tracks validation loss across epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    best: Option<f64>,
    patience: u32,
    max_patience: u32,
}

impl EarlyStopping {
    pub fn new(max_patience: u32) -> Self {
        Self {
            best: None,
            patience: 0,
            max_patience,
        }
    }

    /// Record one epoch's loss. Returns true once training should stop.
    pub fn observe(&mut self, loss: f64) -> bool {
        match self.best {
            Some(best) if loss >= best => self.patience += 1,
            _ => {
                self.best = Some(loss);
                self.patience = 0;
            }
        }
        self.patience >= self.max_patience
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn patience(&self) -> u32 {
        self.patience
    }

    pub fn set_max_patience(&mut self, max_patience: u32) {
        self.max_patience = max_patience;
    }
}

pub const MAX_PATIENCE_KEY: &str = "training_config.max_patience";
pub const CHECKPOINT_INTERVAL_KEY: &str = "training_config.checkpoint_interval";

#[derive(Debug)]
struct SettingValues {
    max_patience: AtomicU32,
    checkpoint_interval: AtomicU32,
}

/// Early-stopping patience and checkpoint cadence for a training run.
///
/// Starts from the run options and follows later config writes to
/// `training_config.max_patience` and `training_config.checkpoint_interval`,
/// including recovery patches and refreshes. Unsubscribes on drop.
pub struct RunSettings {
    config: Arc<ConfigStore>,
    subscription: SubscriptionId,
    values: Arc<SettingValues>,
}

impl RunSettings {
    pub fn watch(context: &SystemContext, options: &RunOptions) -> Self {
        let config = context.config().clone();
        let values = Arc::new(SettingValues {
            max_patience: AtomicU32::new(
                options
                    .max_patience
                    .unwrap_or_else(|| config.get_or(MAX_PATIENCE_KEY, 3)),
            ),
            checkpoint_interval: AtomicU32::new(options.checkpoint_interval.max(1)),
        });

        let weak = Arc::downgrade(&config);
        let events = context.events().clone();
        let shared = values.clone();
        let subscription = config.subscribe(move |change| {
            let Some(store) = weak.upgrade() else {
                return;
            };
            let touched = |key: &str| {
                change.keys.is_empty()
                    || change
                        .keys
                        .iter()
                        .any(|k| k.as_str() == key || key.starts_with(&format!("{k}.")))
            };
            let mut updated = Map::new();
            for (key, name, slot, floor) in [
                (MAX_PATIENCE_KEY, "max_patience", &shared.max_patience, 0),
                (CHECKPOINT_INTERVAL_KEY, "checkpoint_interval", &shared.checkpoint_interval, 1),
            ] {
                if !touched(key) {
                    continue;
                }
                let current = slot.load(Ordering::SeqCst);
                let fresh = store.get_or(key, current).max(floor);
                if slot.swap(fresh, Ordering::SeqCst) != fresh {
                    updated.insert(name.to_string(), json!(fresh));
                }
            }
            if !updated.is_empty() {
                events.info(
                    "run_settings_updated",
                    "Runner settings refreshed from configuration",
                    Value::Object(updated),
                );
            }
        });

        Self {
            config,
            subscription,
            values,
        }
    }

    pub fn max_patience(&self) -> u32 {
        self.values.max_patience.load(Ordering::SeqCst)
    }

    /// Epochs between checkpoints, never zero.
    pub fn checkpoint_interval(&self) -> u32 {
        self.values.checkpoint_interval.load(Ordering::SeqCst)
    }
}

impl Drop for RunSettings {
    fn drop(&mut self) {
        self.config.unsubscribe(self.subscription);
    }
}

/// Load a config file that must exist and validate.
pub fn load_config(path: &Path) -> Result<ConfigStore> {
    if !path.exists() {
        return Err(Error::Config(format!("config file not found: {}", path.display())));
    }
    let store = ConfigStore::load(path)?;
    store.validate()?;
    Ok(store)
}

/// A built system plus what the runner needs alongside it.
pub struct Bootstrapped {
    pub system: SovlSystem,
    pub checkpointer: Checkpointer,
    pub events: Arc<EventLog>,
}

/// Build a system on the offline collaborators, resuming from a checkpoint
/// when asked. A failed resume is logged and the run starts fresh.
pub fn bootstrap(options: &RunOptions) -> Result<Bootstrapped> {
    let config = Arc::new(load_config(&options.config)?);
    let events = Arc::new(EventLog::new(config.get_or(
        "logging_config.max_in_memory_logs",
        sovl_core::events::DEFAULT_CAPACITY,
    )));
    let sink: Arc<dyn EventSink> = events.clone();
    let context = SystemContext::new(config.clone(), options.device, sink);
    let collaborators = offline::collaborators(&context);
    let system = SystemBuilder::new().build(context, collaborators)?;
    let checkpointer = Checkpointer::from_config(&config);

    if let Some(path) = &options.resume_from_checkpoint {
        match checkpointer.load_checkpoint(&system, path) {
            Ok(record) => info!(timestamp = %record.timestamp, "resumed from checkpoint"),
            Err(e) => {
                warn!(error = %e, "resume failed, starting fresh");
                system.context().events().warn(
                    "checkpoint_resume_failed",
                    &format!("Could not resume from {}: {e}", path.display()),
                    json!({ "path": path.display().to_string() }),
                );
            }
        }
    }
    Ok(Bootstrapped {
        system,
        checkpointer,
        events,
    })
}

/// Run the selected mode, then always take a final checkpoint and shut down.
/// `cancel` is cancelled before shutdown so tasks tied to it stop first.
pub fn run(
    system: &SovlSystem,
    checkpointer: &Checkpointer,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    let outcome = run_mode(system, checkpointer, options, cancel, &mut summary);
    if let Err(e) = &outcome {
        system.context().events().log_error(
            &format!("Run failed: {e}"),
            "run_error",
            None,
            json!({ "mode": options.mode, "error_type": e.kind() }),
        );
    }

    match checkpointer.save_checkpoint(system, true) {
        Ok(Some(path)) => summary.checkpoints.push(path),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "final checkpoint failed"),
    }
    prune(system, checkpointer, options.max_checkpoints);
    cancel.cancel();
    system.shutdown();

    outcome.map(|()| summary)
}

fn prune(system: &SovlSystem, checkpointer: &Checkpointer, max: usize) {
    if let Err(e) = checkpointer.cleanup_old_checkpoints(system, max) {
        warn!(error = %e, "checkpoint cleanup failed");
    }
}

fn run_mode(
    system: &SovlSystem,
    checkpointer: &Checkpointer,
    options: &RunOptions,
    cancel: &CancellationToken,
    summary: &mut RunSummary,
) -> Result<()> {
    let events = system.context().events();
    match options.mode {
        Mode::Generate => {
            summary.question = system.generate_curiosity_question();
            if let Some(question) = &summary.question {
                info!(%question, "curiosity question");
            }
            Ok(())
        }
        Mode::Dream => {
            summary.dreamed = system.dream();
            Ok(())
        }
        Mode::Train => {
            let train_path = options
                .train_data
                .as_deref()
                .ok_or_else(|| Error::InsufficientData("No training data provided".into()))?;
            let train = system.load_training_data(train_path)?;
            let valid = options
                .valid_data
                .as_deref()
                .map(|p| system.load_training_data(p))
                .transpose()?;
            let settings = RunSettings::watch(system.context(), options);
            let mut stopper = EarlyStopping::new(settings.max_patience());
            let validate_every = options.validate_every.max(1);

            for epoch in 1..=options.epochs {
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    events.warn("training_cancelled", "Training interrupted", json!({ "epoch": epoch }));
                    break;
                }
                events.info(
                    "epoch_start",
                    &format!("Starting epoch {epoch}/{}", options.epochs),
                    json!({ "epoch": epoch, "total_epochs": options.epochs }),
                );
                let validating = epoch % validate_every == 0;
                let results = system.run_training_cycle(TrainingRequest {
                    train_data: Some(train.clone()),
                    valid_data: valid.clone().filter(|_| validating),
                    epochs: Some(1),
                    batch_size: options.batch_size,
                })?;
                summary.epochs_run = epoch;

                let mut stop = false;
                if let Some(loss) = results.valid_loss {
                    stopper.set_max_patience(settings.max_patience());
                    stop = stopper.observe(loss);
                    summary.best_valid_loss = stopper.best();
                    events.info(
                        "validation",
                        &format!("Epoch {epoch} validation loss {loss:.4}"),
                        json!({ "epoch": epoch, "valid_loss": loss, "patience": stopper.patience() }),
                    );
                }

                if epoch % settings.checkpoint_interval() == 0 {
                    match checkpointer.save_checkpoint(system, false) {
                        Ok(Some(path)) => summary.checkpoints.push(path),
                        Ok(None) => {}
                        Err(e) => warn!(epoch, error = %e, "checkpoint failed"),
                    }
                    prune(system, checkpointer, options.max_checkpoints);
                }

                if stop {
                    summary.stopped_early = true;
                    events.info(
                        "early_stopping",
                        &format!("Early stopping after epoch {epoch}"),
                        json!({ "epoch": epoch, "best_valid_loss": stopper.best() }),
                    );
                    break;
                }
            }
            Ok(())
        }
    }
}
