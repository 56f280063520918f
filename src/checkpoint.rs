//! Checkpoint persistence
//!
//! A checkpoint is one `state_<ts>.json` record holding every component's
//! `to_dict()` output, plus whatever file the model manager wrote for the
//! same timestamp (`model_<ts>.json` for the offline manager).

use crate::system::SovlSystem;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sovl_core::{Clock, ConfigStore, Error, Result, SystemClock};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

const STATE_PREFIX: &str = "state_";
const MODEL_PREFIX: &str = "model_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub timestamp: String,
    pub model_path: Option<PathBuf>,
    pub components: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer_path: Option<PathBuf>,
}

pub struct Checkpointer {
    dir: PathBuf,
    interval: Duration,
    clock: Arc<dyn Clock>,
    last_save: Mutex<Option<Instant>>,
}

impl Checkpointer {
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            interval,
            clock: Arc::new(SystemClock),
            last_save: Mutex::new(None),
        }
    }

    /// Reads `checkpoint_config.checkpoint_dir` and `checkpoint_interval_secs`.
    pub fn from_config(config: &ConfigStore) -> Self {
        let dir: String = config.get_or("checkpoint_config.checkpoint_dir", "checkpoints".to_string());
        let secs: f64 = config.get_or("checkpoint_config.checkpoint_interval_secs", 1.0);
        Self::new(dir, Duration::try_from_secs_f64(secs).unwrap_or(Duration::from_secs(1)))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn due(&self, now: Instant) -> bool {
        let last = *self.last_save.lock().unwrap_or_else(|p| p.into_inner());
        last.map_or(true, |t| now.saturating_duration_since(t) >= self.interval)
    }

    fn mark_saved(&self, at: Instant) {
        *self.last_save.lock().unwrap_or_else(|p| p.into_inner()) = Some(at);
    }

    /// Write a checkpoint of every registered component. Returns `None` when
    /// the interval has not elapsed and `force` is not set.
    pub fn save_checkpoint(&self, system: &SovlSystem, force: bool) -> Result<Option<PathBuf>> {
        let now = self.clock.now();
        if !force && !self.due(now) {
            debug!("checkpoint skipped, interval not elapsed");
            return Ok(None);
        }
        let saved = self
            .write_checkpoint(system)
            .inspect_err(|e| report(system, "Checkpoint save failed", e))?;
        self.mark_saved(now);
        Ok(Some(saved))
    }

    fn write_checkpoint(&self, system: &SovlSystem) -> Result<PathBuf> {
        let components = collect_components(system)?;
        fs::create_dir_all(&self.dir)?;

        let mut timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        let mut path = self.state_file(&timestamp);
        let base = timestamp.clone();
        let mut n = 1;
        while path.exists() {
            timestamp = format!("{base}_{n}");
            path = self.state_file(&timestamp);
            n += 1;
        }

        let model_path = system
            .model_loader()
            .manager()
            .save_model_state(&timestamp)?;
        let record = CheckpointRecord {
            timestamp: timestamp.clone(),
            model_path: Some(model_path),
            components,
            optimizer_path: None,
        };

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&record)?)?;
        fs::rename(&tmp, &path)?;

        system.context().events().info(
            "checkpoint_saved",
            &format!("Checkpoint saved at {timestamp}"),
            json!({
                "path": path.display().to_string(),
                "model_path": record.model_path,
                "components": record.components.keys().collect::<Vec<_>>(),
            }),
        );
        Ok(path)
    }

    /// Restore the model state and every known component from `path`.
    pub fn load_checkpoint(&self, system: &SovlSystem, path: &Path) -> Result<CheckpointRecord> {
        let record = self
            .read_checkpoint(system, path)
            .inspect_err(|e| report(system, "Checkpoint load failed", e))?;
        self.mark_saved(self.clock.now());
        Ok(record)
    }

    fn read_checkpoint(&self, system: &SovlSystem, path: &Path) -> Result<CheckpointRecord> {
        let raw = fs::read_to_string(path)?;
        let record: CheckpointRecord = serde_json::from_str(&raw)
            .map_err(|e| Error::serialization("checkpoint", format!("{}: {e}", path.display())))?;

        if let Some(model_path) = &record.model_path {
            system.model_loader().manager().load_model_state(model_path)?;
        }

        let events = system.context().events();
        for (name, data) in &record.components {
            let Some(component) = system.registry().get(name) else {
                events.warn(
                    "checkpoint_unknown_component",
                    &format!("Skipping unknown component {name}"),
                    json!({ "component": name }),
                );
                continue;
            };
            let target = component.checkpointable().ok_or_else(|| {
                Error::serialization(name.as_str(), "component does not support checkpointing")
            })?;
            target.from_dict(data)?;
        }

        events.info(
            "checkpoint_loaded",
            &format!("Checkpoint {} restored", record.timestamp),
            json!({ "path": path.display().to_string(), "timestamp": record.timestamp }),
        );
        Ok(record)
    }

    /// Keep the newest `max` state files. Returns how many were removed.
    pub fn cleanup_old_checkpoints(&self, system: &SovlSystem, max: usize) -> Result<usize> {
        self.prune(max).inspect_err(|e| {
            system.context().events().log_error(
                &format!("Checkpoint cleanup failed: {e}"),
                "checkpoint_cleanup_error",
                None,
                json!({ "dir": self.dir.display().to_string() }),
            );
        })
        .inspect(|removed| {
            system.context().events().info(
                "checkpoint_cleanup",
                &format!("Removed {removed} old checkpoints"),
                json!({ "removed": removed, "kept": max }),
            );
        })
    }

    fn prune(&self, max: usize) -> Result<usize> {
        let mut removed = 0;
        for path in self.state_files()?.into_iter().skip(max) {
            if let Some(ts) = timestamp_of(&path) {
                let model = self.dir.join(format!("{MODEL_PREFIX}{ts}.json"));
                if model.exists() {
                    fs::remove_file(model)?;
                }
            }
            fs::remove_file(&path)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// The newest state file, if any.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.state_files()?.into_iter().next())
    }

    fn state_file(&self, timestamp: &str) -> PathBuf {
        self.dir.join(format!("{STATE_PREFIX}{timestamp}.json"))
    }

    /// State files, newest first.
    fn state_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if timestamp_of(&path).is_some() {
                files.push((fs::metadata(&path)?.modified()?, path));
            }
        }
        files.sort_by(|a, b| b.cmp(a));
        Ok(files.into_iter().map(|(_, p)| p).collect())
    }
}

fn timestamp_of(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(STATE_PREFIX)?.strip_suffix(".json")
}

fn collect_components(system: &SovlSystem) -> Result<Map<String, Value>> {
    let mut components = Map::new();
    for component in system.registry().iter() {
        let name = component.name();
        let target = component.checkpointable().ok_or_else(|| {
            Error::serialization(name, "component does not support checkpointing")
        })?;
        let data = target
            .to_dict()
            .map_err(|e| Error::serialization(name, e.to_string()))?;
        components.insert(name.to_string(), data);
    }
    Ok(components)
}

fn report(system: &SovlSystem, message: &str, error: &Error) {
    system.context().events().log_error(
        &format!("{message}: {error}"),
        "checkpoint_error",
        None,
        json!({ "error_type": error.kind() }),
    );
}
