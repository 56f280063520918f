//! Live configuration store
//!
//! Configuration is a JSON value tree addressed by dotted keys
//! (`"training_config.batch_size"`). It is loaded from JSON or TOML at startup,
//! can be refreshed from disk, and can be patched at runtime. Subscribers are
//! called synchronously, on the updating thread, after the write completes.
//!
//! Self-healing writes go through [`ConfigStore::apply_recovery`] only, which
//! refuses a patch that would break a valid document and keeps an audit trail
//! of every patch it applies.

use crate::{Error, Result, Subsystem};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOrigin {
    Update,
    Recovery(Subsystem),
    Refresh,
}

#[derive(Clone, Debug)]
pub struct ConfigChange {
    pub keys: Vec<String>,
    pub origin: ChangeOrigin,
}

pub type Subscriber = Arc<dyn Fn(&ConfigChange) + Send + Sync>;

/// An ordered set of key writes applied together.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConfigPatch {
    entries: Vec<(String, Value)>,
}

impl ConfigPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    pub fn entries(&self) -> &[(String, Value)] {
        &self.entries
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RecoveryRecord {
    pub subsystem: Subsystem,
    pub patch: ConfigPatch,
    pub applied_at: DateTime<Utc>,
}

pub struct ConfigStore {
    source: Option<PathBuf>,
    tree: RwLock<Value>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    audit: Mutex<Vec<RecoveryRecord>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore").field("source", &self.source).finish_non_exhaustive()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::from_value(default_document())
    }
}

impl ConfigStore {
    /// Build a store from an in-memory document. `refresh()` is a no-op for it.
    pub fn from_value(tree: Value) -> Self {
        Self {
            source: None,
            tree: RwLock::new(tree),
            subscribers: Mutex::new(Vec::new()),
            audit: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Load a config file. `.toml` files are parsed as TOML, everything else as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tree = read_document(path)?;
        tracing::info!("Loaded config from {}", path.display());
        let mut store = Self::from_value(tree);
        store.source = Some(path.to_path_buf());
        Ok(store)
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let tree = self.tree.read().unwrap_or_else(|p| p.into_inner());
        lookup(&tree, key).cloned()
    }

    /// Typed read with a fallback for missing or mistyped values.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(default)
    }

    pub fn get_section(&self, name: &str) -> Map<String, Value> {
        match self.get(name) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn snapshot(&self) -> Value {
        self.tree.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn update(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        {
            let mut tree = self.tree.write().unwrap_or_else(|p| p.into_inner());
            assign(&mut tree, key, value.into())?;
        }
        self.notify(&ConfigChange {
            keys: vec![key.to_string()],
            origin: ChangeOrigin::Update,
        });
        Ok(())
    }

    /// Apply a self-healing patch for one subsystem.
    ///
    /// The patch is staged on a copy of the tree and swapped in whole, so a
    /// bad key leaves the live config untouched. A patch that turns a valid
    /// document invalid is rejected. Subscribers see one change per patch.
    pub fn apply_recovery(&self, subsystem: Subsystem, patch: &ConfigPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        {
            let mut tree = self.tree.write().unwrap_or_else(|p| p.into_inner());
            let mut staged = tree.clone();
            for (key, value) in patch.entries() {
                assign(&mut staged, key, value.clone())?;
            }
            if validate_document(&tree).is_ok() {
                validate_document(&staged).map_err(|e| {
                    Error::Config(format!("{subsystem} recovery would invalidate config: {e}"))
                })?;
            }
            *tree = staged;
        }
        self.audit
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(RecoveryRecord {
                subsystem,
                patch: patch.clone(),
                applied_at: Utc::now(),
            });
        self.notify(&ConfigChange {
            keys: patch.keys(),
            origin: ChangeOrigin::Recovery(subsystem),
        });
        Ok(())
    }

    pub fn recovery_log(&self) -> Vec<RecoveryRecord> {
        self.audit.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn subscribe(&self, callback: impl Fn(&ConfigChange) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn notify(&self, change: &ConfigChange) {
        // Callbacks may read the store, so run them with no lock held.
        let subs: Vec<Subscriber> = self
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in subs {
            cb(change);
        }
    }

    /// Check required sections, required fields, and value ranges.
    pub fn validate(&self) -> Result<()> {
        let tree = self.tree.read().unwrap_or_else(|p| p.into_inner());
        validate_document(&tree)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Re-read the backing file, replacing the live tree.
    pub fn refresh(&self) -> Result<()> {
        let Some(path) = &self.source else {
            return Ok(());
        };
        let fresh = read_document(path)?;
        *self.tree.write().unwrap_or_else(|p| p.into_inner()) = fresh;
        self.notify(&ConfigChange {
            keys: Vec::new(),
            origin: ChangeOrigin::Refresh,
        });
        Ok(())
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.snapshot()).unwrap_or_default()
    }
}

fn read_document(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    if path.extension().is_some_and(|e| e == "toml") {
        toml::from_str(&content).map_err(|e| Error::Config(format!("invalid TOML in {}: {e}", path.display())))
    } else {
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid JSON in {}: {e}", path.display())))
    }
}

fn lookup<'a>(tree: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.').try_fold(tree, |node, part| node.get(part))
}

fn assign(tree: &mut Value, key: &str, value: Value) -> Result<()> {
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(Error::Config(format!("invalid config key: {key:?}")));
    }
    let mut parts = key.split('.').peekable();
    let mut node = tree;
    while let Some(part) = parts.next() {
        let Value::Object(map) = node else {
            return Err(Error::Config(format!("cannot set {key}: parent of {part} is not a section")));
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return Ok(());
        }
        node = map.entry(part.to_string()).or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}

const REQUIRED_FIELDS: &[(&str, &[&str])] = &[
    ("core_config", &["base_model_name", "base_model_path", "quantization"]),
    ("training_config", &["learning_rate", "grad_accum_steps", "max_grad_norm"]),
    ("memory_config", &["memory_threshold", "memory_decay_rate", "max_memory_mb"]),
    ("state_config", &["state_save_interval", "max_backup_files"]),
];

const QUANTIZATION_MODES: &[&str] = &["fp16", "int8", "int4"];

pub fn validate_document(tree: &Value) -> Result<()> {
    for (section, fields) in REQUIRED_FIELDS {
        let Some(body) = tree.get(section).and_then(Value::as_object) else {
            return Err(Error::Config(format!("missing required configuration section: {section}")));
        };
        for field in *fields {
            if !body.contains_key(*field) {
                return Err(Error::Config(format!(
                    "missing required field '{field}' in section '{section}'"
                )));
            }
        }
    }

    let number = |key: &str| -> Result<f64> {
        lookup(tree, key)
            .and_then(Value::as_f64)
            .ok_or_else(|| Error::Config(format!("{key} must be a number")))
    };

    if number("training_config.learning_rate")? <= 0.0 {
        return Err(Error::Config("learning_rate must be positive".into()));
    }
    let threshold = number("memory_config.memory_threshold")?;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(Error::Config("memory_threshold must be between 0 and 1".into()));
    }
    let interval = number("state_config.state_save_interval")?;
    if !(60.0..=3600.0).contains(&interval) {
        return Err(Error::Config(
            "state_save_interval must be between 60 and 3600 seconds".into(),
        ));
    }
    let quantization = lookup(tree, "core_config.quantization").and_then(Value::as_str);
    if !quantization.is_some_and(|q| QUANTIZATION_MODES.contains(&q)) {
        return Err(Error::Config(format!(
            "quantization must be one of {QUANTIZATION_MODES:?}"
        )));
    }
    Ok(())
}

/// A complete document with every key the runtime reads.
pub fn default_document() -> Value {
    json!({
        "core_config": {
            "base_model_name": "gpt2",
            "base_model_path": "models/base",
            "scaffold_model_name": "gpt2",
            "quantization": "fp16",
            "layer_selection_mode": "balanced"
        },
        "cross_attn_config": {
            "enabled": true,
            "layer_weights": []
        },
        "training_config": {
            "learning_rate": 2e-5,
            "batch_size": 32,
            "grad_accum_steps": 4,
            "max_grad_norm": 1.0,
            "checkpoint_interval": 1,
            "max_patience": 3
        },
        "memory_config": {
            "memory_threshold": 0.85,
            "memory_decay_rate": 0.95,
            "max_memory_mb": 1024,
            "garbage_collection_threshold": 0.8
        },
        "state_config": {
            "state_path": null,
            "state_save_interval": 300,
            "max_backup_files": 5,
            "max_history": 100
        },
        "curiosity_config": {
            "pressure_threshold": 0.5,
            "decay_rate": 0.9,
            "seed_questions": []
        },
        "generation_config": {
            "temperature": 1.0,
            "top_p": 0.9
        },
        "data_config": {
            "batch_size": 32,
            "max_retries": 3,
            "min_samples": 1
        },
        "error_config": {
            "error_cooldown": 1.0,
            "warning_threshold": 3.0,
            "error_threshold": 5.0,
            "critical_threshold": 10.0
        },
        "logging_config": {
            "max_in_memory_logs": 1000
        },
        "checkpoint_config": {
            "checkpoint_dir": "checkpoints",
            "checkpoint_interval_secs": 1.0,
            "max_checkpoints": 5
        }
    })
}
