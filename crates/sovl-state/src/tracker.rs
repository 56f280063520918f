//! StateTracker - owns the live `SovlState` and its on-disk copy.

use crate::state::{SovlState, StateSnapshot, DEFAULT_MAX_HISTORY};
use serde_json::{json, Value};
use sovl_core::{Checkpointable, Component, Error, Level, Result, SystemContext};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

pub struct StateTracker {
    context: Arc<SystemContext>,
    state: RwLock<Option<Arc<SovlState>>>,
}

impl StateTracker {
    /// Build the tracker with a freshly initialized state.
    pub fn new(context: Arc<SystemContext>) -> Self {
        let max_history = context
            .config()
            .get_or("state_config.max_history", DEFAULT_MAX_HISTORY);
        let state = Arc::new(SovlState::new(max_history));
        let tracker = Self {
            context,
            state: RwLock::new(None),
        };
        tracker.log_event(
            "tracker_initialized",
            json!({
                "state_hash": state.state_hash(),
                "conversation_id": state.conversation_id(),
            }),
        );
        *tracker.state.write().unwrap_or_else(|p| p.into_inner()) = Some(state);
        tracker
    }

    fn log_event(&self, event: &str, data: Value) {
        self.context.events().record_event(
            &format!("state_{event}"),
            &format!("State event: {event}"),
            Level::Info,
            data,
        );
    }

    fn log_error(&self, message: &str, error: &Error) {
        let trace = std::backtrace::Backtrace::capture().to_string();
        self.context.events().log_error(
            message,
            "state_error",
            Some(&trace),
            json!({ "error": error.to_string() }),
        );
    }

    pub fn state_path(&self) -> Option<PathBuf> {
        self.context
            .config()
            .get_or::<Option<String>>("state_config.state_path", None)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    /// The live state. Fails before initialization and after cleanup.
    pub fn get_state(&self) -> Result<Arc<SovlState>> {
        self.state
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| Error::State("State not initialized".into()))
    }

    /// Restore from the configured path if it exists, else keep the fresh state.
    pub fn load_state(&self) -> Result<()> {
        let state = self.get_state()?;
        let Some(path) = self.state_path().filter(|p| p.exists()) else {
            self.log_event(
                "initialized",
                json!({
                    "state_hash": state.state_hash(),
                    "conversation_id": state.conversation_id(),
                }),
            );
            return Ok(());
        };

        let mut guard = state.lock();
        match read_snapshot(&path) {
            Ok(snapshot) => {
                *guard = snapshot;
                self.log_event(
                    "loaded",
                    json!({
                        "state_path": path.display().to_string(),
                        "state_hash": guard.state_hash,
                        "conversation_id": guard.history.conversation_id,
                    }),
                );
                Ok(())
            }
            Err(e) => {
                drop(guard);
                self.log_error("State loading failed", &e);
                Err(Error::State(format!("Failed to load state: {e}")))
            }
        }
    }

    /// Write the current state to the configured path. No path, no write.
    pub fn save_state(&self) -> Result<()> {
        let state = self.get_state()?;
        let Some(path) = self.state_path() else {
            return Ok(());
        };

        let guard = state.lock();
        match write_snapshot(&path, &guard) {
            Ok(()) => {
                self.log_event(
                    "saved",
                    json!({
                        "state_path": path.display().to_string(),
                        "state_hash": guard.state_hash,
                    }),
                );
                Ok(())
            }
            Err(e) => {
                drop(guard);
                self.log_error("State saving failed", &e);
                Err(Error::State(format!("Failed to save state: {e}")))
            }
        }
    }
}

fn read_snapshot(path: &Path) -> Result<StateSnapshot> {
    let json = std::fs::read_to_string(path)?;
    let snapshot: StateSnapshot = serde_json::from_str(&json)?;
    snapshot.verify()?;
    Ok(snapshot)
}

fn write_snapshot(path: &Path, snapshot: &StateSnapshot) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(snapshot)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    tracing::debug!(path = %path.display(), "state snapshot written");
    Ok(())
}

impl Checkpointable for StateTracker {
    fn to_dict(&self) -> Result<Value> {
        let state = self.get_state()?;
        Ok(serde_json::to_value(state.snapshot())?)
    }

    fn from_dict(&self, data: &Value) -> Result<()> {
        let snapshot: StateSnapshot = serde_json::from_value(data.clone())?;
        self.get_state()?.restore(snapshot)?;
        self.log_event("restored", json!({ "state_hash": self.get_state()?.state_hash() }));
        Ok(())
    }
}

impl Component for StateTracker {
    fn name(&self) -> &'static str {
        "state_tracker"
    }

    fn cleanup(&self) {
        let released = self.state.write().unwrap_or_else(|p| p.into_inner()).take();
        if released.is_some() {
            self.log_event("released", json!({}));
        }
    }

    fn checkpointable(&self) -> Option<&dyn Checkpointable> {
        Some(self)
    }
}
