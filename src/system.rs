//! SovlSystem façade
//!
//! The steady-state operations never propagate errors: each one returns a
//! sentinel (`None`, `false`, or an error map) and reports the fault through
//! the error manager. The `try_*` variants expose the underlying `Result`.

use crate::wiring::ComponentRegistry;
use serde_json::{json, Map, Value};
use sovl_core::{Capability, Error, Result, Subsystem, SystemContext};
use sovl_curiosity::{
    CuriosityEngine, MemoryManager, MemoryMonitor, ModelLoader, TrainingRequest, TrainingResults,
    TrainingSample,
};
use sovl_recovery::{ErrorContext, ErrorManager};
use sovl_state::StateTracker;
use std::backtrace::Backtrace;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum OperationError {
    #[error("{operation} unavailable: {reason}")]
    Unavailable {
        operation: &'static str,
        reason: String,
    },

    #[error("{operation} failed: {source}")]
    Failed {
        operation: &'static str,
        #[source]
        source: Error,
    },
}

impl OperationError {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Unavailable { operation, .. } | Self::Failed { operation, .. } => operation,
        }
    }

    /// The message shown in sentinel error maps.
    pub fn reason(&self) -> String {
        match self {
            Self::Unavailable { reason, .. } => reason.clone(),
            Self::Failed { source, .. } => source.to_string(),
        }
    }
}

struct Operation {
    name: &'static str,
    subsystem: Subsystem,
    done_event: &'static str,
    done_message: &'static str,
}

const CURIOSITY_QUESTION: Operation = Operation {
    name: "curiosity_question",
    subsystem: Subsystem::Curiosity,
    done_event: "curiosity_question_generated",
    done_message: "Generated curiosity question",
};

const MEMORY_TOGGLE: Operation = Operation {
    name: "memory_toggle",
    subsystem: Subsystem::Memory,
    done_event: "memory_toggle",
    done_message: "Memory management toggled",
};

const DREAM_CYCLE: Operation = Operation {
    name: "dream_cycle",
    subsystem: Subsystem::Curiosity,
    done_event: "dream_cycle_complete",
    done_message: "Dream cycle completed successfully",
};

const MEMORY_STATS: Operation = Operation {
    name: "memory_stats",
    subsystem: Subsystem::Memory,
    done_event: "memory_stats_retrieved",
    done_message: "Retrieved memory statistics",
};

/// Everything a `SovlSystem` is assembled from.
pub struct SystemParts {
    pub context: Arc<SystemContext>,
    pub model_loader: Arc<ModelLoader>,
    pub state_tracker: Arc<StateTracker>,
    pub error_manager: Arc<ErrorManager>,
    pub memory_monitor: Arc<MemoryMonitor>,
    pub curiosity: Option<Arc<CuriosityEngine>>,
    pub registry: ComponentRegistry,
}

pub struct SovlSystem {
    context: Arc<SystemContext>,
    model_loader: Arc<ModelLoader>,
    state_tracker: Arc<StateTracker>,
    error_manager: Arc<ErrorManager>,
    memory_monitor: Arc<MemoryMonitor>,
    curiosity: Capability<Arc<CuriosityEngine>>,
    dreamer: Capability<Arc<CuriosityEngine>>,
    memory: Capability<Arc<dyn MemoryManager>>,
    registry: ComponentRegistry,
    shut_down: AtomicBool,
}

impl SovlSystem {
    pub fn new(parts: SystemParts) -> Self {
        let curiosity =
            Capability::from_option(parts.curiosity, "Curiosity engine not initialized");
        let dreamer = match curiosity.get() {
            Some(engine) if engine.can_dream() => Capability::Available(engine.clone()),
            Some(_) => Capability::unavailable("Dream cycle not supported"),
            None => Capability::unavailable("Curiosity engine not initialized"),
        };
        let memory = parts.memory_monitor.memory_manager().clone();

        parts.context.events().info(
            "system_initialized",
            "SOVL system initialized",
            json!({
                "components": parts.registry.names(),
                "curiosity": curiosity.is_available(),
                "dream": dreamer.is_available(),
                "memory": memory.is_available(),
                "device": parts.context.device().as_str(),
            }),
        );

        Self {
            context: parts.context,
            model_loader: parts.model_loader,
            state_tracker: parts.state_tracker,
            error_manager: parts.error_manager,
            memory_monitor: parts.memory_monitor,
            curiosity,
            dreamer,
            memory,
            registry: parts.registry,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Arc<SystemContext> {
        &self.context
    }

    pub fn model_loader(&self) -> &Arc<ModelLoader> {
        &self.model_loader
    }

    pub fn state_tracker(&self) -> &Arc<StateTracker> {
        &self.state_tracker
    }

    pub fn error_manager(&self) -> &Arc<ErrorManager> {
        &self.error_manager
    }

    pub fn memory_monitor(&self) -> &Arc<MemoryMonitor> {
        &self.memory_monitor
    }

    pub fn curiosity_engine(&self) -> Option<&Arc<CuriosityEngine>> {
        self.curiosity.get()
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Check the capability, run `call`, log the outcome. Faults go to the
    /// error manager with a zero context before being returned.
    fn guarded<C, T>(
        &self,
        op: &Operation,
        capability: &Capability<C>,
        call: impl FnOnce(&C) -> Result<T>,
        describe: impl FnOnce(&T) -> Value,
    ) -> std::result::Result<T, OperationError> {
        let events = self.context.events();
        let target = match capability {
            Capability::Available(target) => target,
            Capability::Unavailable { reason } => {
                events.error(
                    &format!("{}_unavailable", op.name),
                    reason,
                    json!({ "operation": op.name }),
                );
                return Err(OperationError::Unavailable {
                    operation: op.name,
                    reason: reason.clone(),
                });
            }
        };

        match call(target) {
            Ok(value) => {
                events.info(op.done_event, op.done_message, describe(&value));
                Ok(value)
            }
            Err(e) => {
                self.error_manager
                    .handle(&e, ErrorContext::zero(op.subsystem));
                let trace = Backtrace::force_capture().to_string();
                events.log_error(
                    &format!("{} failed: {e}", op.name),
                    &format!("{}_error", op.name),
                    Some(&trace),
                    json!({ "operation": op.name, "error_type": e.kind() }),
                );
                Err(OperationError::Failed {
                    operation: op.name,
                    source: e,
                })
            }
        }
    }

    pub fn try_generate_curiosity_question(&self) -> std::result::Result<String, OperationError> {
        self.guarded(
            &CURIOSITY_QUESTION,
            &self.curiosity,
            |engine| engine.generate_question(),
            |question| json!({ "question": question }),
        )
    }

    pub fn generate_curiosity_question(&self) -> Option<String> {
        self.try_generate_curiosity_question().ok()
    }

    pub fn try_toggle_memory(&self, enable: bool) -> std::result::Result<(), OperationError> {
        self.guarded(
            &MEMORY_TOGGLE,
            &self.memory,
            |manager| manager.set_enabled(enable),
            |_| json!({ "enabled": enable }),
        )
    }

    pub fn toggle_memory(&self, enable: bool) -> bool {
        self.try_toggle_memory(enable).is_ok()
    }

    pub fn try_dream(&self) -> std::result::Result<(), OperationError> {
        self.guarded(
            &DREAM_CYCLE,
            &self.dreamer,
            |engine| engine.run_dream_cycle(),
            |_| json!({}),
        )
    }

    pub fn dream(&self) -> bool {
        self.try_dream().is_ok()
    }

    pub fn try_get_memory_stats(&self) -> std::result::Result<Map<String, Value>, OperationError> {
        self.guarded(
            &MEMORY_STATS,
            &self.memory,
            |manager| manager.stats(),
            |stats| json!({ "stats": stats }),
        )
    }

    pub fn get_memory_stats(&self) -> Map<String, Value> {
        self.try_get_memory_stats().unwrap_or_else(|e| {
            let mut map = Map::new();
            map.insert("error".into(), Value::String(e.reason()));
            map
        })
    }

    pub fn check_memory_health(&self, model_size: u64) -> bool {
        self.memory_monitor.check_memory_health(model_size)
    }

    /// Unlike the other operations this propagates, after reporting.
    pub fn run_training_cycle(&self, request: TrainingRequest) -> Result<TrainingResults> {
        let engine = self.curiosity.require().inspect_err(|e| {
            self.error_manager
                .handle_training_error(e, request.batch_size.unwrap_or(1));
        })?;
        engine.run_training_cycle(request)
    }

    /// Load and validate samples through the cycle manager's data provider.
    pub fn load_training_data(&self, source: &Path) -> Result<Vec<TrainingSample>> {
        let source = source.display().to_string();
        self.read_samples(&source).inspect_err(|e| {
            self.error_manager
                .handle_data_error(e, json!({ "source": source }), "");
        })
    }

    fn read_samples(&self, source: &str) -> Result<Vec<TrainingSample>> {
        let engine = self.curiosity.require()?;
        let provider = engine
            .cycle_manager()
            .data_manager()
            .and_then(|d| d.provider())
            .ok_or_else(|| Error::Unavailable("DataManager provider not initialized".into()))?;
        let samples = provider.load(source)?;
        provider.validate(&samples)?;
        self.context.events().info(
            "training_data_loaded",
            "Loaded training data",
            json!({ "source": source, "samples": samples.len(), "provider": provider.provider_type() }),
        );
        Ok(samples)
    }

    /// Append a prompt/response pair to the conversation. Returns the new state hash.
    pub fn record_exchange(&self, prompt: &str, response: &str) -> Result<String> {
        let state = self.state_tracker.get_state()?;
        Ok(state.record_exchange(prompt, response))
    }

    pub fn save_state(&self) -> Result<()> {
        self.state_tracker.save_state()
    }

    pub fn load_state(&self) -> Result<()> {
        self.state_tracker.load_state()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Tear down every component in reverse build order. Safe to call twice.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.cleanup_all();
        self.context.cleanup();
        self.context.events().info(
            "system_shutdown",
            "SOVL system shut down",
            json!({ "components": self.registry.names() }),
        );
    }
}

impl Drop for SovlSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
