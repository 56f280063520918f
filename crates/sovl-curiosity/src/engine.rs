//! CuriosityEngine - gates and runs curiosity-driven training.

use crate::collaborators::{
    CuriosityBackend, CuriosityManager, CycleManager, DreamCycle, ProviderCapability,
    TrainingRequest, TrainingResults,
};
use crate::model::ModelLoader;
use serde_json::{json, Value};
use sovl_core::{Capability, Checkpointable, Component, Error, Level, Result, SystemContext};
use sovl_recovery::ErrorManager;
use sovl_state::StateTracker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A provider must offer all of these before a cycle may start.
pub const REQUIRED_CAPABILITIES: &[ProviderCapability] =
    &[ProviderCapability::Load, ProviderCapability::Validate];

pub struct CuriosityEngine {
    context: Arc<SystemContext>,
    model_loader: Arc<ModelLoader>,
    state_tracker: Arc<StateTracker>,
    error_manager: Arc<ErrorManager>,
    curiosity_manager: Arc<dyn CuriosityManager>,
    cycle_manager: Arc<dyn CycleManager>,
    dreamer: Capability<Arc<dyn DreamCycle>>,
    released: AtomicBool,
}

impl CuriosityEngine {
    /// Build the curiosity and cycle managers. A creation fault is reported
    /// to the error manager and then returned.
    pub fn new(
        context: Arc<SystemContext>,
        model_loader: Arc<ModelLoader>,
        state_tracker: Arc<StateTracker>,
        error_manager: Arc<ErrorManager>,
        backend: &dyn CuriosityBackend,
    ) -> Result<Self> {
        let curiosity_manager = backend
            .create_curiosity_manager(&context)
            .inspect_err(|e| {
                error_manager.handle_curiosity_error(e, 0.0);
            })?;
        let cycle_manager = backend
            .create_cycle_manager(&context, &state_tracker, &curiosity_manager)
            .inspect_err(|e| {
                error_manager.handle_curiosity_error(e, curiosity_manager.pressure());
            })?;
        let dreamer = Capability::from_option(
            backend.create_dream_cycle(&context),
            "Dream cycle not supported",
        );

        context.events().info(
            "curiosity_engine_initialized",
            "Curiosity engine initialized successfully",
            json!({
                "cross_attention": model_loader.cross_attention_enabled(),
                "dream_cycle": dreamer.is_available(),
            }),
        );

        Ok(Self {
            context,
            model_loader,
            state_tracker,
            error_manager,
            curiosity_manager,
            cycle_manager,
            dreamer,
            released: AtomicBool::new(false),
        })
    }

    fn log_event(&self, event: &str, data: Value) {
        self.context.events().record_event(
            &format!("curiosity_{event}"),
            &format!("Curiosity event: {event}"),
            Level::Info,
            data,
        );
    }

    pub fn curiosity_manager(&self) -> &Arc<dyn CuriosityManager> {
        &self.curiosity_manager
    }

    pub fn cycle_manager(&self) -> &Arc<dyn CycleManager> {
        &self.cycle_manager
    }

    pub fn model_loader(&self) -> &Arc<ModelLoader> {
        &self.model_loader
    }

    pub fn can_dream(&self) -> bool {
        self.dreamer.is_available()
    }

    /// Validate the live config, refreshing from disk once if it is invalid.
    pub fn validate_configuration(&self) -> bool {
        let config = self.context.config();
        let events = self.context.events();
        if config.validate().is_ok() {
            return true;
        }
        events.error(
            "config_validation_failed",
            "Configuration validation failed, attempting recovery",
            json!({}),
        );
        if let Err(e) = config.refresh() {
            events.error(
                "config_validation_error",
                &format!("Error during configuration validation: {e}"),
                json!({ "error": e.to_string() }),
            );
            return false;
        }
        if let Err(e) = config.validate() {
            events.error(
                "config_recovery_failed",
                "Configuration recovery failed",
                json!({ "error": e.to_string() }),
            );
            return false;
        }
        true
    }

    /// Check preconditions, then delegate to the cycle manager. Any fault is
    /// reported as a training error and still returned.
    pub fn run_training_cycle(&self, request: TrainingRequest) -> Result<TrainingResults> {
        self.checked_training_cycle(&request).inspect_err(|e| {
            self.error_manager
                .handle_training_error(e, request.batch_size.unwrap_or(1));
        })
    }

    fn checked_training_cycle(&self, request: &TrainingRequest) -> Result<TrainingResults> {
        if !self.validate_configuration() {
            return Err(Error::runtime("Invalid configuration state"));
        }
        let data_manager = self
            .cycle_manager
            .data_manager()
            .ok_or_else(|| Error::runtime("DataManager not initialized in cycle manager"))?;
        let provider = data_manager
            .provider()
            .ok_or_else(|| Error::runtime("DataManager provider not initialized"))?;
        let missing: Vec<_> = REQUIRED_CAPABILITIES
            .iter()
            .filter(|c| !provider.capabilities().contains(*c))
            .collect();
        if !missing.is_empty() {
            return Err(Error::runtime(format!(
                "Invalid DataManager provider type: {} lacks {missing:?}",
                provider.provider_type()
            )));
        }

        let state = self.state_tracker.get_state()?;
        let results = self.cycle_manager.run_training_cycle(request)?;

        self.log_event(
            "training_complete",
            json!({
                "epochs": request.epochs,
                "batch_size": request.batch_size,
                "results": results,
                "state_hash": state.state_hash(),
                "data_manager_state": {
                    "provider_type": provider.provider_type(),
                    "provider_initialized": provider.is_initialized(),
                },
            }),
        );
        Ok(results)
    }

    pub fn generate_question(&self) -> Result<String> {
        self.curiosity_manager.generate_question()
    }

    /// Run one dream cycle. Without a dreamer this records a `dream_error`
    /// event and returns `Unavailable`.
    pub fn run_dream_cycle(&self) -> Result<()> {
        let dreamer = self.dreamer.require().inspect_err(|e| {
            self.context.events().error(
                "dream_error",
                &format!("Dream cycle failed: {e}"),
                json!({ "error": e.to_string(), "error_type": e.kind() }),
            );
        })?;
        dreamer.run_dream_cycle()
    }
}

impl Checkpointable for CuriosityEngine {
    fn to_dict(&self) -> Result<Value> {
        Ok(json!({
            "curiosity_manager": self.curiosity_manager.state(),
            "cycle_manager": self.cycle_manager.state(),
        }))
    }

    fn from_dict(&self, data: &Value) -> Result<()> {
        let (Some(curiosity), Some(cycle)) = (data.get("curiosity_manager"), data.get("cycle_manager"))
        else {
            return Err(Error::serialization(
                "curiosity_engine",
                "expected curiosity_manager and cycle_manager",
            ));
        };
        self.curiosity_manager.restore(curiosity)?;
        self.cycle_manager.restore(cycle)
    }
}

impl Component for CuriosityEngine {
    fn name(&self) -> &'static str {
        "curiosity_engine"
    }

    fn cleanup(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.log_event("engine_released", json!({}));
    }

    fn checkpointable(&self) -> Option<&dyn Checkpointable> {
        Some(self)
    }
}
