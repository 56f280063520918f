//! Boundaries to the curiosity, training and dreaming internals.
//!
//! Implementations own the neural-network work. The engine only sees these
//! traits, so a backend can be swapped without touching orchestration.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sovl_core::{Result, SystemContext};
use sovl_state::StateTracker;
use std::sync::Arc;

/// One prompt/response training pair.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrainingSample {
    pub prompt: String,
    pub response: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderCapability {
    Load,
    Validate,
}

/// Source of training data.
pub trait DataProvider: Send + Sync {
    fn provider_type(&self) -> &str;

    fn is_initialized(&self) -> bool;

    fn capabilities(&self) -> &[ProviderCapability];

    fn load(&self, source: &str) -> Result<Vec<TrainingSample>>;

    fn validate(&self, samples: &[TrainingSample]) -> Result<()>;
}

/// Holds the provider a cycle manager trains from, if it has one.
#[derive(Clone, Default)]
pub struct DataManager {
    provider: Option<Arc<dyn DataProvider>>,
}

impl DataManager {
    pub fn new(provider: Option<Arc<dyn DataProvider>>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> Option<&Arc<dyn DataProvider>> {
        self.provider.as_ref()
    }
}

impl std::fmt::Debug for DataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataManager")
            .field("provider", &self.provider.as_ref().map(|p| p.provider_type().to_string()))
            .finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainingRequest {
    pub train_data: Option<Vec<TrainingSample>>,
    pub valid_data: Option<Vec<TrainingSample>>,
    pub epochs: Option<u32>,
    pub batch_size: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TrainingResults {
    pub epochs: u32,
    pub batches: u64,
    pub samples: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub train_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_loss: Option<f64>,
}

pub trait CuriosityManager: Send + Sync {
    fn generate_question(&self) -> Result<String>;

    fn pressure(&self) -> f64 {
        0.0
    }

    /// Checkpointable state. Stateless managers keep the default.
    fn state(&self) -> Value {
        json!({})
    }

    fn restore(&self, _state: &Value) -> Result<()> {
        Ok(())
    }
}

pub trait CycleManager: Send + Sync {
    fn data_manager(&self) -> Option<&DataManager>;

    fn run_training_cycle(&self, request: &TrainingRequest) -> Result<TrainingResults>;

    fn state(&self) -> Value {
        json!({})
    }

    fn restore(&self, _state: &Value) -> Result<()> {
        Ok(())
    }
}

pub trait DreamCycle: Send + Sync {
    fn run_dream_cycle(&self) -> Result<()>;
}

/// Builds the collaborators a `CuriosityEngine` runs on.
pub trait CuriosityBackend: Send + Sync {
    fn create_curiosity_manager(&self, context: &Arc<SystemContext>) -> Result<Arc<dyn CuriosityManager>>;

    fn create_cycle_manager(
        &self,
        context: &Arc<SystemContext>,
        state_tracker: &Arc<StateTracker>,
        curiosity: &Arc<dyn CuriosityManager>,
    ) -> Result<Arc<dyn CycleManager>>;

    /// Backends without dreaming return `None`.
    fn create_dream_cycle(&self, _context: &Arc<SystemContext>) -> Option<Arc<dyn DreamCycle>> {
        None
    }
}
