//! Model loading and cross-attention setup.

use serde_json::{json, Value};
use sovl_core::{Checkpointable, Component, Error, Result, SystemContext};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Boundary to the base/scaffold model pair. Handles are opaque.
pub trait ModelManager: Send + Sync {
    fn load_models(&self) -> Result<()>;

    fn base_model(&self) -> Option<String>;

    fn tokenizer(&self) -> Option<String>;

    /// Persist weights for a checkpoint taken at `timestamp`.
    fn save_model_state(&self, timestamp: &str) -> Result<PathBuf>;

    fn load_model_state(&self, path: &Path) -> Result<()>;

    fn cleanup(&self) {}
}

pub struct ModelLoader {
    context: Arc<SystemContext>,
    manager: Arc<dyn ModelManager>,
    cross_attention: bool,
    layer_selection_mode: String,
    released: AtomicBool,
}

impl ModelLoader {
    /// Load models and decide on cross-attention. Any fault here is fatal.
    pub fn new(context: Arc<SystemContext>, manager: Arc<dyn ModelManager>) -> Result<Self> {
        let config = context.config();
        let cross_attention = config.get_or("cross_attn_config.enabled", false);
        let layer_selection_mode: String =
            config.get_or("core_config.layer_selection_mode", "balanced".to_string());

        if cross_attention {
            let weights: Vec<f64> = config
                .get("cross_attn_config.layer_weights")
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| Error::initialization("model_loader", format!("layer_weights: {e}")))?
                .unwrap_or_default();
            if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
                return Err(Error::initialization(
                    "model_loader",
                    format!("invalid cross-attention layer weight {bad}"),
                ));
            }
        }

        manager
            .load_models()
            .map_err(|e| Error::initialization("model_loader", e.to_string()))?;

        context.events().info(
            "models_loaded",
            "Base and scaffold models loaded",
            json!({
                "base_model": manager.base_model(),
                "tokenizer": manager.tokenizer(),
                "cross_attention": cross_attention,
                "layer_selection_mode": layer_selection_mode,
                "device": context.device().as_str(),
            }),
        );

        Ok(Self {
            context,
            manager,
            cross_attention,
            layer_selection_mode,
            released: AtomicBool::new(false),
        })
    }

    pub fn manager(&self) -> &Arc<dyn ModelManager> {
        &self.manager
    }

    pub fn cross_attention_enabled(&self) -> bool {
        self.cross_attention
    }

    pub fn layer_selection_mode(&self) -> &str {
        &self.layer_selection_mode
    }
}

impl Checkpointable for ModelLoader {
    fn to_dict(&self) -> Result<Value> {
        Ok(json!({
            "cross_attention_enabled": self.cross_attention,
            "layer_selection_mode": self.layer_selection_mode,
            "base_model": self.manager.base_model(),
        }))
    }

    // Weights are restored through `load_model_state`; this only checks the
    // checkpoint was taken with the same topology.
    fn from_dict(&self, data: &Value) -> Result<()> {
        let saved = data
            .get("cross_attention_enabled")
            .and_then(Value::as_bool)
            .ok_or_else(|| Error::serialization("model_loader", "missing cross_attention_enabled"))?;
        if saved != self.cross_attention {
            return Err(Error::serialization(
                "model_loader",
                format!(
                    "checkpoint cross_attention={saved} but running with {}",
                    self.cross_attention
                ),
            ));
        }
        Ok(())
    }
}

impl Component for ModelLoader {
    fn name(&self) -> &'static str {
        "model_loader"
    }

    fn cleanup(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.manager.cleanup();
        self.context
            .events()
            .info("models_released", "Model resources released", json!({}));
    }

    fn checkpointable(&self) -> Option<&dyn Checkpointable> {
        Some(self)
    }
}
