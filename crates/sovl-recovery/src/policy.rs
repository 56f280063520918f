//! Escalation policy: thresholds, recovery patches and adjustments.

use serde::Serialize;
use serde_json::{json, Map, Value};
use sovl_core::{ConfigPatch, ConfigStore, Subsystem};

/// Cumulative-count thresholds. A count strictly greater than a threshold
/// reaches that severity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeverityThresholds {
    pub warning: f64,
    pub error: f64,
    pub critical: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            warning: 3.0,
            error: 5.0,
            critical: 10.0,
        }
    }
}

impl SeverityThresholds {
    pub fn from_config(config: &ConfigStore) -> Self {
        let d = Self::default();
        Self {
            warning: config.get_or("error_config.warning_threshold", d.warning),
            error: config.get_or("error_config.error_threshold", d.error),
            critical: config.get_or("error_config.critical_threshold", d.critical),
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.warning <= self.error && self.error <= self.critical
    }

    pub fn classify(&self, count: u64) -> Severity {
        let count = count as f64;
        if count > self.critical {
            Severity::Critical
        } else if count > self.error {
            Severity::Error
        } else if count > self.warning {
            Severity::Warning
        } else {
            Severity::Minor
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Minor,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// What the reporting site knew when the fault happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorContext {
    Training { batch_size: u64 },
    Curiosity { pressure: f64 },
    Memory { memory_usage: f64 },
    Generation { temperature: f64 },
    Data { context: Value, conversation_id: String },
}

impl ErrorContext {
    /// The context a caller with nothing to report passes.
    pub fn zero(subsystem: Subsystem) -> Self {
        match subsystem {
            Subsystem::Training => Self::Training { batch_size: 0 },
            Subsystem::Curiosity => Self::Curiosity { pressure: 0.0 },
            Subsystem::Memory => Self::Memory { memory_usage: 0.0 },
            Subsystem::Generation => Self::Generation { temperature: 0.0 },
            Subsystem::Data => Self::Data {
                context: json!({}),
                conversation_id: String::new(),
            },
        }
    }

    pub fn subsystem(&self) -> Subsystem {
        match self {
            Self::Training { .. } => Subsystem::Training,
            Self::Curiosity { .. } => Subsystem::Curiosity,
            Self::Memory { .. } => Subsystem::Memory,
            Self::Generation { .. } => Subsystem::Generation,
            Self::Data { .. } => Subsystem::Data,
        }
    }

    /// Fields merged into every event about this fault.
    pub fn info(&self) -> Map<String, Value> {
        let value = match self {
            Self::Training { batch_size } => json!({ "batch_size": batch_size }),
            Self::Curiosity { pressure } => json!({ "pressure": pressure }),
            Self::Memory { memory_usage } => json!({ "memory_usage": memory_usage }),
            Self::Generation { temperature } => json!({ "temperature": temperature }),
            Self::Data {
                context,
                conversation_id,
            } => json!({ "context": context, "conversation_id": conversation_id }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// The fixed safe settings for a subsystem. Values are constants, so
/// applying the same recovery twice leaves the config unchanged.
pub fn recovery_patch(subsystem: Subsystem) -> ConfigPatch {
    match subsystem {
        Subsystem::Training => ConfigPatch::new()
            .set("training_config.batch_size", 1)
            .set("training_config.learning_rate", 1e-5),
        Subsystem::Curiosity => ConfigPatch::new()
            .set("curiosity_config.pressure_threshold", 0.5)
            .set("curiosity_config.decay_rate", 0.9),
        Subsystem::Memory => ConfigPatch::new()
            .set("memory_config.max_memory_mb", 512)
            .set("memory_config.garbage_collection_threshold", 0.7),
        Subsystem::Generation => ConfigPatch::new()
            .set("generation_config.temperature", 0.7)
            .set("generation_config.top_p", 0.9),
        Subsystem::Data => ConfigPatch::new()
            .set("data_config.batch_size", 1)
            .set("data_config.max_retries", 3),
    }
}

/// A non-destructive tuning step and the before/after values it reports.
#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment {
    pub patch: ConfigPatch,
    pub info: Value,
}

/// Compute the adjustment for a fault, reading current values from `config`.
pub fn adjustment(ctx: &ErrorContext, config: &ConfigStore) -> Adjustment {
    match ctx {
        ErrorContext::Training { batch_size } => {
            let new = (batch_size / 2).max(1);
            Adjustment {
                patch: ConfigPatch::new().set("training_config.batch_size", new),
                info: json!({ "old_batch_size": batch_size, "new_batch_size": new }),
            }
        }
        ErrorContext::Curiosity { pressure } => {
            let old: f64 = config.get_or("curiosity_config.pressure_threshold", 0.5);
            let new = (old - 0.05).max(0.1);
            Adjustment {
                patch: ConfigPatch::new().set("curiosity_config.pressure_threshold", new),
                info: json!({ "old_pressure": old, "new_pressure": new, "pressure": pressure }),
            }
        }
        ErrorContext::Memory { memory_usage } => {
            let old: f64 = config.get_or("memory_config.garbage_collection_threshold", 0.8);
            let new = (old - 0.05).max(0.5);
            Adjustment {
                patch: ConfigPatch::new().set("memory_config.garbage_collection_threshold", new),
                info: json!({
                    "old_gc_threshold": old,
                    "new_gc_threshold": new,
                    "memory_usage": memory_usage,
                }),
            }
        }
        ErrorContext::Generation { temperature } => {
            let old: f64 = config.get_or("generation_config.temperature", 1.0);
            let new = (old - 0.05).max(0.5);
            Adjustment {
                patch: ConfigPatch::new().set("generation_config.temperature", new),
                info: json!({
                    "old_temperature": old,
                    "new_temperature": new,
                    "temperature": temperature,
                }),
            }
        }
        ErrorContext::Data { context, .. } => {
            let old: u64 = config.get_or("data_config.batch_size", 32);
            let new = (old / 2).max(1);
            Adjustment {
                patch: ConfigPatch::new().set("data_config.batch_size", new),
                info: json!({ "old_batch_size": old, "new_batch_size": new, "context": context }),
            }
        }
    }
}
