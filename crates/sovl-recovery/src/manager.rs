//! ErrorManager - central triage for runtime faults.
//!
//! Every report runs the same pipeline: build the key, drop it if it is a
//! duplicate inside the cooldown window, bump its cumulative count, then
//! recover or adjust once the count passes a threshold. Handlers never return
//! an error; a fault during handling is logged at critical level instead.

use crate::policy::{self, ErrorContext, Severity, SeverityThresholds};
use crate::window::RecentErrors;
use serde_json::{json, Value};
use sovl_core::{
    Checkpointable, Clock, Component, Error, Level, Result, Subsystem, SystemClock, SystemContext,
};
use sovl_state::StateTracker;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const RECOVERED_NOTICE: &str = "System recovered from error. Please try your request again.";
pub const ADJUSTED_NOTICE: &str = "System adjusted parameters. Please try your request again.";
pub const RECOVERY_FAILED_NOTICE: &str = "A critical error occurred. Please try again later.";
pub const ADJUSTMENT_FAILED_NOTICE: &str = "An error occurred. Please try again.";

/// `"<subsystem>:<ErrorKind>"`
pub fn error_key(subsystem: Subsystem, error: &Error) -> String {
    format!("{subsystem}:{}", error.kind())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Handling,
    Recovery,
    Adjustment,
}

/// What the manager did with one report.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    Duplicate,
    Recorded { count: u64, severity: Severity },
    Adjusted { count: u64 },
    Recovered,
    Failed { stage: FailureStage, reason: String },
}

impl Handled {
    /// User-facing text for generation faults.
    pub fn notice(&self) -> Option<&'static str> {
        match self {
            Self::Recovered => Some(RECOVERED_NOTICE),
            Self::Adjusted { .. } => Some(ADJUSTED_NOTICE),
            Self::Failed {
                stage: FailureStage::Recovery,
                ..
            } => Some(RECOVERY_FAILED_NOTICE),
            Self::Failed {
                stage: FailureStage::Adjustment,
                ..
            } => Some(ADJUSTMENT_FAILED_NOTICE),
            _ => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

struct Tally {
    counts: HashMap<String, u64>,
    recent: RecentErrors,
}

pub struct ErrorManager {
    context: Arc<SystemContext>,
    state_tracker: Arc<StateTracker>,
    clock: Arc<dyn Clock>,
    thresholds: SeverityThresholds,
    tally: Mutex<Tally>,
    released: AtomicBool,
}

impl ErrorManager {
    pub fn new(context: Arc<SystemContext>, state_tracker: Arc<StateTracker>) -> Self {
        Self::with_clock(context, state_tracker, Arc::new(SystemClock))
    }

    pub fn with_clock(
        context: Arc<SystemContext>,
        state_tracker: Arc<StateTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cooldown_secs: f64 = context.config().get_or("error_config.error_cooldown", 1.0);
        let cooldown = Duration::try_from_secs_f64(cooldown_secs).unwrap_or(Duration::ZERO);
        let thresholds = SeverityThresholds::from_config(context.config());

        let events = context.events();
        if !thresholds.is_ordered() {
            events.warn(
                "severity_thresholds_misordered",
                "Severity thresholds are not ordered warning <= error <= critical",
                json!(thresholds),
            );
        }
        events.info(
            "error_manager_initialized",
            "Error manager initialized",
            json!({ "error_cooldown": cooldown_secs, "severity_thresholds": thresholds }),
        );

        Self {
            context,
            state_tracker,
            clock,
            thresholds,
            tally: Mutex::new(Tally {
                counts: HashMap::new(),
                recent: RecentErrors::new(cooldown),
            }),
            released: AtomicBool::new(false),
        }
    }

    pub fn handle_training_error(&self, error: &Error, batch_size: u64) -> Handled {
        self.handle(error, ErrorContext::Training { batch_size })
    }

    pub fn handle_curiosity_error(&self, error: &Error, pressure: f64) -> Handled {
        self.handle(error, ErrorContext::Curiosity { pressure })
    }

    pub fn handle_memory_error(&self, error: &Error, memory_usage: f64) -> Handled {
        self.handle(error, ErrorContext::Memory { memory_usage })
    }

    /// Use [`Handled::notice`] for the text to show the user.
    pub fn handle_generation_error(&self, error: &Error, temperature: f64) -> Handled {
        self.handle(error, ErrorContext::Generation { temperature })
    }

    pub fn handle_data_error(&self, error: &Error, context: Value, conversation_id: &str) -> Handled {
        self.handle(
            error,
            ErrorContext::Data {
                context,
                conversation_id: conversation_id.to_string(),
            },
        )
    }

    /// Route a fault through detect, dedup, count and act.
    pub fn handle(&self, error: &Error, ctx: ErrorContext) -> Handled {
        let ctx = self.with_conversation(ctx);
        let subsystem = ctx.subsystem();
        let key = error_key(subsystem, error);
        match self.triage(subsystem, &key, error, &ctx) {
            Ok(handled) => handled,
            Err(e) => {
                let mut info = ctx.info();
                info.insert("original_error".into(), json!(error.to_string()));
                info.insert("error_key".into(), json!(key));
                self.context.events().record_event(
                    "error_handling_failed",
                    &format!("Failed to handle {subsystem} error: {e}"),
                    Level::Critical,
                    Value::Object(info),
                );
                Handled::Failed {
                    stage: FailureStage::Handling,
                    reason: e.to_string(),
                }
            }
        }
    }

    // Data faults without a conversation id are attributed to the live one.
    fn with_conversation(&self, ctx: ErrorContext) -> ErrorContext {
        match ctx {
            ErrorContext::Data {
                context,
                conversation_id,
            } if conversation_id.is_empty() => ErrorContext::Data {
                context,
                conversation_id: self
                    .state_tracker
                    .get_state()
                    .map(|s| s.conversation_id())
                    .unwrap_or_default(),
            },
            other => other,
        }
    }

    fn tally(&self) -> Result<MutexGuard<'_, Tally>> {
        self.tally
            .lock()
            .map_err(|_| Error::runtime("error tally lock poisoned"))
    }

    fn triage(
        &self,
        subsystem: Subsystem,
        key: &str,
        error: &Error,
        ctx: &ErrorContext,
    ) -> Result<Handled> {
        let events = self.context.events();
        let count = {
            let mut tally = self.tally()?;
            if tally.recent.check_and_insert(key, self.clock.now()) {
                None
            } else {
                let count = tally.counts.entry(key.to_string()).or_insert(0);
                *count += 1;
                Some(*count)
            }
        };

        let Some(count) = count else {
            let mut info = ctx.info();
            info.insert("error".into(), json!(error.to_string()));
            info.insert("error_key".into(), json!(key));
            events.warn(
                &format!("duplicate_{subsystem}_error"),
                &format!("Duplicate {subsystem} error detected: {key}"),
                Value::Object(info),
            );
            return Ok(Handled::Duplicate);
        };

        let severity = self.thresholds.classify(count);
        tracing::debug!(key, count, severity = severity.as_str(), "error triaged");

        let mut info = ctx.info();
        info.insert("error_key".into(), json!(key));
        info.insert("error_count".into(), json!(count));
        info.insert("severity".into(), json!(severity));
        events.error(
            &format!("{subsystem}_error"),
            &format!("{subsystem} error: {error}"),
            Value::Object(info),
        );

        Ok(match severity {
            Severity::Critical => self.recover(subsystem, key),
            Severity::Error => self.adjust(subsystem, ctx, count),
            Severity::Warning | Severity::Minor => Handled::Recorded { count, severity },
        })
    }

    fn recover(&self, subsystem: Subsystem, key: &str) -> Handled {
        let patch = policy::recovery_patch(subsystem);
        let outcome = self
            .tally()
            .map(|mut tally| {
                tally.counts.insert(key.to_string(), 0);
            })
            .and_then(|()| self.context.config().apply_recovery(subsystem, &patch));

        match outcome {
            Ok(()) => {
                self.context.events().info(
                    &format!("{subsystem}_recovery"),
                    &format!("Recovered from critical {subsystem} error"),
                    json!({ "error_key": key, "keys": patch.keys() }),
                );
                Handled::Recovered
            }
            Err(e) => {
                self.context.events().record_event(
                    "recovery_failed",
                    &format!("Failed to recover from {subsystem} error: {e}"),
                    Level::Critical,
                    json!({ "error_key": key }),
                );
                Handled::Failed {
                    stage: FailureStage::Recovery,
                    reason: e.to_string(),
                }
            }
        }
    }

    fn adjust(&self, subsystem: Subsystem, ctx: &ErrorContext, count: u64) -> Handled {
        let adjustment = policy::adjustment(ctx, self.context.config());
        match self
            .context
            .config()
            .apply_recovery(subsystem, &adjustment.patch)
        {
            Ok(()) => {
                self.context.events().info(
                    &format!("{subsystem}_adjustment"),
                    &format!("Adjusted {subsystem} parameters"),
                    adjustment.info,
                );
                Handled::Adjusted { count }
            }
            Err(e) => {
                self.context.events().error(
                    "adjustment_failed",
                    &format!("Failed to adjust {subsystem} parameters: {e}"),
                    json!({ "keys": adjustment.patch.keys() }),
                );
                Handled::Failed {
                    stage: FailureStage::Adjustment,
                    reason: e.to_string(),
                }
            }
        }
    }

    pub fn error_count(&self, key: &str) -> u64 {
        self.tally()
            .map(|t| t.counts.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn recent_error_count(&self) -> usize {
        self.tally().map(|t| t.recent.len()).unwrap_or(0)
    }

    pub fn thresholds(&self) -> SeverityThresholds {
        self.thresholds
    }

    pub fn cooldown(&self) -> Duration {
        self.tally()
            .map(|t| t.recent.cooldown())
            .unwrap_or(Duration::ZERO)
    }
}

impl Checkpointable for ErrorManager {
    fn to_dict(&self) -> Result<Value> {
        let tally = self.tally()?;
        Ok(json!({ "error_counts": tally.counts }))
    }

    fn from_dict(&self, data: &Value) -> Result<()> {
        let counts: HashMap<String, u64> = match data.get("error_counts") {
            Some(v) => serde_json::from_value(v.clone())?,
            None => {
                return Err(Error::serialization(
                    "error_manager",
                    "missing error_counts",
                ))
            }
        };
        self.tally()?.counts = counts;
        Ok(())
    }
}

impl Component for ErrorManager {
    fn name(&self) -> &'static str {
        "error_manager"
    }

    fn cleanup(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut tally) = self.tally() {
            tally.recent.clear();
        }
        self.context.events().info(
            "error_manager_cleanup",
            "Error manager released",
            json!({}),
        );
    }

    fn checkpointable(&self) -> Option<&dyn Checkpointable> {
        Some(self)
    }
}
