//! SOVL Recovery - error triage and self-healing
//!
//! Faults reported by the runtime are keyed by subsystem and error kind,
//! deduplicated inside a cooldown window, counted, and escalated once their
//! count passes the configured severity thresholds. Escalation rewrites the
//! live configuration through `ConfigStore::apply_recovery`.

pub mod manager;
pub mod policy;
pub mod window;

pub use manager::{error_key, ErrorManager, FailureStage, Handled};
pub use policy::{Adjustment, ErrorContext, Severity, SeverityThresholds};
pub use window::{ErrorRecord, RecentErrors};
