//! Structured event sink
//!
//! Every significant transition in the orchestration layer produces exactly one
//! event. `EventLog` forwards each event to `tracing` and keeps a bounded ring
//! of the most recent ones so the runtime (and tests) can inspect them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub ts: DateTime<Utc>,
    pub level: Level,
    pub event: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub data: Value,
}

/// Where components report what they did.
pub trait EventSink: Send + Sync {
    fn record_event(&self, event_type: &str, message: &str, level: Level, info: Value);

    fn log_error(&self, error_msg: &str, error_type: &str, stack_trace: Option<&str>, info: Value);

    fn info(&self, event_type: &str, message: &str, info: Value) {
        self.record_event(event_type, message, Level::Info, info);
    }

    fn warn(&self, event_type: &str, message: &str, info: Value) {
        self.record_event(event_type, message, Level::Warning, info);
    }

    fn error(&self, event_type: &str, message: &str, info: Value) {
        self.record_event(event_type, message, Level::Error, info);
    }
}

pub const DEFAULT_CAPACITY: usize = 1000;

pub struct EventLog {
    recent: Mutex<VecDeque<EventRecord>>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, record: EventRecord) {
        emit_tracing(&record);
        let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    pub fn recent(&self) -> Vec<EventRecord> {
        let recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        recent.iter().cloned().collect()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<EventRecord> {
        let recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        recent.iter().filter(|r| r.event == event_type).cloned().collect()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        let recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        recent.iter().filter(|r| r.event == event_type).count()
    }

    pub fn last(&self) -> Option<EventRecord> {
        let recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        recent.back().cloned()
    }

    pub fn len(&self) -> usize {
        self.recent.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.recent.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl EventSink for EventLog {
    fn record_event(&self, event_type: &str, message: &str, level: Level, info: Value) {
        self.push(EventRecord {
            ts: Utc::now(),
            level,
            event: event_type.to_string(),
            message: message.to_string(),
            stack_trace: None,
            data: info,
        });
    }

    fn log_error(&self, error_msg: &str, error_type: &str, stack_trace: Option<&str>, info: Value) {
        self.push(EventRecord {
            ts: Utc::now(),
            level: Level::Error,
            event: error_type.to_string(),
            message: error_msg.to_string(),
            stack_trace: stack_trace.map(String::from),
            data: info,
        });
    }
}

fn emit_tracing(record: &EventRecord) {
    let data = if record.data.is_null() {
        String::new()
    } else {
        record.data.to_string()
    };
    match record.level {
        Level::Debug => tracing::debug!(event = %record.event, data = %data, "{}", record.message),
        Level::Info => tracing::info!(event = %record.event, data = %data, "{}", record.message),
        Level::Warning => tracing::warn!(event = %record.event, data = %data, "{}", record.message),
        Level::Error | Level::Critical => {
            tracing::error!(
                event = %record.event,
                level = record.level.as_str(),
                data = %data,
                stack_trace = record.stack_trace.as_deref().unwrap_or(""),
                "{}",
                record.message
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ring_drops_oldest() {
        let log = EventLog::new(2);
        log.info("a", "first", Value::Null);
        log.info("b", "second", Value::Null);
        log.info("c", "third", Value::Null);
        let names: Vec<_> = log.recent().into_iter().map(|r| r.event).collect();
        assert_eq!(names, ["b", "c"]);
    }

    #[test]
    fn log_error_keeps_stack_trace() {
        let log = EventLog::default();
        log.log_error("boom", "state_error", Some("frame 0"), json!({"error": "boom"}));
        let last = log.last().unwrap();
        assert_eq!(last.level, Level::Error);
        assert_eq!(last.event, "state_error");
        assert_eq!(last.stack_trace.as_deref(), Some("frame 0"));
    }

    #[test]
    fn record_serializes_flat() {
        let log = EventLog::default();
        log.warn("duplicate_training_error", "dup", json!({"batch_size": 8}));
        let json = serde_json::to_value(log.last().unwrap()).unwrap();
        assert_eq!(json["level"], "warning");
        assert_eq!(json["event"], "duplicate_training_error");
        assert_eq!(json["data"]["batch_size"], 8);
        assert!(json.get("stack_trace").is_none());
    }
}
