//! Error types for SOVL

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("initialization failed: {component} - {reason}")]
    Initialization { component: String, reason: String },

    #[error("missing dependency: {component} requires {dependency}")]
    MissingDependency { component: String, dependency: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("state error: {0}")]
    State(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("capability unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {component} - {reason}")]
    Serialization { component: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn initialization(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Initialization {
            component: component.into(),
            reason: reason.into(),
        }
    }

    pub fn missing_dependency(component: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::MissingDependency {
            component: component.into(),
            dependency: dependency.into(),
        }
    }

    pub fn serialization(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Serialization {
            component: component.into(),
            reason: reason.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// Stable name of the failure class. Error keys are built from this, so
    /// two faults of the same variant always deduplicate against each other.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initialization { .. } => "InitializationError",
            Self::MissingDependency { .. } => "MissingDependencyError",
            Self::Config(_) => "ConfigError",
            Self::State(_) => "StateError",
            Self::InvalidValue(_) => "ValueError",
            Self::Runtime(_) => "RuntimeError",
            Self::OutOfMemory(_) => "OutOfMemoryError",
            Self::InsufficientData(_) => "InsufficientDataError",
            Self::Unavailable(_) => "UnavailableError",
            Self::Serialization { .. } => "SerializationError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
        }
    }

    /// Faults that must abort startup rather than be routed for recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Initialization { .. } | Self::MissingDependency { .. } | Self::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_per_variant() {
        assert_eq!(Error::InvalidValue("a".into()).kind(), "ValueError");
        assert_eq!(Error::InvalidValue("b".into()).kind(), "ValueError");
        assert_eq!(Error::runtime("x").kind(), "RuntimeError");
    }

    #[test]
    fn display_includes_component() {
        let e = Error::missing_dependency("error_manager", "state_tracker");
        assert_eq!(
            e.to_string(),
            "missing dependency: error_manager requires state_tracker"
        );
        assert!(e.is_fatal());
        assert!(!Error::runtime("boom").is_fatal());
    }
}
