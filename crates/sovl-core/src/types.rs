//! Core types for SOVL

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The five subsystems the error manager triages for.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Training,
    Curiosity,
    Memory,
    Generation,
    Data,
}

impl Subsystem {
    pub const ALL: [Subsystem; 5] = [
        Subsystem::Training,
        Subsystem::Curiosity,
        Subsystem::Memory,
        Subsystem::Generation,
        Subsystem::Data,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Curiosity => "curiosity",
            Self::Memory => "memory",
            Self::Generation => "generation",
            Self::Data => "data",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute device for tensor work. Only carried through to collaborators.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => Err(crate::Error::InvalidValue(format!("unknown device: {other}"))),
        }
    }
}

/// An optional collaborator, resolved once when the owning component is built.
///
/// Callers match on this instead of probing for the collaborator on every call.
#[derive(Clone, Debug)]
pub enum Capability<T> {
    Available(T),
    Unavailable { reason: String },
}

impl<T> Capability<T> {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn from_option(value: Option<T>, reason: impl Into<String>) -> Self {
        match value {
            Some(v) => Self::Available(v),
            None => Self::unavailable(reason),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Self::Available(v) => Some(v),
            Self::Unavailable { .. } => None,
        }
    }

    /// Borrow the collaborator or produce an `Unavailable` error naming why.
    pub fn require(&self) -> crate::Result<&T> {
        match self {
            Self::Available(v) => Ok(v),
            Self::Unavailable { reason } => Err(crate::Error::Unavailable(reason.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsystem_names() {
        let names: Vec<_> = Subsystem::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(names, ["training", "curiosity", "memory", "generation", "data"]);
        assert_eq!(serde_json::to_string(&Subsystem::Memory).unwrap(), r#""memory""#);
    }

    #[test]
    fn device_parses() {
        assert_eq!("CPU".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda);
        assert!("tpu".parse::<Device>().is_err());
    }

    #[test]
    fn capability_require() {
        let cap: Capability<u8> = Capability::unavailable("memory manager not initialized");
        let err = cap.require().unwrap_err();
        assert_eq!(err.kind(), "UnavailableError");
        assert!(err.to_string().contains("memory manager not initialized"));

        let cap = Capability::from_option(Some(3u8), "unused");
        assert_eq!(*cap.require().unwrap(), 3);
    }
}
