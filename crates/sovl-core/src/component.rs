//! Component lifecycle and checkpoint contracts.

use crate::Result;
use serde_json::Value;

/// Symmetric serialization used by checkpoints.
pub trait Checkpointable: Send + Sync {
    fn to_dict(&self) -> Result<Value>;

    fn from_dict(&self, data: &Value) -> Result<()>;
}

/// Anything the system builds and later tears down.
pub trait Component: Send + Sync {
    fn name(&self) -> &'static str;

    /// Release held resources. Must be idempotent and safe before full init.
    fn cleanup(&self) {}

    /// Components that cannot be checkpointed keep the default, which blocks
    /// checkpoint save/load for them.
    fn checkpointable(&self) -> Option<&dyn Checkpointable> {
        None
    }
}
