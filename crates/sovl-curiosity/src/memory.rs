//! Memory-manager boundary.

use serde_json::{Map, Value};
use sovl_core::Result;

/// Owns the memory budget of the loaded models.
pub trait MemoryManager: Send + Sync {
    fn set_enabled(&self, enabled: bool) -> Result<()>;

    fn is_enabled(&self) -> bool;

    fn stats(&self) -> Result<Map<String, Value>>;

    /// `Ok(false)` means unhealthy but checkable; `Err` means the check itself failed.
    fn check_memory_health(&self, model_size: u64) -> Result<bool>;
}
