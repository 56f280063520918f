//! MemoryMonitor - health checks against the memory manager.

use crate::memory::MemoryManager;
use serde_json::{json, Value};
use sovl_core::{Capability, Checkpointable, Component, Error, Result, SystemContext};
use sovl_recovery::ErrorManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct MemoryMonitor {
    context: Arc<SystemContext>,
    manager: Capability<Arc<dyn MemoryManager>>,
    error_manager: Arc<ErrorManager>,
    released: AtomicBool,
}

impl MemoryMonitor {
    pub fn new(
        context: Arc<SystemContext>,
        manager: Option<Arc<dyn MemoryManager>>,
        error_manager: Arc<ErrorManager>,
    ) -> Self {
        Self {
            context,
            manager: Capability::from_option(manager, "Memory manager not initialized"),
            error_manager,
            released: AtomicBool::new(false),
        }
    }

    pub fn memory_manager(&self) -> &Capability<Arc<dyn MemoryManager>> {
        &self.manager
    }

    /// Ask the memory manager for a health verdict. Faults are routed to
    /// the error manager and reported as unhealthy.
    pub fn check_memory_health(&self, model_size: u64) -> bool {
        let verdict = self
            .manager
            .require()
            .and_then(|m| m.check_memory_health(model_size));
        match verdict {
            Ok(healthy) => {
                self.context.events().info(
                    "memory_health",
                    "Memory health checked",
                    json!({
                        "model_size": model_size,
                        "health_status": if healthy { "healthy" } else { "unhealthy" },
                        "device": self.context.device().as_str(),
                    }),
                );
                healthy
            }
            Err(e) => {
                self.error_manager.handle_memory_error(&e, model_size as f64);
                false
            }
        }
    }

    /// Run `check_memory_health` every `every` until `cancel` fires or the
    /// monitor is cleaned up. Resolves to the number of checks performed.
    pub fn spawn_periodic(
        self: Arc<Self>,
        model_size: u64,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<u64> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut checks = 0u64;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(checks, "memory monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if self.released.load(Ordering::SeqCst) {
                            debug!(checks, "memory monitor released");
                            break;
                        }
                        self.check_memory_health(model_size);
                        checks += 1;
                    }
                }
            }
            checks
        })
    }
}

impl Checkpointable for MemoryMonitor {
    fn to_dict(&self) -> Result<Value> {
        match self.manager.get() {
            Some(m) => Ok(json!({ "available": true, "enabled": m.is_enabled() })),
            None => Ok(json!({ "available": false })),
        }
    }

    fn from_dict(&self, data: &Value) -> Result<()> {
        let available = data
            .get("available")
            .and_then(Value::as_bool)
            .ok_or_else(|| Error::serialization("memory_monitor", "missing available flag"))?;
        match (self.manager.get(), data.get("enabled").and_then(Value::as_bool)) {
            (Some(m), Some(enabled)) if available => m.set_enabled(enabled),
            _ => Ok(()),
        }
    }
}

impl Component for MemoryMonitor {
    fn name(&self) -> &'static str {
        "memory_monitor"
    }

    fn cleanup(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.context
            .events()
            .info("memory_monitor_cleanup", "Memory monitor released", json!({}));
    }

    fn checkpointable(&self) -> Option<&dyn Checkpointable> {
        Some(self)
    }
}
