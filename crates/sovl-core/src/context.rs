//! Process-wide shared context.

use crate::config::{ChangeOrigin, ConfigStore, SubscriptionId};
use crate::events::{EventSink, Level};
use crate::types::Device;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Shared by every component for the lifetime of the process.
pub struct SystemContext {
    config_path: Option<PathBuf>,
    device: Device,
    events: Arc<dyn EventSink>,
    config: Arc<ConfigStore>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl SystemContext {
    pub fn new(config: Arc<ConfigStore>, device: Device, events: Arc<dyn EventSink>) -> Arc<Self> {
        let sink = events.clone();
        let subscription = config.subscribe(move |change| {
            let origin = match change.origin {
                ChangeOrigin::Update => "update".to_string(),
                ChangeOrigin::Refresh => "refresh".to_string(),
                ChangeOrigin::Recovery(subsystem) => format!("recovery:{subsystem}"),
            };
            sink.record_event(
                "config_change",
                "Configuration changed",
                Level::Info,
                json!({ "keys": change.keys, "origin": origin }),
            );
        });

        Arc::new(Self {
            config_path: config.source().map(Path::to_path_buf),
            device,
            events,
            config,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Detach from config notifications. Safe to call repeatedly.
    pub fn cleanup(&self) {
        let taken = self
            .subscription
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(id) = taken {
            self.config.unsubscribe(id);
            self.events
                .record_event("context_cleanup", "System context released", Level::Info, json!({}));
        }
    }
}

impl Drop for SystemContext {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.get_mut().ok().and_then(Option::take) {
            self.config.unsubscribe(id);
        }
    }
}
