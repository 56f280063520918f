//! SOVL Core - shared types, configuration, events and error handling
//!
//! Every other crate in the workspace depends on this one. Nothing here knows
//! about models, training or curiosity; it only provides the plumbing the
//! orchestration layer is built on.

pub mod clock;
pub mod component;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use component::{Checkpointable, Component};
pub use config::{ChangeOrigin, ConfigChange, ConfigPatch, ConfigStore, RecoveryRecord, SubscriptionId};
pub use context::SystemContext;
pub use error::{Error, Result};
pub use events::{EventLog, EventRecord, EventSink, Level};
pub use types::*;
