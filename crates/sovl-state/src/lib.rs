//! SOVL State - conversation state and its persistence
//!
//! `SovlState` is the canonical mutable state of a running system. It is owned
//! by the `StateTracker`, mutated only under its own lock, and carries a
//! content hash that is recomputed on every change.

pub mod state;
pub mod tracker;

pub use state::{ConversationHistory, Message, Role, SovlState, StateSnapshot};
pub use tracker::StateTracker;
