//! SOVL - runtime orchestration for a self-organizing language system
//!
//! Builds the component graph on top of the workspace crates, exposes the
//! `SovlSystem` façade, and persists checkpoints. The `sovl` binary drives it
//! through the runner.

pub mod checkpoint;
pub mod offline;
pub mod runner;
pub mod system;
pub mod wiring;

pub use checkpoint::{CheckpointRecord, Checkpointer};
pub use runner::{Mode, RunOptions, RunSummary};
pub use system::{OperationError, SovlSystem, SystemParts};
pub use wiring::{Collaborators, ComponentGraph, ComponentRegistry, SystemBuilder};
