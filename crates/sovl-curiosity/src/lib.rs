//! SOVL Curiosity - curiosity engine, memory monitoring and model loading
//!
//! The neural side of the system (question generation, training, dreaming,
//! memory budgeting, model weights) lives behind the traits in
//! [`collaborators`], [`memory`] and [`model`]. This crate only orchestrates
//! them: it checks preconditions, forwards faults to the `ErrorManager`, and
//! records what happened.

pub mod collaborators;
pub mod engine;
pub mod memory;
pub mod model;
pub mod monitor;

pub use collaborators::{
    CuriosityBackend, CuriosityManager, CycleManager, DataManager, DataProvider, DreamCycle,
    ProviderCapability, TrainingRequest, TrainingResults, TrainingSample,
};
pub use engine::CuriosityEngine;
pub use memory::MemoryManager;
pub use model::{ModelLoader, ModelManager};
pub use monitor::MemoryMonitor;
