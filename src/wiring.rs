//! Component wiring
//!
//! `SystemBuilder` constructs every component in dependency order. Before a
//! stage runs, the `ComponentGraph` checks that everything it depends on is
//! already marked ready, so a component can never observe a half-built
//! dependency.

use crate::system::{SovlSystem, SystemParts};
use serde_json::json;
use sovl_core::{Clock, Component, Error, Level, Result, SystemClock, SystemContext};
use sovl_curiosity::{CuriosityBackend, CuriosityEngine, MemoryManager, MemoryMonitor, ModelLoader, ModelManager};
use sovl_recovery::ErrorManager;
use sovl_state::StateTracker;
use std::collections::HashSet;
use std::sync::Arc;

pub const MODEL_LOADER: &str = "model_loader";
pub const STATE_TRACKER: &str = "state_tracker";
pub const ERROR_MANAGER: &str = "error_manager";
pub const MEMORY_MONITOR: &str = "memory_monitor";
pub const CURIOSITY_ENGINE: &str = "curiosity_engine";
pub const MEMORY_MANAGER: &str = "memory_manager";

/// Declared dependencies between named components, plus which are ready.
#[derive(Debug, Default, Clone)]
pub struct ComponentGraph {
    nodes: Vec<(&'static str, Vec<&'static str>)>,
    ready: HashSet<&'static str>,
}

impl ComponentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// The graph every SOVL system is built from, in build order.
    pub fn standard() -> Self {
        let mut graph = Self::new();
        graph.declare(MODEL_LOADER, &[]);
        graph.declare(STATE_TRACKER, &[]);
        graph.declare(ERROR_MANAGER, &[STATE_TRACKER]);
        graph.declare(MEMORY_MONITOR, &[ERROR_MANAGER]);
        graph.declare(CURIOSITY_ENGINE, &[MODEL_LOADER, STATE_TRACKER, ERROR_MANAGER]);
        graph.declare(MEMORY_MANAGER, &[MEMORY_MONITOR]);
        graph
    }

    /// Add a node, or replace the dependencies of an existing one.
    pub fn declare(&mut self, id: &'static str, deps: &[&'static str]) {
        match self.nodes.iter_mut().find(|(n, _)| *n == id) {
            Some((_, existing)) => *existing = deps.to_vec(),
            None => self.nodes.push((id, deps.to_vec())),
        }
    }

    pub fn dependencies(&self, id: &str) -> Option<&[&'static str]> {
        self.nodes
            .iter()
            .find(|(n, _)| *n == id)
            .map(|(_, deps)| deps.as_slice())
    }

    /// Declaration order.
    pub fn order(&self) -> Vec<&'static str> {
        self.nodes.iter().map(|(n, _)| *n).collect()
    }

    pub fn is_ready(&self, id: &str) -> bool {
        self.ready.contains(id)
    }

    /// Fail unless every dependency of `id` is ready.
    pub fn check_dependencies(&self, id: &str) -> Result<()> {
        let deps = self
            .dependencies(id)
            .ok_or_else(|| Error::initialization(id, "component is not declared"))?;
        match deps.iter().find(|d| !self.ready.contains(*d)) {
            Some(missing) => Err(Error::missing_dependency(id, *missing)),
            None => Ok(()),
        }
    }

    pub fn mark_ready(&mut self, id: &str) -> Result<()> {
        self.check_dependencies(id)?;
        if let Some((name, _)) = self.nodes.iter().find(|(n, _)| *n == id) {
            self.ready.insert(*name);
        }
        Ok(())
    }
}

/// Named components in build order.
#[derive(Default, Clone)]
pub struct ComponentRegistry {
    entries: Vec<Arc<dyn Component>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component. A component with the same name is replaced in place.
    pub fn register(&mut self, component: Arc<dyn Component>) {
        match self
            .entries
            .iter_mut()
            .find(|c| c.name() == component.name())
        {
            Some(slot) => *slot = component,
            None => self.entries.push(component),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Component>> {
        self.entries.iter().find(|c| c.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|c| c.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Component>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tear down in reverse build order.
    pub fn cleanup_all(&self) {
        for component in self.entries.iter().rev() {
            component.cleanup();
        }
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// The external collaborators a system is built on.
#[derive(Clone)]
pub struct Collaborators {
    pub models: Arc<dyn ModelManager>,
    pub curiosity: Arc<dyn CuriosityBackend>,
    pub memory: Option<Arc<dyn MemoryManager>>,
}

pub struct SystemBuilder {
    graph: ComponentGraph,
    clock: Arc<dyn Clock>,
}

impl Default for SystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemBuilder {
    pub fn new() -> Self {
        Self {
            graph: ComponentGraph::standard(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock used by the error manager's cooldown window.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn graph(&self) -> &ComponentGraph {
        &self.graph
    }

    fn stage<T>(
        &mut self,
        context: &SystemContext,
        id: &'static str,
        build: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        self.graph.check_dependencies(id)?;
        let built = build()?;
        self.graph.mark_ready(id)?;
        context.events().record_event(
            "component_initialization",
            &format!("Initialized {id}"),
            Level::Info,
            json!({ "component": id, "dependencies": self.graph.dependencies(id) }),
        );
        Ok(built)
    }

    /// Build every component and hand them to a new `SovlSystem`. The first
    /// constructor fault aborts the build, after releasing whatever was
    /// already built in reverse order.
    pub fn build(mut self, context: Arc<SystemContext>, collaborators: Collaborators) -> Result<SovlSystem> {
        let mut registry = ComponentRegistry::new();
        match self.build_stages(&context, &collaborators, &mut registry) {
            Ok(built) => Ok(SovlSystem::new(SystemParts {
                context,
                model_loader: built.model_loader,
                state_tracker: built.state_tracker,
                error_manager: built.error_manager,
                memory_monitor: built.memory_monitor,
                curiosity: Some(built.curiosity_engine),
                registry,
            })),
            Err(e) => {
                context.events().log_error(
                    &format!("System build failed: {e}"),
                    "system_build_failed",
                    None,
                    json!({ "built": registry.names(), "error_type": e.kind() }),
                );
                registry.cleanup_all();
                context.cleanup();
                Err(e)
            }
        }
    }

    fn build_stages(
        &mut self,
        ctx: &Arc<SystemContext>,
        collaborators: &Collaborators,
        registry: &mut ComponentRegistry,
    ) -> Result<Built> {
        let model_loader = self.stage(ctx, MODEL_LOADER, || {
            ModelLoader::new(ctx.clone(), collaborators.models.clone()).map(Arc::new)
        })?;
        registry.register(model_loader.clone());

        let state_tracker = self.stage(ctx, STATE_TRACKER, || {
            let tracker = Arc::new(StateTracker::new(ctx.clone()));
            tracker.load_state()?;
            Ok(tracker)
        })?;
        registry.register(state_tracker.clone());

        let clock = self.clock.clone();
        let error_manager = self.stage(ctx, ERROR_MANAGER, || {
            Ok(Arc::new(ErrorManager::with_clock(
                ctx.clone(),
                state_tracker.clone(),
                clock,
            )))
        })?;
        registry.register(error_manager.clone());

        let memory_monitor = self.stage(ctx, MEMORY_MONITOR, || {
            Ok(Arc::new(MemoryMonitor::new(
                ctx.clone(),
                collaborators.memory.clone(),
                error_manager.clone(),
            )))
        })?;
        registry.register(memory_monitor.clone());

        let curiosity_engine = self.stage(ctx, CURIOSITY_ENGINE, || {
            CuriosityEngine::new(
                ctx.clone(),
                model_loader.clone(),
                state_tracker.clone(),
                error_manager.clone(),
                collaborators.curiosity.as_ref(),
            )
            .map(Arc::new)
        })?;
        registry.register(curiosity_engine.clone());

        self.stage(ctx, MEMORY_MANAGER, || match memory_monitor.memory_manager().get() {
            Some(manager) => manager.set_enabled(ctx.config().get_or("memory_config.enabled", true)),
            None => Ok(()),
        })?;

        Ok(Built {
            model_loader,
            state_tracker,
            error_manager,
            memory_monitor,
            curiosity_engine,
        })
    }
}

struct Built {
    model_loader: Arc<ModelLoader>,
    state_tracker: Arc<StateTracker>,
    error_manager: Arc<ErrorManager>,
    memory_monitor: Arc<MemoryMonitor>,
    curiosity_engine: Arc<CuriosityEngine>,
}
