//! End-to-end tests for wiring, the façade, checkpoints and the runner.

use serde_json::{json, Map, Value};
use sovl::offline::{self, OfflineModelManager};
use sovl::runner::{self, Mode, RunOptions, RunSettings};
use sovl::{Checkpointer, ComponentRegistry, OperationError, SovlSystem, SystemBuilder, SystemParts};
use sovl_core::config::default_document;
use sovl_core::{Component, ConfigPatch, ConfigStore, Device, Error, EventLog, Result, Subsystem, SystemContext};
use sovl_curiosity::{MemoryManager, MemoryMonitor, ModelLoader, ModelManager};
use sovl_recovery::ErrorManager;
use sovl_state::StateTracker;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn document(dir: &Path) -> Value {
    let mut doc = default_document();
    doc["checkpoint_config"]["checkpoint_dir"] = json!(dir.join("ckpt").display().to_string());
    doc["checkpoint_config"]["checkpoint_interval_secs"] = json!(0.0);
    doc
}

fn build(doc: Value) -> (SovlSystem, Arc<EventLog>) {
    let events = Arc::new(EventLog::default());
    let config = Arc::new(ConfigStore::from_value(doc));
    let context = SystemContext::new(config, Device::Cpu, events.clone());
    let collaborators = offline::collaborators(&context);
    let system = SystemBuilder::new().build(context, collaborators).unwrap();
    (system, events)
}

/// Parts with no curiosity engine and the given memory manager.
fn bare_parts(memory: Option<Arc<dyn MemoryManager>>) -> (SystemParts, Arc<EventLog>) {
    let events = Arc::new(EventLog::default());
    let context = SystemContext::new(Arc::new(ConfigStore::default()), Device::Cpu, events.clone());
    let models = Arc::new(OfflineModelManager::new("unused", "gpt2"));
    let model_loader = Arc::new(ModelLoader::new(context.clone(), models).unwrap());
    let state_tracker = Arc::new(StateTracker::new(context.clone()));
    let error_manager = Arc::new(ErrorManager::new(context.clone(), state_tracker.clone()));
    let memory_monitor = Arc::new(MemoryMonitor::new(context.clone(), memory, error_manager.clone()));

    let mut registry = ComponentRegistry::new();
    registry.register(model_loader.clone());
    registry.register(state_tracker.clone());
    registry.register(error_manager.clone());
    registry.register(memory_monitor.clone());

    let parts = SystemParts {
        context,
        model_loader,
        state_tracker,
        error_manager,
        memory_monitor,
        curiosity: None,
        registry,
    };
    (parts, events)
}

struct BrokenMemory;

impl MemoryManager for BrokenMemory {
    fn set_enabled(&self, _enabled: bool) -> Result<()> {
        Err(Error::runtime("allocator offline"))
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn stats(&self) -> Result<Map<String, Value>> {
        Err(Error::runtime("allocator offline"))
    }

    fn check_memory_health(&self, _model_size: u64) -> Result<bool> {
        Err(Error::OutOfMemory("no room".into()))
    }
}

struct Opaque;

impl Component for Opaque {
    fn name(&self) -> &'static str {
        "opaque"
    }
}

#[test]
fn builder_wires_every_component_in_order() {
    let tmp = TempDir::new().unwrap();
    let (system, events) = build(document(tmp.path()));

    assert_eq!(
        system.registry().names(),
        [
            "model_loader",
            "state_tracker",
            "error_manager",
            "memory_monitor",
            "curiosity_engine"
        ]
    );
    let stages: Vec<_> = events
        .events_of_type("component_initialization")
        .into_iter()
        .map(|e| e.data["component"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(stages.len(), 6);
    assert_eq!(stages.last().map(String::as_str), Some("memory_manager"));
    assert_eq!(events.count_of("system_initialized"), 1);
    assert!(system.get_memory_stats()["enabled"].as_bool().unwrap());
}

#[test]
fn bad_layer_weights_abort_the_build() {
    let tmp = TempDir::new().unwrap();
    let mut doc = document(tmp.path());
    doc["cross_attn_config"]["layer_weights"] = json!([0.5, -1.0]);

    let events = Arc::new(EventLog::default());
    let context = SystemContext::new(Arc::new(ConfigStore::from_value(doc)), Device::Cpu, events.clone());
    let collaborators = offline::collaborators(&context);
    let err = SystemBuilder::new()
        .build(context, collaborators)
        .err()
        .unwrap();
    assert_eq!(err.kind(), "InitializationError");
    assert_eq!(events.count_of("component_initialization"), 0);
}

#[test]
fn failed_build_releases_components_already_built() {
    let tmp = TempDir::new().unwrap();
    let state_path = tmp.path().join("state.json");
    fs::write(&state_path, "{ not json").unwrap();
    let mut doc = document(tmp.path());
    doc["state_config"]["state_path"] = json!(state_path.display().to_string());

    let events = Arc::new(EventLog::default());
    let config = Arc::new(ConfigStore::from_value(doc));
    let context = SystemContext::new(config.clone(), Device::Cpu, events.clone());
    let models = Arc::new(OfflineModelManager::from_config(&config));
    let mut collaborators = offline::collaborators(&context);
    collaborators.models = models.clone();

    let err = SystemBuilder::new()
        .build(context, collaborators)
        .err()
        .unwrap();
    assert_eq!(err.kind(), "StateError");
    assert_eq!(events.count_of("models_loaded"), 1);
    assert_eq!(events.count_of("models_released"), 1);
    assert_eq!(events.count_of("context_cleanup"), 1);
    assert_eq!(events.count_of("system_build_failed"), 1);
    assert_eq!(models.base_model(), None);
    assert_eq!(config.subscriber_count(), 0);
}

#[test]
fn unavailable_capabilities_return_sentinels() {
    let (parts, events) = bare_parts(None);
    let system = SovlSystem::new(parts);

    assert_eq!(system.generate_curiosity_question(), None);
    assert!(!system.toggle_memory(true));
    assert!(!system.dream());
    let stats = system.get_memory_stats();
    assert_eq!(stats["error"], json!("Memory manager not initialized"));
    assert!(!system.check_memory_health(1024));

    for event in [
        "curiosity_question_unavailable",
        "memory_toggle_unavailable",
        "dream_cycle_unavailable",
        "memory_stats_unavailable",
    ] {
        assert_eq!(events.count_of(event), 1, "{event}");
    }
    assert!(matches!(
        system.try_dream(),
        Err(OperationError::Unavailable { operation: "dream_cycle", .. })
    ));
}

#[test]
fn failing_operation_is_reported_to_error_manager() {
    let (parts, events) = bare_parts(Some(Arc::new(BrokenMemory)));
    let system = SovlSystem::new(parts);

    let err = system.try_toggle_memory(true).unwrap_err();
    assert_eq!(err.operation(), "memory_toggle");
    assert_eq!(system.error_manager().error_count("memory:RuntimeError"), 1);

    // Same key inside the cooldown: still a sentinel, but not counted again.
    let stats = system.get_memory_stats();
    assert_eq!(stats["error"], json!("runtime error: allocator offline"));
    assert_eq!(system.error_manager().error_count("memory:RuntimeError"), 1);
    assert_eq!(events.count_of("duplicate_memory_error"), 1);

    let logged = events.events_of_type("memory_stats_error");
    assert_eq!(logged.len(), 1);
    assert!(logged[0].stack_trace.is_some());
}

#[test]
fn dream_and_questions_use_offline_backend() {
    let tmp = TempDir::new().unwrap();
    let mut doc = document(tmp.path());
    doc["curiosity_config"]["seed_questions"] = json!(["why?", "how?"]);
    let (system, events) = build(doc);

    assert_eq!(system.generate_curiosity_question().as_deref(), Some("why?"));
    assert!(system.dream());
    assert_eq!(events.count_of("dream_reflection"), 1);
    assert_eq!(events.count_of("dream_cycle_complete"), 1);
    assert_eq!(events.count_of("curiosity_question_generated"), 1);
}

#[test]
fn dream_disabled_by_config() {
    let tmp = TempDir::new().unwrap();
    let mut doc = document(tmp.path());
    doc["dream_config"] = json!({ "enabled": false });
    let (system, _) = build(doc);
    assert!(!system.dream());
    assert!(system.generate_curiosity_question().is_some());
}

#[test]
fn shutdown_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let (system, events) = build(document(tmp.path()));
    system.shutdown();
    system.shutdown();
    assert!(system.is_shut_down());
    assert_eq!(events.count_of("system_shutdown"), 1);
    assert_eq!(events.count_of("context_cleanup"), 1);
    assert_eq!(events.count_of("models_released"), 1);
    assert!(system.record_exchange("hi", "hello").is_err());
}

#[test]
fn checkpoint_restores_into_fresh_system() {
    let tmp = TempDir::new().unwrap();
    let (system, _) = build(document(tmp.path()));
    let checkpointer = Checkpointer::from_config(system.context().config());

    system.generate_curiosity_question().unwrap();
    system.generate_curiosity_question().unwrap();
    let hash = system.record_exchange("hello", "hi there").unwrap();

    let path = checkpointer.save_checkpoint(&system, false).unwrap().unwrap();
    assert!(path.exists());
    let record: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert!(record["model_path"].as_str().unwrap().contains("model_"));
    assert!(record["components"].get("curiosity_engine").is_some());

    let (fresh, events) = build(document(tmp.path()));
    assert_ne!(fresh.state_tracker().get_state().unwrap().state_hash(), hash);
    checkpointer.load_checkpoint(&fresh, &path).unwrap();

    assert_eq!(fresh.state_tracker().get_state().unwrap().state_hash(), hash);
    let curiosity = fresh.curiosity_engine().unwrap().curiosity_manager().state();
    assert_eq!(curiosity["asked"], json!(2));
    assert_eq!(events.count_of("checkpoint_loaded"), 1);
}

#[test]
fn checkpoint_interval_gates_unforced_saves() {
    let tmp = TempDir::new().unwrap();
    let (system, _) = build(document(tmp.path()));
    let checkpointer = Checkpointer::new(tmp.path().join("ckpt"), Duration::from_secs(3600));

    assert!(checkpointer.save_checkpoint(&system, false).unwrap().is_some());
    assert!(checkpointer.save_checkpoint(&system, false).unwrap().is_none());
    assert!(checkpointer.save_checkpoint(&system, true).unwrap().is_some());
}

#[test]
fn cleanup_keeps_newest_and_their_models() {
    let tmp = TempDir::new().unwrap();
    let (system, events) = build(document(tmp.path()));
    let checkpointer = Checkpointer::from_config(system.context().config());

    let saved: Vec<_> = (0..4)
        .map(|_| checkpointer.save_checkpoint(&system, true).unwrap().unwrap())
        .collect();
    assert_eq!(checkpointer.cleanup_old_checkpoints(&system, 2).unwrap(), 2);

    let names: Vec<String> = fs::read_dir(checkpointer.dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.iter().filter(|n| n.starts_with("state_")).count(), 2);
    assert_eq!(names.iter().filter(|n| n.starts_with("model_")).count(), 2);
    assert_eq!(checkpointer.latest().unwrap().as_ref(), saved.last());
    assert_eq!(events.count_of("checkpoint_cleanup"), 1);
}

#[test]
fn component_without_checkpoint_support_blocks_save() {
    let tmp = TempDir::new().unwrap();
    let (mut parts, events) = bare_parts(None);
    parts.registry.register(Arc::new(Opaque));
    let system = SovlSystem::new(parts);
    let checkpointer = Checkpointer::new(tmp.path().join("ckpt"), Duration::ZERO);

    let err = checkpointer.save_checkpoint(&system, true).unwrap_err();
    assert_eq!(err.kind(), "SerializationError");
    assert_eq!(events.count_of("checkpoint_error"), 1);
    assert_eq!(checkpointer.latest().unwrap(), None);
}

fn write_config(tmp: &TempDir, doc: &Value) -> std::path::PathBuf {
    let path = tmp.path().join("sovl_config.json");
    fs::write(&path, serde_json::to_vec_pretty(doc).unwrap()).unwrap();
    path
}

fn write_samples(tmp: &TempDir, name: &str, n: usize) -> std::path::PathBuf {
    let path = tmp.path().join(name);
    let lines: Vec<String> = (0..n)
        .map(|i| json!({ "prompt": format!("q{i}"), "response": format!("a{i}") }).to_string())
        .collect();
    fs::write(&path, lines.join("\n")).unwrap();
    path
}

#[test]
fn train_run_checkpoints_and_prunes() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp, &document(tmp.path()));
    let mut options = RunOptions::new(&config, Mode::Train);
    options.epochs = 3;
    options.max_checkpoints = 2;
    options.train_data = Some(write_samples(&tmp, "train.jsonl", 5));
    options.valid_data = Some(write_samples(&tmp, "valid.jsonl", 2));

    let runner::Bootstrapped {
        system,
        checkpointer,
        events,
    } = runner::bootstrap(&options).unwrap();
    let summary = runner::run(&system, &checkpointer, &options, &CancellationToken::new()).unwrap();

    assert_eq!(summary.epochs_run, 3);
    assert!(!summary.stopped_early);
    assert!(summary.best_valid_loss.is_some());
    assert_eq!(summary.checkpoints.len(), 4);
    assert_eq!(events.count_of("epoch_start"), 3);
    assert_eq!(events.count_of("validation"), 3);
    assert_eq!(events.count_of("curiosity_training_complete"), 3);
    assert_eq!(events.count_of("system_shutdown"), 1);

    let states = fs::read_dir(checkpointer.dir())
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with("state_")
        })
        .count();
    assert_eq!(states, 2);
}

#[test]
fn cancelled_run_still_takes_final_checkpoint() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp, &document(tmp.path()));
    let mut options = RunOptions::new(&config, Mode::Train);
    options.epochs = 5;
    options.train_data = Some(write_samples(&tmp, "train.jsonl", 3));

    let runner::Bootstrapped {
        system, checkpointer, ..
    } = runner::bootstrap(&options).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = runner::run(&system, &checkpointer, &options, &cancel).unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.epochs_run, 0);
    assert_eq!(summary.checkpoints.len(), 1);
}

#[test]
fn train_without_data_fails_after_final_checkpoint() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp, &document(tmp.path()));
    let options = RunOptions::new(&config, Mode::Train);

    let runner::Bootstrapped {
        system,
        checkpointer,
        events,
    } = runner::bootstrap(&options).unwrap();
    let err = runner::run(&system, &checkpointer, &options, &CancellationToken::new()).unwrap_err();

    assert_eq!(err.to_string(), "insufficient data: No training data provided");
    assert_eq!(events.count_of("run_error"), 1);
    assert!(checkpointer.latest().unwrap().is_some());
    assert!(system.is_shut_down());
}

#[test]
fn generate_mode_asks_one_question() {
    let tmp = TempDir::new().unwrap();
    let mut doc = document(tmp.path());
    doc["curiosity_config"]["seed_questions"] = json!(["what next?"]);
    let config = write_config(&tmp, &doc);
    let options = RunOptions::new(&config, Mode::Generate);

    let runner::Bootstrapped {
        system, checkpointer, ..
    } = runner::bootstrap(&options).unwrap();
    let cancel = CancellationToken::new();
    let summary = runner::run(&system, &checkpointer, &options, &cancel).unwrap();
    assert_eq!(summary.question.as_deref(), Some("what next?"));
    assert_eq!(summary.epochs_run, 0);
    assert!(cancel.is_cancelled());
    assert!(system.is_shut_down());
}

#[test]
fn validation_runs_every_n_epochs() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp, &document(tmp.path()));
    let mut options = RunOptions::new(&config, Mode::Train);
    options.epochs = 4;
    options.validate_every = 2;
    options.train_data = Some(write_samples(&tmp, "train.jsonl", 4));
    options.valid_data = Some(write_samples(&tmp, "valid.jsonl", 2));

    let runner::Bootstrapped {
        system,
        checkpointer,
        events,
    } = runner::bootstrap(&options).unwrap();
    let summary = runner::run(&system, &checkpointer, &options, &CancellationToken::new()).unwrap();

    assert_eq!(summary.epochs_run, 4);
    let epochs: Vec<u64> = events
        .events_of_type("validation")
        .into_iter()
        .map(|e| e.data["epoch"].as_u64().unwrap())
        .collect();
    assert_eq!(epochs, [2, 4]);
}

#[test]
fn run_settings_follow_config_changes() {
    let tmp = TempDir::new().unwrap();
    let (system, events) = build(document(tmp.path()));
    let config = system.context().config().clone();
    let baseline = config.subscriber_count();
    let options = RunOptions::new(tmp.path().join("unused.json"), Mode::Train);

    let settings = RunSettings::watch(system.context(), &options);
    assert_eq!(config.subscriber_count(), baseline + 1);
    assert_eq!(settings.max_patience(), 3);
    assert_eq!(settings.checkpoint_interval(), 1);

    let patch = ConfigPatch::new()
        .set(runner::MAX_PATIENCE_KEY, 1)
        .set(runner::CHECKPOINT_INTERVAL_KEY, 2);
    config.apply_recovery(Subsystem::Training, &patch).unwrap();
    assert_eq!(settings.max_patience(), 1);
    assert_eq!(settings.checkpoint_interval(), 2);
    assert_eq!(events.count_of("run_settings_updated"), 1);

    config.update("generation_config.temperature", 0.5).unwrap();
    config.update(runner::CHECKPOINT_INTERVAL_KEY, 0).unwrap();
    assert_eq!(settings.checkpoint_interval(), 1);
    assert_eq!(settings.max_patience(), 1);
    assert_eq!(events.count_of("run_settings_updated"), 2);

    drop(settings);
    assert_eq!(config.subscriber_count(), baseline);
}

#[test]
fn failed_resume_starts_fresh() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp, &document(tmp.path()));
    let mut options = RunOptions::new(&config, Mode::Dream);
    options.resume_from_checkpoint = Some(tmp.path().join("missing.json"));

    let runner::Bootstrapped {
        system,
        checkpointer,
        events,
    } = runner::bootstrap(&options).unwrap();
    assert_eq!(events.count_of("checkpoint_resume_failed"), 1);
    let summary = runner::run(&system, &checkpointer, &options, &CancellationToken::new()).unwrap();
    assert!(summary.dreamed);
}

#[test]
fn invalid_config_is_rejected_before_build() {
    let tmp = TempDir::new().unwrap();
    let mut doc = document(tmp.path());
    doc["training_config"]["learning_rate"] = json!(0.0);
    let config = write_config(&tmp, &doc);

    let err = runner::load_config(&config).unwrap_err();
    assert_eq!(err.kind(), "ConfigError");
    assert!(err.to_string().contains("learning_rate"));
}
