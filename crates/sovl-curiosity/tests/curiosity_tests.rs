//! Integration tests for sovl-curiosity: engine gating, monitor, model loader

use serde_json::{json, Map, Value};
use sovl_core::{Component, ConfigStore, Device, Error, EventLog, Level, Result, SystemContext};
use sovl_curiosity::{
    CuriosityBackend, CuriosityEngine, CuriosityManager, CycleManager, DataManager, DataProvider,
    DreamCycle, MemoryManager, MemoryMonitor, ModelLoader, ModelManager, ProviderCapability,
    TrainingRequest, TrainingResults, TrainingSample,
};
use sovl_recovery::ErrorManager;
use sovl_state::StateTracker;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================
// Stub collaborators
// ============================================================

struct StubModels;

impl ModelManager for StubModels {
    fn load_models(&self) -> Result<()> {
        Ok(())
    }
    fn base_model(&self) -> Option<String> {
        Some("stub-base".into())
    }
    fn tokenizer(&self) -> Option<String> {
        None
    }
    fn save_model_state(&self, timestamp: &str) -> Result<PathBuf> {
        Ok(PathBuf::from(format!("model_{timestamp}.json")))
    }
    fn load_model_state(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

struct StubProvider {
    caps: Vec<ProviderCapability>,
}

impl DataProvider for StubProvider {
    fn provider_type(&self) -> &str {
        "stub"
    }
    fn is_initialized(&self) -> bool {
        true
    }
    fn capabilities(&self) -> &[ProviderCapability] {
        &self.caps
    }
    fn load(&self, _source: &str) -> Result<Vec<TrainingSample>> {
        Ok(Vec::new())
    }
    fn validate(&self, _samples: &[TrainingSample]) -> Result<()> {
        Ok(())
    }
}

struct StubCycles {
    data: Option<DataManager>,
    runs: AtomicU64,
}

impl CycleManager for StubCycles {
    fn data_manager(&self) -> Option<&DataManager> {
        self.data.as_ref()
    }
    fn run_training_cycle(&self, request: &TrainingRequest) -> Result<TrainingResults> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(TrainingResults {
            epochs: request.epochs.unwrap_or(1),
            batches: 1,
            samples: 0,
            ..Default::default()
        })
    }
}

struct StubCuriosity;

impl CuriosityManager for StubCuriosity {
    fn generate_question(&self) -> Result<String> {
        Ok("why is the sky blue?".into())
    }
}

struct StubDream;

impl DreamCycle for StubDream {
    fn run_dream_cycle(&self) -> Result<()> {
        Ok(())
    }
}

enum DataSetup {
    NoDataManager,
    NoProvider,
    Provider(Vec<ProviderCapability>),
}

struct StubBackend {
    data: DataSetup,
    fail_curiosity: bool,
    dream: bool,
    cycles: std::sync::Mutex<Option<Arc<StubCycles>>>,
}

impl StubBackend {
    fn new(data: DataSetup) -> Self {
        Self {
            data,
            fail_curiosity: false,
            dream: false,
            cycles: std::sync::Mutex::new(None),
        }
    }

    fn runs(&self) -> u64 {
        self.cycles
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.runs.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl CuriosityBackend for StubBackend {
    fn create_curiosity_manager(&self, _context: &Arc<SystemContext>) -> Result<Arc<dyn CuriosityManager>> {
        if self.fail_curiosity {
            return Err(Error::runtime("no curiosity weights"));
        }
        Ok(Arc::new(StubCuriosity))
    }

    fn create_cycle_manager(
        &self,
        _context: &Arc<SystemContext>,
        _state_tracker: &Arc<StateTracker>,
        _curiosity: &Arc<dyn CuriosityManager>,
    ) -> Result<Arc<dyn CycleManager>> {
        let data = match &self.data {
            DataSetup::NoDataManager => None,
            DataSetup::NoProvider => Some(DataManager::new(None)),
            DataSetup::Provider(caps) => Some(DataManager::new(Some(Arc::new(StubProvider {
                caps: caps.clone(),
            })))),
        };
        let cycles = Arc::new(StubCycles {
            data,
            runs: AtomicU64::new(0),
        });
        *self.cycles.lock().unwrap() = Some(cycles.clone());
        Ok(cycles)
    }

    fn create_dream_cycle(&self, _context: &Arc<SystemContext>) -> Option<Arc<dyn DreamCycle>> {
        self.dream.then(|| Arc::new(StubDream) as Arc<dyn DreamCycle>)
    }
}

struct StubMemory {
    enabled: AtomicBool,
    fail: bool,
}

impl MemoryManager for StubMemory {
    fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
    fn stats(&self) -> Result<Map<String, Value>> {
        Ok(Map::new())
    }
    fn check_memory_health(&self, model_size: u64) -> Result<bool> {
        if self.fail {
            return Err(Error::OutOfMemory(format!("{model_size} bytes does not fit")));
        }
        Ok(model_size < 1_000)
    }
}

// ============================================================
// Harness
// ============================================================

struct Parts {
    context: Arc<SystemContext>,
    events: Arc<EventLog>,
    tracker: Arc<StateTracker>,
    errors: Arc<ErrorManager>,
    models: Arc<ModelLoader>,
}

fn parts_with(config: ConfigStore) -> Parts {
    let events = Arc::new(EventLog::default());
    let context = SystemContext::new(Arc::new(config), Device::Cpu, events.clone());
    let tracker = Arc::new(StateTracker::new(context.clone()));
    let errors = Arc::new(ErrorManager::new(context.clone(), tracker.clone()));
    let models = Arc::new(ModelLoader::new(context.clone(), Arc::new(StubModels)).unwrap());
    Parts {
        context,
        events,
        tracker,
        errors,
        models,
    }
}

fn parts() -> Parts {
    parts_with(ConfigStore::default())
}

fn engine(p: &Parts, backend: &StubBackend) -> Result<CuriosityEngine> {
    CuriosityEngine::new(
        p.context.clone(),
        p.models.clone(),
        p.tracker.clone(),
        p.errors.clone(),
        backend,
    )
}

fn full_caps() -> Vec<ProviderCapability> {
    vec![ProviderCapability::Load, ProviderCapability::Validate]
}

// ============================================================
// Training preconditions
// ============================================================

#[test]
fn missing_provider_is_reported_and_propagated() {
    let p = parts();
    let backend = StubBackend::new(DataSetup::NoProvider);
    let engine = engine(&p, &backend).unwrap();

    let err = engine
        .run_training_cycle(TrainingRequest {
            batch_size: Some(16),
            ..Default::default()
        })
        .unwrap_err();
    assert_eq!(err.kind(), "RuntimeError");
    assert!(err.to_string().contains("provider not initialized"));

    let reported = p.events.events_of_type("training_error");
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].data["batch_size"], 16);
    assert_eq!(p.errors.error_count("training:RuntimeError"), 1);
    assert_eq!(backend.runs(), 0);
}

#[test]
fn missing_data_manager_defaults_batch_to_one() {
    let p = parts();
    let backend = StubBackend::new(DataSetup::NoDataManager);
    let engine = engine(&p, &backend).unwrap();
    assert!(engine.run_training_cycle(TrainingRequest::default()).is_err());
    let reported = p.events.events_of_type("training_error");
    assert_eq!(reported[0].data["batch_size"], 1);
}

#[test]
fn provider_without_validate_is_rejected() {
    let p = parts();
    let backend = StubBackend::new(DataSetup::Provider(vec![ProviderCapability::Load]));
    let engine = engine(&p, &backend).unwrap();
    let err = engine.run_training_cycle(TrainingRequest::default()).unwrap_err();
    assert!(err.to_string().contains("Validate"));
    assert_eq!(backend.runs(), 0);
}

#[test]
fn ready_provider_runs_cycle_and_logs_completion() {
    let p = parts();
    let backend = StubBackend::new(DataSetup::Provider(full_caps()));
    let engine = engine(&p, &backend).unwrap();
    let results = engine
        .run_training_cycle(TrainingRequest {
            epochs: Some(2),
            batch_size: Some(4),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(results.epochs, 2);
    assert_eq!(backend.runs(), 1);

    let done = p.events.events_of_type("curiosity_training_complete");
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].data["data_manager_state"]["provider_type"], "stub");
    assert_eq!(done[0].data["data_manager_state"]["provider_initialized"], true);
    assert_eq!(p.events.count_of("training_error"), 0);
}

// ============================================================
// Configuration validation
// ============================================================

#[test]
fn invalid_config_without_source_fails_after_one_retry() {
    let config = ConfigStore::default();
    config.update("training_config.learning_rate", 0.0).unwrap();
    let p = parts_with(config);
    let backend = StubBackend::new(DataSetup::Provider(full_caps()));
    let engine = engine(&p, &backend).unwrap();

    assert!(!engine.validate_configuration());
    assert_eq!(p.events.count_of("config_validation_failed"), 1);
    assert_eq!(p.events.count_of("config_recovery_failed"), 1);

    let err = engine.run_training_cycle(TrainingRequest::default()).unwrap_err();
    assert!(err.to_string().contains("Invalid configuration state"));
}

#[test]
fn refresh_from_disk_repairs_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sovl_config.json");
    std::fs::write(
        &path,
        serde_json::to_string(&sovl_core::config::default_document()).unwrap(),
    )
    .unwrap();
    let config = ConfigStore::load(&path).unwrap();
    config.update("core_config.quantization", "fp64").unwrap();

    let p = parts_with(config);
    let backend = StubBackend::new(DataSetup::Provider(full_caps()));
    let engine = engine(&p, &backend).unwrap();

    assert!(engine.validate_configuration());
    assert_eq!(p.events.count_of("config_validation_failed"), 1);
    assert_eq!(p.events.count_of("config_recovery_failed"), 0);
    assert_eq!(
        p.context.config().get("core_config.quantization"),
        Some(json!("fp16"))
    );
}

// ============================================================
// Construction and passthroughs
// ============================================================

#[test]
fn curiosity_creation_failure_is_reported_then_returned() {
    let p = parts();
    let mut backend = StubBackend::new(DataSetup::NoProvider);
    backend.fail_curiosity = true;
    let err = engine(&p, &backend).err().unwrap();
    assert_eq!(err.kind(), "RuntimeError");
    assert_eq!(p.events.count_of("curiosity_error"), 1);
    assert_eq!(p.events.count_of("curiosity_engine_initialized"), 0);
}

#[test]
fn dream_requires_capability() {
    let p = parts();
    let backend = StubBackend::new(DataSetup::NoProvider);
    let engine = engine(&p, &backend).unwrap();
    assert!(!engine.can_dream());
    assert_eq!(engine.run_dream_cycle().unwrap_err().kind(), "UnavailableError");
    let reported = p.events.events_of_type("dream_error");
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].level, Level::Error);
    assert_eq!(reported[0].data["error_type"], json!("UnavailableError"));

    let mut dreaming = StubBackend::new(DataSetup::NoProvider);
    dreaming.dream = true;
    let engine = self::engine(&p, &dreaming).unwrap();
    assert!(engine.run_dream_cycle().is_ok());
    assert_eq!(engine.generate_question().unwrap(), "why is the sky blue?");
}

#[test]
fn engine_cleanup_is_idempotent() {
    let p = parts();
    let backend = StubBackend::new(DataSetup::NoProvider);
    let engine = engine(&p, &backend).unwrap();
    engine.cleanup();
    engine.cleanup();
    assert_eq!(p.events.count_of("curiosity_engine_released"), 1);
}

// ============================================================
// Model loader
// ============================================================

#[test]
fn negative_layer_weight_fails_initialization() {
    let config = ConfigStore::default();
    config
        .update("cross_attn_config.layer_weights", json!([0.5, -1.0]))
        .unwrap();
    let events = Arc::new(EventLog::default());
    let context = SystemContext::new(Arc::new(config), Device::Cpu, events);
    let err = ModelLoader::new(context, Arc::new(StubModels)).err().unwrap();
    assert_eq!(err.kind(), "InitializationError");
    assert!(err.is_fatal());
}

// ============================================================
// Memory monitor
// ============================================================

#[test]
fn monitor_routes_faults_to_error_manager() {
    let p = parts();
    let monitor = MemoryMonitor::new(
        p.context.clone(),
        Some(Arc::new(StubMemory {
            enabled: AtomicBool::new(true),
            fail: true,
        })),
        p.errors.clone(),
    );
    assert!(!monitor.check_memory_health(4096));
    assert_eq!(p.errors.error_count("memory:OutOfMemoryError"), 1);
    let reported = p.events.events_of_type("memory_error");
    assert_eq!(reported[0].data["memory_usage"], 4096.0);
}

#[test]
fn monitor_without_manager_reports_unavailable() {
    let p = parts();
    let monitor = MemoryMonitor::new(p.context.clone(), None, p.errors.clone());
    assert!(!monitor.memory_manager().is_available());
    assert!(!monitor.check_memory_health(1));
    assert_eq!(p.errors.error_count("memory:UnavailableError"), 1);
}

#[test]
fn healthy_check_is_logged() {
    let p = parts();
    let monitor = MemoryMonitor::new(
        p.context.clone(),
        Some(Arc::new(StubMemory {
            enabled: AtomicBool::new(true),
            fail: false,
        })),
        p.errors.clone(),
    );
    assert!(monitor.check_memory_health(10));
    assert!(!monitor.check_memory_health(10_000));
    let checks = p.events.events_of_type("memory_health");
    assert_eq!(checks[0].data["health_status"], "healthy");
    assert_eq!(checks[1].data["health_status"], "unhealthy");
}

#[tokio::test]
async fn periodic_monitor_stops_on_cancel() {
    let p = parts();
    let monitor = Arc::new(MemoryMonitor::new(
        p.context.clone(),
        Some(Arc::new(StubMemory {
            enabled: AtomicBool::new(true),
            fail: false,
        })),
        p.errors.clone(),
    ));
    let cancel = CancellationToken::new();
    let handle = monitor.clone().spawn_periodic(10, Duration::from_millis(10), cancel.clone());
    tokio::time::sleep(Duration::from_millis(60)).await;
    cancel.cancel();
    let checks = handle.await.unwrap();
    assert!(checks >= 2, "expected several checks, got {checks}");
    assert_eq!(p.events.count_of("memory_health") as u64, checks);
}

#[tokio::test]
async fn periodic_monitor_stops_after_cleanup() {
    let p = parts();
    let monitor = Arc::new(MemoryMonitor::new(
        p.context.clone(),
        Some(Arc::new(StubMemory {
            enabled: AtomicBool::new(true),
            fail: false,
        })),
        p.errors.clone(),
    ));
    monitor.cleanup();
    let handle = monitor
        .clone()
        .spawn_periodic(10, Duration::from_millis(5), CancellationToken::new());
    let checks = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checks, 0);
    assert_eq!(p.events.count_of("memory_health"), 0);
}
