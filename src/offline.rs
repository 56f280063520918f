//! Offline collaborators
//!
//! Implementations of every collaborator boundary that need no model weights.
//! The runner uses them so the orchestration layer can be driven end to end,
//! and tests build systems from them.

use crate::wiring::Collaborators;
use serde_json::{json, Map, Value};
use sovl_core::{ConfigStore, Error, Result, SystemContext};
use sovl_curiosity::{
    CuriosityBackend, CuriosityManager, CycleManager, DataManager, DataProvider, DreamCycle,
    MemoryManager, ModelManager, ProviderCapability, TrainingRequest, TrainingResults,
    TrainingSample,
};
use sovl_state::StateTracker;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const DEFAULT_QUESTIONS: &[&str] = &[
    "What patterns did the last conversation leave unexplained?",
    "Which of my recent answers was I least certain about?",
    "What would change if the opposite were true?",
];

/// Writes model metadata instead of weights.
pub struct OfflineModelManager {
    dir: PathBuf,
    base_model: String,
    loaded: AtomicBool,
    restored_from: Mutex<Option<PathBuf>>,
}

impl OfflineModelManager {
    pub fn new(dir: impl Into<PathBuf>, base_model: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base_model: base_model.into(),
            loaded: AtomicBool::new(false),
            restored_from: Mutex::new(None),
        }
    }

    pub fn from_config(config: &ConfigStore) -> Self {
        Self::new(
            config.get_or("checkpoint_config.checkpoint_dir", "checkpoints".to_string()),
            config.get_or("core_config.base_model_name", "gpt2".to_string()),
        )
    }

    pub fn restored_from(&self) -> Option<PathBuf> {
        self.restored_from.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl ModelManager for OfflineModelManager {
    fn load_models(&self) -> Result<()> {
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn base_model(&self) -> Option<String> {
        self.loaded
            .load(Ordering::SeqCst)
            .then(|| self.base_model.clone())
    }

    fn tokenizer(&self) -> Option<String> {
        self.base_model()
    }

    fn save_model_state(&self, timestamp: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("model_{timestamp}.json"));
        let meta = json!({ "base_model": self.base_model, "timestamp": timestamp });
        fs::write(&path, serde_json::to_vec_pretty(&meta)?)?;
        Ok(path)
    }

    fn load_model_state(&self, path: &Path) -> Result<()> {
        let meta: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
        let saved = meta.get("base_model").and_then(Value::as_str);
        if saved != Some(self.base_model.as_str()) {
            return Err(Error::InvalidValue(format!(
                "model state {} is for {saved:?}, running {}",
                path.display(),
                self.base_model
            )));
        }
        *self.restored_from.lock().unwrap_or_else(|p| p.into_inner()) = Some(path.to_path_buf());
        Ok(())
    }

    fn cleanup(&self) {
        self.loaded.store(false, Ordering::SeqCst);
    }
}

/// Cycles through a fixed bank of questions. Pressure decays with every question asked.
pub struct SeedCuriosity {
    questions: Vec<String>,
    decay_rate: f64,
    asked: AtomicU64,
}

impl SeedCuriosity {
    pub fn new(questions: Vec<String>, decay_rate: f64) -> Self {
        let questions = if questions.is_empty() {
            DEFAULT_QUESTIONS.iter().map(|q| q.to_string()).collect()
        } else {
            questions
        };
        Self {
            questions,
            decay_rate,
            asked: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &ConfigStore) -> Self {
        Self::new(
            config.get_or("curiosity_config.seed_questions", Vec::new()),
            config.get_or("curiosity_config.decay_rate", 0.9),
        )
    }
}

impl CuriosityManager for SeedCuriosity {
    fn generate_question(&self) -> Result<String> {
        let n = self.asked.fetch_add(1, Ordering::SeqCst);
        let index = (n % self.questions.len() as u64) as usize;
        Ok(self.questions[index].clone())
    }

    fn pressure(&self) -> f64 {
        let asked = self.asked.load(Ordering::SeqCst).min(i32::MAX as u64) as i32;
        self.decay_rate.powi(asked)
    }

    fn state(&self) -> Value {
        json!({ "asked": self.asked.load(Ordering::SeqCst) })
    }

    fn restore(&self, state: &Value) -> Result<()> {
        let asked = state
            .get("asked")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::serialization("curiosity_manager", "missing asked counter"))?;
        self.asked.store(asked, Ordering::SeqCst);
        Ok(())
    }
}

/// Reads prompt/response pairs from JSON Lines files.
pub struct JsonlProvider {
    min_samples: usize,
}

impl JsonlProvider {
    const CAPABILITIES: [ProviderCapability; 2] =
        [ProviderCapability::Load, ProviderCapability::Validate];

    pub fn new(min_samples: usize) -> Self {
        Self { min_samples }
    }
}

impl DataProvider for JsonlProvider {
    fn provider_type(&self) -> &str {
        "jsonl"
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn capabilities(&self) -> &[ProviderCapability] {
        &Self::CAPABILITIES
    }

    fn load(&self, source: &str) -> Result<Vec<TrainingSample>> {
        let content = fs::read_to_string(source)?;
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line)
                    .map_err(|e| Error::InvalidValue(format!("{source}:{}: {e}", n + 1)))
            })
            .collect()
    }

    fn validate(&self, samples: &[TrainingSample]) -> Result<()> {
        if samples.len() < self.min_samples {
            return Err(Error::InsufficientData(format!(
                "loaded {} samples, need at least {}",
                samples.len(),
                self.min_samples
            )));
        }
        match samples
            .iter()
            .position(|s| s.prompt.trim().is_empty() || s.response.trim().is_empty())
        {
            Some(i) => Err(Error::InvalidValue(format!("sample {i} has an empty field"))),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct CycleTotals {
    cycles: u64,
    samples: u64,
}

/// Counts batches and samples without touching weights.
///
/// Losses are a deterministic stand-in that shrinks with every cycle run, so
/// validation and early stopping can be exercised.
pub struct BookkeepingCycles {
    data: DataManager,
    default_batch: u64,
    totals: Mutex<CycleTotals>,
}

impl BookkeepingCycles {
    pub fn new(data: DataManager, default_batch: u64) -> Self {
        Self {
            data,
            default_batch: default_batch.max(1),
            totals: Mutex::new(CycleTotals::default()),
        }
    }
}

impl CycleManager for BookkeepingCycles {
    fn data_manager(&self) -> Option<&DataManager> {
        Some(&self.data)
    }

    fn run_training_cycle(&self, request: &TrainingRequest) -> Result<TrainingResults> {
        let train = request.train_data.as_deref().unwrap_or_default();
        if train.is_empty() {
            return Err(Error::InsufficientData("No training data provided".into()));
        }
        let batch = request.batch_size.unwrap_or(self.default_batch).max(1);
        let epochs = request.epochs.unwrap_or(1).max(1);
        let samples = train.len() as u64;

        let mut totals = self.totals.lock().unwrap_or_else(|p| p.into_inner());
        totals.cycles += 1;
        totals.samples += samples * u64::from(epochs);
        let loss = 1.0 / (1.0 + totals.cycles as f64);

        Ok(TrainingResults {
            epochs,
            batches: samples.div_ceil(batch) * u64::from(epochs),
            samples,
            train_loss: Some(loss),
            valid_loss: request
                .valid_data
                .as_ref()
                .filter(|v| !v.is_empty())
                .map(|_| loss * 1.1),
        })
    }

    fn state(&self) -> Value {
        let totals = self.totals.lock().unwrap_or_else(|p| p.into_inner());
        json!({ "cycles": totals.cycles, "samples": totals.samples })
    }

    fn restore(&self, state: &Value) -> Result<()> {
        let field = |name: &str| {
            state
                .get(name)
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::serialization("cycle_manager", format!("missing {name}")))
        };
        let restored = CycleTotals {
            cycles: field("cycles")?,
            samples: field("samples")?,
        };
        *self.totals.lock().unwrap_or_else(|p| p.into_inner()) = restored;
        Ok(())
    }
}

/// Asks one curiosity question and files it as a reflection.
pub struct ReflectiveDream {
    context: Arc<SystemContext>,
    curiosity: Arc<dyn CuriosityManager>,
}

impl DreamCycle for ReflectiveDream {
    fn run_dream_cycle(&self) -> Result<()> {
        let question = self.curiosity.generate_question()?;
        self.context.events().info(
            "dream_reflection",
            "Dream cycle reflected on a question",
            json!({ "question": question, "pressure": self.curiosity.pressure() }),
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct OfflineBackend {
    curiosity: Mutex<Option<Arc<dyn CuriosityManager>>>,
}

impl CuriosityBackend for OfflineBackend {
    fn create_curiosity_manager(&self, context: &Arc<SystemContext>) -> Result<Arc<dyn CuriosityManager>> {
        let manager: Arc<dyn CuriosityManager> = Arc::new(SeedCuriosity::from_config(context.config()));
        *self.curiosity.lock().unwrap_or_else(|p| p.into_inner()) = Some(manager.clone());
        Ok(manager)
    }

    fn create_cycle_manager(
        &self,
        context: &Arc<SystemContext>,
        _state_tracker: &Arc<StateTracker>,
        _curiosity: &Arc<dyn CuriosityManager>,
    ) -> Result<Arc<dyn CycleManager>> {
        let config = context.config();
        let provider: Arc<dyn DataProvider> =
            Arc::new(JsonlProvider::new(config.get_or("data_config.min_samples", 1)));
        Ok(Arc::new(BookkeepingCycles::new(
            DataManager::new(Some(provider)),
            config.get_or("training_config.batch_size", 32),
        )))
    }

    fn create_dream_cycle(&self, context: &Arc<SystemContext>) -> Option<Arc<dyn DreamCycle>> {
        if !context.config().get_or("dream_config.enabled", true) {
            return None;
        }
        let curiosity = self.curiosity.lock().unwrap_or_else(|p| p.into_inner()).clone()?;
        Some(Arc::new(ReflectiveDream {
            context: context.clone(),
            curiosity,
        }))
    }
}

/// Checks model sizes against `memory_config.max_memory_mb`, read live so
/// recovery adjustments take effect on the next check.
pub struct BudgetMemory {
    config: Arc<ConfigStore>,
    enabled: AtomicBool,
    checks: AtomicU64,
    last_usage: Mutex<Option<f64>>,
}

impl BudgetMemory {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            enabled: AtomicBool::new(false),
            checks: AtomicU64::new(0),
            last_usage: Mutex::new(None),
        }
    }

    fn budget_bytes(&self) -> Result<f64> {
        let mb: f64 = self.config.get_or("memory_config.max_memory_mb", 0.0);
        if mb <= 0.0 {
            return Err(Error::InvalidValue(format!("max_memory_mb must be positive, got {mb}")));
        }
        Ok(mb * 1024.0 * 1024.0)
    }
}

impl MemoryManager for BudgetMemory {
    fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stats(&self) -> Result<Map<String, Value>> {
        let mut stats = Map::new();
        stats.insert("enabled".into(), json!(self.is_enabled()));
        stats.insert("checks".into(), json!(self.checks.load(Ordering::SeqCst)));
        stats.insert("budget_bytes".into(), json!(self.budget_bytes()?));
        stats.insert(
            "last_usage".into(),
            json!(*self.last_usage.lock().unwrap_or_else(|p| p.into_inner())),
        );
        Ok(stats)
    }

    fn check_memory_health(&self, model_size: u64) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(true);
        }
        self.checks.fetch_add(1, Ordering::SeqCst);
        let usage = model_size as f64 / self.budget_bytes()?;
        *self.last_usage.lock().unwrap_or_else(|p| p.into_inner()) = Some(usage);
        if usage > 1.0 {
            return Err(Error::OutOfMemory(format!(
                "model needs {model_size} bytes, {:.0}% of budget",
                usage * 100.0
            )));
        }
        let threshold: f64 = self.config.get_or("memory_config.memory_threshold", 0.85);
        Ok(usage <= threshold)
    }
}

/// Every offline collaborator, configured from `context`.
pub fn collaborators(context: &SystemContext) -> Collaborators {
    let config = context.config();
    Collaborators {
        models: Arc::new(OfflineModelManager::from_config(config)),
        curiosity: Arc::new(OfflineBackend::default()),
        memory: Some(Arc::new(BudgetMemory::new(config.clone()))),
    }
}
