//! Run configuration loaded from TOML, and the run context threaded through
//! every component constructor.

use crate::acquisition::{Objective, StrategyKind};
use crate::constraints::CompositionRules;
use crate::domain::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QalConfig {
    /// Loop settings (`[loop]` in TOML).
    #[serde(rename = "loop", default)]
    pub run: LoopConfig,

    #[serde(default)]
    pub surrogate: SurrogateConfig,

    #[serde(default)]
    pub acquisition: AcquisitionConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub oracle: OracleConfig,

    /// Optional composition pre-filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<CompositionRules>,

    #[serde(default)]
    pub output: OutputConfig,
}

/// Loop controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Seed for every random draw in the run.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Number of labeled rows placed in the initial training set.
    #[serde(default = "default_seed_size")]
    pub seed_size: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub strategy: StrategyKind,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,

    /// Per-round wait for oracle results. 0 polls exactly once.
    #[serde(default)]
    pub oracle_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_min_fit_examples")]
    pub min_fit_examples: usize,

    /// Size of the held-out evaluation slice.
    #[serde(default = "default_eval_size")]
    pub eval_size: usize,

    /// Rounds a failed candidate sits out before it may be selected again.
    #[serde(default = "default_cooldown_rounds")]
    pub cooldown_rounds: u64,

    /// Shrink the last batch to the remaining pool instead of aborting.
    #[serde(default = "default_true")]
    pub shrink_final_batch: bool,
}

fn default_seed() -> u64 {
    42
}

fn default_seed_size() -> usize {
    50
}

fn default_batch_size() -> usize {
    25
}

fn default_max_iterations() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_min_fit_examples() -> usize {
    5
}

fn default_eval_size() -> usize {
    200
}

fn default_cooldown_rounds() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            seed_size: default_seed_size(),
            batch_size: default_batch_size(),
            strategy: StrategyKind::default(),
            max_iterations: default_max_iterations(),
            oracle_timeout_ms: 0,
            poll_interval_ms: default_poll_interval_ms(),
            min_fit_examples: default_min_fit_examples(),
            eval_size: default_eval_size(),
            cooldown_rounds: default_cooldown_rounds(),
            shrink_final_batch: true,
        }
    }
}

impl LoopConfig {
    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Gaussian-process hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurrogateConfig {
    #[serde(default = "default_unit")]
    pub length_scale: f64,

    #[serde(default = "default_unit")]
    pub signal_variance: f64,

    /// White-noise variance added to the kernel diagonal.
    #[serde(default = "default_noise")]
    pub noise: f64,
}

fn default_unit() -> f64 {
    1.0
}

fn default_noise() -> f64 {
    1e-6
}

impl Default for SurrogateConfig {
    fn default() -> Self {
        Self {
            length_scale: default_unit(),
            signal_variance: default_unit(),
            noise: default_noise(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default)]
    pub objective: Objective,

    /// Exploration margin for expected improvement.
    #[serde(default)]
    pub xi: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Labels a non-adaptive baseline needs; denominator of the efficiency gain.
    #[serde(default = "default_baseline_label_budget")]
    pub baseline_label_budget: usize,

    /// RMSE at which `labels_to_target` is recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_rmse: Option<f64>,
}

fn default_baseline_label_budget() -> usize {
    1000
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            baseline_label_budget: default_baseline_label_budget(),
            target_rmse: None,
        }
    }
}

/// Which oracle backend a run talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleKind {
    /// In-memory backend answering from the dataset's labels.
    #[default]
    Simulated,
    /// File-based DFT handoff directories.
    Handoff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default)]
    pub kind: OracleKind,

    /// Evaluation settings folded into every settings fingerprint.
    #[serde(default = "default_settings")]
    pub settings: serde_json::Value,

    /// Simulated: polls before a request completes.
    #[serde(default = "default_completion_polls")]
    pub completion_polls: u32,

    /// Simulated: probability that an evaluation fails.
    #[serde(default)]
    pub failure_rate: f64,

    /// Handoff: where submission packages are written.
    #[serde(default = "default_input_root")]
    pub input_root: PathBuf,

    /// Handoff: where the DFT workflow drops results.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,

    /// Handoff: recorded as `source_dataset` in package metadata.
    #[serde(default = "default_source_dataset")]
    pub source_dataset: String,
}

fn default_settings() -> serde_json::Value {
    serde_json::json!({})
}

fn default_completion_polls() -> u32 {
    1
}

fn default_input_root() -> PathBuf {
    PathBuf::from("handoff/inputs")
}

fn default_output_root() -> PathBuf {
    PathBuf::from("handoff/outputs")
}

fn default_source_dataset() -> String {
    "local".to_string()
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            kind: OracleKind::default(),
            settings: default_settings(),
            completion_polls: default_completion_polls(),
            failure_rate: 0.0,
            input_root: default_input_root(),
            output_root: default_output_root(),
            source_dataset: default_source_dataset(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Run reports land in `<dir>/<run_id>/`.
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

/// Annotated example configuration printed by `qal example`.
pub const EXAMPLE_CONFIG: &str = r#"[loop]
seed = 42
seed_size = 50
batch_size = 25
# random | uncertainty | expected_improvement
strategy = "uncertainty"
max_iterations = 10
oracle_timeout_ms = 0
poll_interval_ms = 50
min_fit_examples = 5
eval_size = 200
cooldown_rounds = 1
shrink_final_batch = true

[surrogate]
length_scale = 1.0
signal_variance = 1.0
noise = 1e-6

[acquisition]
# maximize | minimize
objective = "maximize"
xi = 0.0

[metrics]
baseline_label_budget = 1000
# target_rmse = 0.05

[oracle]
# simulated | handoff
kind = "simulated"
completion_polls = 1
failure_rate = 0.0
input_root = "handoff/inputs"
output_root = "handoff/outputs"

[oracle.settings]
code = "QuantumESPRESSO"
functional = "PBE"
kpoint_density = 0.2

# [constraints]
# allowed_elements = ["Al", "Co", "Cr", "Fe", "Ni"]
# min_unique_elements = 4
# max_unique_elements = 6
# min_atomic_fraction = 0.05
# max_atomic_fraction = 0.35

[output]
dir = "runs"
"#;

impl QalConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: QalConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: QalConfig = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no run could succeed with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };
        let run = &self.run;

        if run.batch_size == 0 {
            return invalid("loop.batch_size must be at least 1".to_string());
        }
        if run.max_iterations == 0 {
            return invalid("loop.max_iterations must be at least 1".to_string());
        }
        if run.min_fit_examples == 0 {
            return invalid("loop.min_fit_examples must be at least 1".to_string());
        }
        if run.seed_size < run.min_fit_examples {
            return invalid(format!(
                "loop.seed_size ({}) is smaller than loop.min_fit_examples ({})",
                run.seed_size, run.min_fit_examples
            ));
        }
        if run.eval_size == 0 {
            return invalid("loop.eval_size must be at least 1".to_string());
        }
        if run.oracle_timeout_ms > 0 && run.poll_interval_ms == 0 {
            return invalid("loop.poll_interval_ms must be positive when a timeout is set".to_string());
        }

        let s = &self.surrogate;
        if !(s.length_scale > 0.0 && s.length_scale.is_finite()) {
            return invalid(format!("surrogate.length_scale must be positive, got {}", s.length_scale));
        }
        if !(s.signal_variance > 0.0 && s.signal_variance.is_finite()) {
            return invalid(format!(
                "surrogate.signal_variance must be positive, got {}",
                s.signal_variance
            ));
        }
        if !(s.noise >= 0.0 && s.noise.is_finite()) {
            return invalid(format!("surrogate.noise must be non-negative, got {}", s.noise));
        }

        if !self.acquisition.xi.is_finite() {
            return invalid("acquisition.xi must be finite".to_string());
        }

        if self.metrics.baseline_label_budget == 0 {
            return invalid("metrics.baseline_label_budget must be at least 1".to_string());
        }
        if let Some(target) = self.metrics.target_rmse {
            if !(target > 0.0 && target.is_finite()) {
                return invalid(format!("metrics.target_rmse must be positive, got {}", target));
            }
        }

        if !(0.0..=1.0).contains(&self.oracle.failure_rate) {
            return invalid(format!(
                "oracle.failure_rate must lie in [0, 1], got {}",
                self.oracle.failure_rate
            ));
        }
        if !self.oracle.settings.is_object() {
            return invalid("oracle.settings must be a table".to_string());
        }

        if let Some(rules) = &self.constraints {
            if rules.min_unique_elements > rules.max_unique_elements {
                return invalid("constraints.min_unique_elements exceeds max_unique_elements".to_string());
            }
            if rules.min_atomic_fraction > rules.max_atomic_fraction {
                return invalid("constraints.min_atomic_fraction exceeds max_atomic_fraction".to_string());
            }
        }
        Ok(())
    }
}

/// Explicit per-run context: identity, seed, output location and settings.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub seed: u64,
    pub output_dir: PathBuf,
    pub config: QalConfig,
}

impl RunContext {
    /// Build a context; a missing `run_id` gets a fresh UUID.
    pub fn new(config: QalConfig, run_id: Option<String>) -> Self {
        Self {
            run_id: run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            seed: config.run.seed,
            output_dir: config.output.dir.clone(),
            config,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Directory holding this run's report.
    pub fn run_dir(&self) -> PathBuf {
        self.output_dir.join(&self.run_id)
    }
}
