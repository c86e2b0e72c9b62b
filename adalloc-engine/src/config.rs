//! Configuration types for the allocation engine.
//!
//! Every tunable of the engine lives here and is injected once when the
//! [`AllocationEngine`](crate::AllocationEngine) is constructed. Sections map
//! one-to-one onto the TOML file:
//!
//! ```toml
//! [bandit]
//! roas_weight = 1.0
//!
//! [decay]
//! interval_secs = 3600
//! factor = 0.97
//!
//! [drift]
//! window_size = 1000
//! variance_multiplier = 1.5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AllocError, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub decay: DecayConfig,
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default)]
    pub learner: LearnerConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate TOML configuration text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| AllocError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/adalloc/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("adalloc").join("config.toml"))
    }

    /// Load `path` if given, else the default file if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_path() {
                Some(default) if default.exists() => Self::load(default),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| AllocError::Config(e.to_string()))
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let bandit = &self.bandit;
        if !bandit.roas_weight.is_finite() || bandit.roas_weight < 0.0 {
            return Err(config_err("bandit.roas_weight must be finite and >= 0"));
        }

        let decay = &self.decay;
        if !(decay.factor > 0.0 && decay.factor <= 1.0) {
            return Err(config_err("decay.factor must be in (0, 1]"));
        }
        if decay.interval_secs == 0 {
            return Err(config_err("decay.interval_secs must be > 0"));
        }

        let drift = &self.drift;
        if drift.window_size == 0 || drift.min_fill == 0 || drift.check_interval == 0 {
            return Err(config_err(
                "drift.window_size, drift.min_fill and drift.check_interval must be > 0",
            ));
        }
        if drift.min_fill > drift.window_size {
            return Err(config_err("drift.min_fill cannot exceed drift.window_size"));
        }
        if !drift.variance_multiplier.is_finite() || drift.variance_multiplier <= 1.0 {
            return Err(config_err("drift.variance_multiplier must be > 1"));
        }

        let learner = &self.learner;
        if !(learner.learning_rate > 0.0 && learner.learning_rate.is_finite()) {
            return Err(config_err("learner.learning_rate must be finite and > 0"));
        }
        if !(learner.learning_rate_cap >= learner.learning_rate
            && learner.learning_rate_cap.is_finite())
        {
            return Err(config_err(
                "learner.learning_rate_cap must be finite and >= learner.learning_rate",
            ));
        }
        if !(learner.drift_weight_decay > 0.0 && learner.drift_weight_decay <= 1.0) {
            return Err(config_err("learner.drift_weight_decay must be in (0, 1]"));
        }
        if learner.queue_capacity == 0 {
            return Err(config_err("learner.queue_capacity must be > 0"));
        }

        let evaluator = &self.evaluator;
        if !evaluator.prediction_threshold.is_finite() {
            return Err(config_err("evaluator.prediction_threshold must be finite"));
        }
        if !evaluator.promotion_threshold_pct.is_finite() {
            return Err(config_err("evaluator.promotion_threshold_pct must be finite"));
        }
        if evaluator.batch_size == 0 || evaluator.interval_secs == 0 {
            return Err(config_err(
                "evaluator.batch_size and evaluator.interval_secs must be > 0",
            ));
        }

        if self.storage.max_retries == 0 {
            return Err(config_err("storage.max_retries must be > 0"));
        }

        Ok(())
    }
}

fn config_err(msg: &str) -> AllocError {
    AllocError::Config(msg.to_string())
}

/// Variant selection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditConfig {
    /// Weight of the ROAS term in the default scorer (0 disables it)
    #[serde(default = "default_roas_weight")]
    pub roas_weight: f64,
}

fn default_roas_weight() -> f64 {
    1.0
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            roas_weight: default_roas_weight(),
        }
    }
}

/// Periodic statistics decay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayConfig {
    /// Whether the background decay task runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between decay passes
    #[serde(default = "default_decay_interval_secs")]
    pub interval_secs: u64,
    /// Multiplier applied to alpha, beta, spend and revenue
    #[serde(default = "default_decay_factor")]
    pub factor: f64,
}

fn default_true() -> bool {
    true
}

fn default_decay_interval_secs() -> u64 {
    3600
}

fn default_decay_factor() -> f64 {
    0.97
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_decay_interval_secs(),
            factor: default_decay_factor(),
        }
    }
}

impl DecayConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Loss-variance drift heuristic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Number of recent losses kept in the window
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Minimum losses before drift can be reported
    #[serde(default = "default_min_fill")]
    pub min_fill: usize,
    /// Losses added between two variance checks
    #[serde(default = "default_check_interval")]
    pub check_interval: usize,
    /// Variance growth ratio that counts as drift
    #[serde(default = "default_variance_multiplier")]
    pub variance_multiplier: f64,
}

fn default_window_size() -> usize {
    1000
}

fn default_min_fill() -> usize {
    50
}

fn default_check_interval() -> usize {
    50
}

fn default_variance_multiplier() -> f64 {
    1.5
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            min_fill: default_min_fill(),
            check_interval: default_check_interval(),
            variance_multiplier: default_variance_multiplier(),
        }
    }
}

/// Online learner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerConfig {
    /// Initial gradient step size
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Upper bound for drift-boosted learning rates
    #[serde(default = "default_learning_rate_cap")]
    pub learning_rate_cap: f64,
    /// Multiplier applied to every weight when drift fires
    #[serde(default = "default_drift_weight_decay")]
    pub drift_weight_decay: f64,
    /// Pending events buffered in front of the learner
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_learning_rate() -> f64 {
    0.01
}

fn default_learning_rate_cap() -> f64 {
    0.1
}

fn default_drift_weight_decay() -> f64 {
    0.9
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            learning_rate_cap: default_learning_rate_cap(),
            drift_weight_decay: default_drift_weight_decay(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Champion/challenger evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Whether the background evaluation cycle runs
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between evaluation cycles
    #[serde(default = "default_evaluation_interval_secs")]
    pub interval_secs: u64,
    /// Predictions above this value receive the row's revenue
    #[serde(default = "default_prediction_threshold")]
    pub prediction_threshold: f64,
    /// Minimum ROAS improvement in percent required to promote
    #[serde(default = "default_promotion_threshold_pct")]
    pub promotion_threshold_pct: f64,
    /// Test-set rows scored between cancellation checks
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_evaluation_interval_secs() -> u64 {
    86_400
}

fn default_prediction_threshold() -> f64 {
    0.5
}

fn default_promotion_threshold_pct() -> f64 {
    5.0
}

fn default_batch_size() -> usize {
    1024
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_evaluation_interval_secs(),
            prediction_threshold: default_prediction_threshold(),
            promotion_threshold_pct: default_promotion_threshold_pct(),
            batch_size: default_batch_size(),
        }
    }
}

impl EvaluatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Persistence boundary settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding snapshots and the audit log
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Append every learning event to the audit log
    #[serde(default = "default_true")]
    pub audit_log: bool,
    /// Attempts per write before giving up on a transient error
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay, doubled on every further attempt
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("adalloc")
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    50
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            audit_log: true,
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
        }
    }
}

impl StorageConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join("events.jsonl")
    }
}
