//! Configuration types for the Pistis engine

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PistisError, Result};
use crate::storage::StorageKind;

/// Default per-trial timeout (30 seconds)
pub const DEFAULT_TRIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call test configuration.
///
/// Passed to each runner/analyzer call; never stored with results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    /// Number of trials for consistency measurement (>= 1)
    pub n_trials: usize,

    /// Minimum consistency score to pass (0..1)
    pub consistency_threshold: f64,

    /// Minimum comparator confidence to pass accuracy (0..1)
    pub accuracy_threshold: f64,

    /// Use the injected semantic comparator when one is configured;
    /// otherwise fall back to exact (case-insensitive, trimmed) matching
    pub semantic_comparison: bool,

    /// Per-trial timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            n_trials: 5,
            consistency_threshold: 0.8,
            accuracy_threshold: 0.8,
            semantic_comparison: true,
            timeout: DEFAULT_TRIAL_TIMEOUT,
        }
    }
}

impl TestConfig {
    /// Set the number of trials
    pub fn with_trials(mut self, n_trials: usize) -> Self {
        self.n_trials = n_trials;
        self
    }

    /// Set the consistency threshold
    pub fn with_consistency_threshold(mut self, threshold: f64) -> Self {
        self.consistency_threshold = threshold;
        self
    }

    /// Set the accuracy threshold
    pub fn with_accuracy_threshold(mut self, threshold: f64) -> Self {
        self.accuracy_threshold = threshold;
        self
    }

    /// Set the per-trial timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate field ranges.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `n_trials` is zero or a threshold
    /// falls outside 0..=1.
    pub fn validate(&self) -> Result<()> {
        if self.n_trials == 0 {
            return Err(PistisError::Configuration(
                "n_trials must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("consistency_threshold", self.consistency_threshold),
            ("accuracy_threshold", self.accuracy_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PistisError::Configuration(format!(
                    "{} must be within 0..=1, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for retrieval-layer testing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Minimum retrieval precision to pass (0..1).
    ///
    /// A value of 0.0 always passes; this is the documented way to unlock
    /// the accuracy layer for agents without a retrieval stage.
    pub precision_min: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { precision_min: 0.7 }
    }
}

impl RetrievalConfig {
    /// Create with an explicit precision floor
    pub fn new(precision_min: f64) -> Self {
        Self { precision_min }
    }
}

/// Top-level engine configuration loaded from file and environment
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PistisConfig {
    /// Default per-call test configuration
    #[serde(default)]
    pub test: TestConfig,

    /// Default retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Metrics storage backend selection
    #[serde(default)]
    pub storage: StorageKind,
}

impl PistisConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (pistis.toml or path from PISTIS_CONFIG_PATH)
    /// 3. Environment variable overrides
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is invalid.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Toml},
        };

        let mut figment = Figment::new()
            .merge(Toml::file("pistis.toml"))
            .merge(Env::prefixed("PISTIS_").split("_"));

        if let Ok(path) = std::env::var("PISTIS_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: PistisConfig = figment.extract().map_err(|e| {
            PistisError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.test.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Toml},
        };

        let config: PistisConfig = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                PistisError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.test.validate()?;
        Ok(config)
    }
}
