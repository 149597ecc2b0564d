//! Metrics persistence and degradation detection
//!
//! TestResults are persisted append-only through the [`MetricsStorage`]
//! capability. Backends are selected explicitly through [`StorageKind`];
//! business logic never sniffs file extensions or probes for optional
//! dependencies.

pub mod file;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::runner::TestResult;

pub use file::FileStorage;
pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

/// Days of history considered "recent" for degradation detection
const RECENT_WINDOW_DAYS: i64 = 7;
/// Days of history considered the baseline for degradation detection
const BASELINE_WINDOW_DAYS: i64 = 90;
/// Minimum recent samples before degradation detection produces a signal
const MIN_RECENT_SAMPLES: usize = 3;
/// Minimum baseline samples before degradation detection produces a signal
const MIN_BASELINE_SAMPLES: usize = 10;

/// Severity of a degradation alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Info,
    /// Consistency dropped more than 0.1 below baseline
    Warning,
    /// Consistency dropped more than 0.2 below baseline
    Critical,
}

/// A detected drop in recent consistency relative to the historical baseline.
///
/// Derived from history on demand; never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationAlert {
    /// Test id the alert concerns
    pub test_id: String,
    /// Human-readable description of the drop
    pub message: String,
    /// Alert severity
    pub severity: Severity,
}

/// Metrics storage backend selection.
///
/// An explicit, statically-typed strategy: the caller names the backend, the
/// factory builds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageKind {
    /// In-process only; no durability beyond the process lifetime
    Memory,
    /// JSON file, rewritten in full on every save. Fine for low-volume test
    /// telemetry, wrong for high write rates.
    File {
        /// Path to the JSON history file
        path: PathBuf,
    },
    /// Embedded SQLite database
    Embedded {
        /// Path to the database file
        path: PathBuf,
    },
}

impl Default for StorageKind {
    fn default() -> Self {
        StorageKind::Memory
    }
}

/// Trait for test-result storage backends.
///
/// All backends satisfy the same contract: append-only saves, time-windowed
/// history newest-first, and identical degradation detection.
#[async_trait]
pub trait MetricsStorage: Send + Sync {
    /// Append a result. Durable before return for file/DB backends.
    async fn save(&self, result: &TestResult) -> Result<()>;

    /// All results for `test_id` with `timestamp >= now - days`, newest-first
    async fn get_history(&self, test_id: &str, days: i64) -> Result<Vec<TestResult>>;

    /// Compare mean consistency over the last 7 days against the last 90.
    ///
    /// Returns `Ok(None)` with fewer than 3 recent or 10 baseline samples:
    /// insufficient data is a legitimate, frequent state, not an error.
    /// A drop greater than 0.2 is critical, greater than 0.1 a warning.
    async fn detect_degradation(&self, test_id: &str) -> Result<Option<DegradationAlert>> {
        let recent = self.get_history(test_id, RECENT_WINDOW_DAYS).await?;
        let baseline = self.get_history(test_id, BASELINE_WINDOW_DAYS).await?;

        let recent_scores: Vec<f64> = recent.iter().filter_map(|r| r.consistency).collect();
        let baseline_scores: Vec<f64> =
            baseline.iter().filter_map(|r| r.consistency).collect();

        if recent_scores.len() < MIN_RECENT_SAMPLES
            || baseline_scores.len() < MIN_BASELINE_SAMPLES
        {
            return Ok(None);
        }

        let recent_avg = recent_scores.iter().sum::<f64>() / recent_scores.len() as f64;
        let baseline_avg =
            baseline_scores.iter().sum::<f64>() / baseline_scores.len() as f64;
        let delta = baseline_avg - recent_avg;

        let severity = if delta > 0.2 {
            Severity::Critical
        } else if delta > 0.1 {
            Severity::Warning
        } else {
            return Ok(None);
        };

        tracing::warn!(
            test_id,
            baseline_avg,
            recent_avg,
            ?severity,
            "consistency degradation detected"
        );

        Ok(Some(DegradationAlert {
            test_id: test_id.to_string(),
            message: format!(
                "Mean consistency dropped from {:.2} (90-day baseline) to {:.2} \
                 (last 7 days).",
                baseline_avg, recent_avg
            ),
            severity,
        }))
    }

    /// Flush and release resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the storage backend named by `kind`.
///
/// # Errors
///
/// Returns a storage error when the backend cannot be opened (for example an
/// unopenable database path).
pub fn create_storage(kind: &StorageKind) -> Result<Arc<dyn MetricsStorage>> {
    Ok(match kind {
        StorageKind::Memory => Arc::new(InMemoryStorage::new()),
        StorageKind::File { path } => Arc::new(FileStorage::new(path.clone())),
        StorageKind::Embedded { path } => Arc::new(SqliteStorage::open(path)?),
    })
}

/// Build the named backend, falling back to in-memory storage when it cannot
/// be opened.
///
/// Historical trend data is lost in the fallback, but the current run's
/// pass/fail results stay visible.
pub fn create_storage_or_fallback(kind: &StorageKind) -> Arc<dyn MetricsStorage> {
    match create_storage(kind) {
        Ok(storage) => storage,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "storage backend unavailable, falling back to in-memory storage"
            );
            Arc::new(InMemoryStorage::new())
        }
    }
}
