//! File-based metrics storage

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::runner::TestResult;
use crate::storage::MetricsStorage;

/// File-backed storage: one JSON array of TestResults, timestamps as
/// ISO-8601 strings.
///
/// Every save rewrites the whole file (read-modify-write) under a mutex;
/// acceptable for low-volume test telemetry, not for high write rates. A
/// corrupt or missing file degrades to an empty history with a warning.
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    /// Create a file storage over the given path.
    ///
    /// The file and its parent directories are created lazily on first save.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// The path this storage reads and writes
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn load_all(&self) -> Vec<TestResult> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(results) => results,
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "result history file is corrupt, starting from empty history"
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "result history file is unreadable, starting from empty history"
                );
                Vec::new()
            }
        }
    }

    async fn write_all(&self, results: &[TestResult]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_string_pretty(results)?;
        let mut file = tokio::fs::File::create(&self.path).await?;
        file.write_all(json.as_bytes()).await?;
        // Durable before the save returns
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl MetricsStorage for FileStorage {
    async fn save(&self, result: &TestResult) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut results = self.load_all().await;
        results.push(result.clone());
        self.write_all(&results).await
    }

    async fn get_history(&self, test_id: &str, days: i64) -> Result<Vec<TestResult>> {
        let _guard = self.lock.lock().await;
        let cutoff = Utc::now() - Duration::days(days);

        let mut history: Vec<TestResult> = self
            .load_all()
            .await
            .into_iter()
            .filter(|r| r.test_id == test_id && r.timestamp >= cutoff)
            .collect();

        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(history)
    }
}
