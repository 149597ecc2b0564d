//! In-memory metrics storage

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::runner::TestResult;
use crate::storage::MetricsStorage;

/// In-memory storage backend: process lifetime only, no durability.
///
/// The default backend and the fallback when a durable backend cannot be
/// opened.
pub struct InMemoryStorage {
    results: Arc<RwLock<HashMap<String, Vec<TestResult>>>>,
}

impl InMemoryStorage {
    /// Create a new in-memory storage
    pub fn new() -> Self {
        Self {
            results: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsStorage for InMemoryStorage {
    async fn save(&self, result: &TestResult) -> Result<()> {
        let mut storage = self.results.write().await;
        storage
            .entry(result.test_id.clone())
            .or_default()
            .push(result.clone());
        Ok(())
    }

    async fn get_history(&self, test_id: &str, days: i64) -> Result<Vec<TestResult>> {
        let storage = self.results.read().await;
        let cutoff = Utc::now() - Duration::days(days);

        let mut history: Vec<TestResult> = storage
            .get(test_id)
            .map(|results| {
                results
                    .iter()
                    .filter(|r| r.timestamp >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{TestLayer, TestStatus};

    #[tokio::test]
    async fn test_history_is_windowed_and_newest_first() {
        let storage = InMemoryStorage::new();

        let old = TestResult::new("t", TestLayer::Accuracy, TestStatus::Pass)
            .with_timestamp(Utc::now() - Duration::days(10));
        let yesterday = TestResult::new("t", TestLayer::Accuracy, TestStatus::Fail)
            .with_timestamp(Utc::now() - Duration::days(1));
        let now = TestResult::new("t", TestLayer::Accuracy, TestStatus::Pass);

        storage.save(&old).await.unwrap();
        storage.save(&now).await.unwrap();
        storage.save(&yesterday).await.unwrap();

        let history = storage.get_history("t", 7).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].record_id, now.record_id);
        assert_eq!(history[1].record_id, yesterday.record_id);

        let all = storage.get_history("t", 30).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_test_id_yields_empty_history() {
        let storage = InMemoryStorage::new();
        assert!(storage.get_history("nope", 7).await.unwrap().is_empty());
    }
}
