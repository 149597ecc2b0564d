//! Embedded SQLite metrics storage

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{PistisError, Result};
use crate::runner::TestResult;
use crate::storage::MetricsStorage;

/// Embedded database backend over SQLite.
///
/// Each record is stored as its JSON body alongside indexed `test_id` and
/// `timestamp` columns. Timestamps use a fixed-width RFC 3339 form so the
/// column orders and compares lexicographically.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) a database at `path`.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the file cannot be opened as a database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    /// Open a private in-memory database (tests and ephemeral sessions)
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS results (
                record_id TEXT PRIMARY KEY,
                test_id   TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                body      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_results_test_time
                ON results (test_id, timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Delete records older than `cutoff`; returns the number removed.
    ///
    /// The explicit retention hook: records are append-only otherwise.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM results WHERE timestamp < ?1",
            [timestamp_key(&cutoff)],
        )?;
        Ok(removed)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PistisError::Storage("database lock poisoned".to_string()))
    }
}

fn timestamp_key(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl MetricsStorage for SqliteStorage {
    async fn save(&self, result: &TestResult) -> Result<()> {
        let body = serde_json::to_string(result)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO results (record_id, test_id, timestamp, body)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                result.record_id.to_string(),
                result.test_id,
                timestamp_key(&result.timestamp),
                body
            ],
        )?;
        Ok(())
    }

    async fn get_history(&self, test_id: &str, days: i64) -> Result<Vec<TestResult>> {
        let cutoff = timestamp_key(&(Utc::now() - Duration::days(days)));
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT body FROM results
             WHERE test_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp DESC",
        )?;
        let rows = stmt.query_map(rusqlite::params![test_id, cutoff], |row| {
            row.get::<_, String>(0)
        })?;

        let mut history = Vec::new();
        for body in rows {
            history.push(serde_json::from_str(&body?)?);
        }
        Ok(history)
    }
}
