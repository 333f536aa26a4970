use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::StateStore;
use stepwise_core::types::{StepRecord, TranscriptArtifacts, TranscriptEntry};

/// State store backed by a single SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> StepwiseError {
    StepwiseError::Database(e.to_string())
}

fn to_units(value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| StepwiseError::Database(format!("stored usage {} is negative", value)))
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StepwiseError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        Self::init(conn, Some(path))
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<&Path>) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS step_records (
                 step_id TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 record_json TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS budget_periods (
                 period_key TEXT PRIMARY KEY,
                 used_units INTEGER NOT NULL DEFAULT 0
             );

             CREATE TABLE IF NOT EXISTS transcripts (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 step_id TEXT NOT NULL,
                 entry_json TEXT NOT NULL,
                 timestamp TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_transcripts_step
                 ON transcripts(step_id, id);",
        )
        .map_err(db_err)?;

        if let Some(path) = path {
            debug!(path = %path.display(), "SQLite state store opened");
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StepwiseError::Database(e.to_string()))
    }

    fn load(&self, step_id: &str) -> Result<Option<StepRecord>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM step_records WHERE step_id = ?1",
                params![step_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        json.map(|j| serde_json::from_str(&j).map_err(StepwiseError::from))
            .transpose()
    }

    fn save(&self, record: &StepRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO step_records (step_id, status, record_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(step_id) DO UPDATE SET
                 status = excluded.status,
                 record_json = excluded.record_json,
                 updated_at = excluded.updated_at",
            params![
                record.step_id,
                record.status.as_str(),
                json,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn all(&self) -> Result<Vec<StepRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT record_json FROM step_records ORDER BY step_id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut records = Vec::new();
        for json in rows {
            records.push(serde_json::from_str(&json.map_err(db_err)?)?);
        }
        Ok(records)
    }

    fn delete(&self, step_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM step_records WHERE step_id = ?1",
                params![step_id],
            )
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    fn usage(&self, period_key: &str) -> Result<u64> {
        let conn = self.lock()?;
        let used: Option<i64> = conn
            .query_row(
                "SELECT used_units FROM budget_periods WHERE period_key = ?1",
                params![period_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        to_units(used.unwrap_or(0))
    }

    fn increment(&self, period_key: &str, delta: u64) -> Result<u64> {
        let delta = i64::try_from(delta).map_err(|_| {
            StepwiseError::Database(format!("usage increment {} out of range", delta))
        })?;
        let conn = self.lock()?;
        let total: i64 = conn
            .query_row(
                "INSERT INTO budget_periods (period_key, used_units) VALUES (?1, ?2)
                 ON CONFLICT(period_key) DO UPDATE SET used_units = used_units + excluded.used_units
                 RETURNING used_units",
                params![period_key, delta],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        to_units(total)
    }

    fn append_transcript(&self, entry: &TranscriptEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO transcripts (step_id, entry_json, timestamp) VALUES (?1, ?2, ?3)",
            params![entry.step_id, json, entry.timestamp.to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn latest_response(&self, step_id: &str) -> Result<Option<String>> {
        Ok(self
            .transcripts(step_id)?
            .into_iter()
            .rev()
            .find(|e| e.succeeded())
            .map(|e| e.response))
    }

    /// All transcript entries recorded for a step, oldest first.
    pub fn transcripts(&self, step_id: &str) -> Result<Vec<TranscriptEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT entry_json FROM transcripts WHERE step_id = ?1 ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![step_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut entries = Vec::new();
        for json in rows {
            entries.push(serde_json::from_str(&json.map_err(db_err)?)?);
        }
        Ok(entries)
    }
}

impl StateStore for SqliteStore {
    fn get(&self, step_id: &str) -> BoxFuture<'_, Result<Option<StepRecord>>> {
        let step_id = step_id.to_string();
        Box::pin(async move { self.load(&step_id) })
    }

    fn put(&self, record: StepRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.save(&record) })
    }

    fn records(&self) -> BoxFuture<'_, Result<Vec<StepRecord>>> {
        Box::pin(async move { self.all() })
    }

    fn remove(&self, step_id: &str) -> BoxFuture<'_, Result<bool>> {
        let step_id = step_id.to_string();
        Box::pin(async move { self.delete(&step_id) })
    }

    fn current_period_usage(&self, period_key: &str) -> BoxFuture<'_, Result<u64>> {
        let period_key = period_key.to_string();
        Box::pin(async move { self.usage(&period_key) })
    }

    fn add_period_usage(&self, period_key: &str, delta: u64) -> BoxFuture<'_, Result<u64>> {
        let period_key = period_key.to_string();
        Box::pin(async move { self.increment(&period_key, delta) })
    }

    fn record_transcript(
        &self,
        entry: &TranscriptEntry,
    ) -> BoxFuture<'_, Result<TranscriptArtifacts>> {
        let entry = entry.clone();
        Box::pin(async move {
            self.append_transcript(&entry)?;
            // Prompt and response live in the transcripts table, not on disk
            Ok(TranscriptArtifacts::default())
        })
    }

    fn response(&self, step_id: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let step_id = step_id.to_string();
        Box::pin(async move { self.latest_response(&step_id) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::types::StepStatus;

    fn entry(step_id: &str, response: &str) -> TranscriptEntry {
        TranscriptEntry {
            step_id: step_id.into(),
            prompt: "p".into(),
            response: response.into(),
            error: None,
            consumed_units: 1,
            duration_ms: 1,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_put_replaces_record() {
        let store = SqliteStore::in_memory().unwrap();
        store.put(StepRecord::pending("a")).await.unwrap();
        assert_eq!(
            store.get("a").await.unwrap().unwrap().status,
            StepStatus::Pending
        );

        let mut record = StepRecord::pending("a");
        record.status = StepStatus::Failed;
        record.error = Some("HTTP 400".into());
        store.put(record).await.unwrap();

        let loaded = store.get("a").await.unwrap().unwrap();
        assert_eq!(loaded.status, StepStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("HTTP 400"));
        assert_eq!(store.records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_period_increment() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.current_period_usage("2026-03").await.unwrap(), 0);
        assert_eq!(store.add_period_usage("2026-03", 10).await.unwrap(), 10);
        assert_eq!(store.add_period_usage("2026-03", 5).await.unwrap(), 15);
        assert_eq!(store.current_period_usage("2026-04").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transcripts_in_order() {
        let store = SqliteStore::in_memory().unwrap();
        store.record_transcript(&entry("a", "first")).await.unwrap();
        store.record_transcript(&entry("b", "other")).await.unwrap();
        let artifacts = store.record_transcript(&entry("a", "second")).await.unwrap();
        assert!(artifacts.prompt_path.is_none());

        let entries = store.transcripts("a").unwrap();
        let responses: Vec<_> = entries.iter().map(|e| e.response.as_str()).collect();
        assert_eq!(responses, vec!["first", "second"]);
        assert_eq!(store.response("a").await.unwrap().as_deref(), Some("second"));
        assert!(store.response("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_increment_out_of_range() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store.add_period_usage("p", u64::MAX).await.unwrap_err();
        assert!(matches!(err, StepwiseError::Database(_)));
        assert_eq!(store.current_period_usage("p").await.unwrap(), 0);

        let max = i64::MAX as u64;
        assert_eq!(store.add_period_usage("p", max).await.unwrap(), max);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = SqliteStore::in_memory().unwrap();
        store.put(StepRecord::pending("a")).await.unwrap();
        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.add_period_usage("p", 9).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.current_period_usage("p").await.unwrap(), 9);
    }
}
