//! Execution-log repository.
//!
//! The strategy writes one row per successful submission and reads the
//! latest row back on the next fire to seed the yield computation. The trait
//! is the seam; the SQLite store is the shipped implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionLogRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub chain_id: u64,
    pub sub_account_address: String,
    /// Opaque JSON; the strategy decodes it into its typed metadata shape.
    pub metadata: serde_json::Value,
    pub message: String,
    pub output_txn_hash: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ExecutionLogRepo: Send + Sync {
    async fn latest_by_sub_id(
        &self,
        sub_id: Uuid,
    ) -> anyhow::Result<Option<ExecutionLogRecord>>;

    async fn insert(&self, record: &ExecutionLogRecord) -> anyhow::Result<()>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS execution_logs (
    id TEXT PRIMARY KEY,
    sub_id TEXT NOT NULL,
    chain_id INTEGER NOT NULL,
    subaccount_address TEXT NOT NULL,
    metadata TEXT NOT NULL,
    message TEXT NOT NULL,
    output_txn TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_execution_logs_sub_created
    ON execution_logs (sub_id, created_at DESC);
";

#[derive(Clone)]
pub struct SqliteLogStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLogStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionLogRecord> {
    let id: String = row.get(0)?;
    let sub_id: String = row.get(1)?;
    let chain_id: i64 = row.get(2)?;
    let sub_account_address: String = row.get(3)?;
    let metadata: String = row.get(4)?;
    let message: String = row.get(5)?;
    let output_txn_hash: String = row.get(6)?;
    let created_at: String = row.get(7)?;

    Ok(ExecutionLogRecord {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        subscription_id: Uuid::parse_str(&sub_id).unwrap_or_default(),
        chain_id: chain_id.max(0) as u64,
        sub_account_address,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        message,
        output_txn_hash,
        created_at: created_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[async_trait]
impl ExecutionLogRepo for SqliteLogStore {
    async fn latest_by_sub_id(
        &self,
        sub_id: Uuid,
    ) -> anyhow::Result<Option<ExecutionLogRecord>> {
        let store = self.clone();
        let record = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let conn = store.lock();
            let record = conn
                .query_row(
                    "SELECT id, sub_id, chain_id, subaccount_address, metadata, message, output_txn, created_at
                     FROM execution_logs WHERE sub_id = ?1
                     ORDER BY created_at DESC LIMIT 1",
                    params![sub_id.to_string()],
                    row_to_record,
                )
                .optional()?;
            Ok(record)
        })
        .await??;
        Ok(record)
    }

    async fn insert(&self, record: &ExecutionLogRecord) -> anyhow::Result<()> {
        let store = self.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = store.lock();
            conn.execute(
                "INSERT INTO execution_logs
                     (id, sub_id, chain_id, subaccount_address, metadata, message, output_txn, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id.to_string(),
                    record.subscription_id.to_string(),
                    record.chain_id as i64,
                    record.sub_account_address,
                    record.metadata.to_string(),
                    record.message,
                    record.output_txn_hash,
                    record.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(sub_id: Uuid, created_at: DateTime<Utc>, message: &str) -> ExecutionLogRecord {
        ExecutionLogRecord {
            id: Uuid::new_v4(),
            subscription_id: sub_id,
            chain_id: 8453,
            sub_account_address: "0xA238Dd80C259a72e81d7e4664a9801593F98d1c5".into(),
            metadata: serde_json::json!({ "taskID": message }),
            message: message.to_string(),
            output_txn_hash: String::new(),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_latest_returns_newest_row() {
        let store = SqliteLogStore::open_in_memory().expect("open");
        let sub_id = Uuid::new_v4();
        let now = Utc::now();

        store
            .insert(&record(sub_id, now - Duration::hours(2), "older"))
            .await
            .expect("insert");
        store
            .insert(&record(sub_id, now, "newest"))
            .await
            .expect("insert");

        let latest = store
            .latest_by_sub_id(sub_id)
            .await
            .expect("query")
            .expect("row");
        assert_eq!(latest.message, "newest");
        assert_eq!(latest.subscription_id, sub_id);
        assert_eq!(latest.metadata["taskID"], "newest");
    }

    #[tokio::test]
    async fn test_missing_subscription_yields_none() {
        let store = SqliteLogStore::open_in_memory().expect("open");
        let latest = store
            .latest_by_sub_id(Uuid::new_v4())
            .await
            .expect("query");
        assert!(latest.is_none());
    }

    #[tokio::test]
    async fn test_rows_are_isolated_per_subscription() {
        let store = SqliteLogStore::open_in_memory().expect("open");
        let sub_a = Uuid::new_v4();
        let sub_b = Uuid::new_v4();
        let now = Utc::now();

        store
            .insert(&record(sub_a, now, "a"))
            .await
            .expect("insert");
        store
            .insert(&record(sub_b, now, "b"))
            .await
            .expect("insert");

        let latest = store
            .latest_by_sub_id(sub_a)
            .await
            .expect("query")
            .expect("row");
        assert_eq!(latest.message, "a");
    }
}
