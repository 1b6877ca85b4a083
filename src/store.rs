//! SQLite database shared by the storage sink, checkpoint store and dead-letter store.
//!
//! One connection guarded by a mutex; every call runs on the blocking pool so
//! the async workers are never stalled by disk I/O.

use crate::error::StorageError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// How long SQLite waits on a locked database before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS hot_transactions (
    transaction_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    amount TEXT NOT NULL,
    location TEXT,
    event_time TEXT NOT NULL,
    category TEXT NOT NULL,
    risk_score INTEGER NOT NULL,
    risk_bucket TEXT NOT NULL,
    record TEXT NOT NULL,
    processed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_hot_user_time ON hot_transactions(user_id, event_time);
CREATE INDEX IF NOT EXISTS idx_hot_partition ON hot_transactions(partition_key);

CREATE TABLE IF NOT EXISTS cold_transactions (
    transaction_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    amount TEXT NOT NULL,
    location TEXT,
    event_time TEXT NOT NULL,
    category TEXT NOT NULL,
    risk_score INTEGER NOT NULL,
    risk_bucket TEXT NOT NULL,
    record TEXT NOT NULL,
    processed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cold_partition ON cold_transactions(partition_key);

CREATE TABLE IF NOT EXISTS shard_checkpoints (
    shard_id INTEGER PRIMARY KEY,
    last_committed_offset INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_key TEXT NOT NULL UNIQUE,
    shard_id INTEGER NOT NULL,
    stream_offset INTEGER NOT NULL,
    payload TEXT NOT NULL,
    failure_kind TEXT NOT NULL,
    failure_reason TEXT NOT NULL,
    attempt_count INTEGER NOT NULL,
    first_seen_at TEXT NOT NULL,
    last_failed_at TEXT NOT NULL,
    status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dead_letters_status ON dead_letters(status, last_failed_at);
";

/// Handle to the pipeline database. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file with durable settings
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Task(format!("create {}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        // Checkpoint commits must survive power loss, not just process crashes
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn, &path.display().to_string())
    }

    /// Private in-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?, ":memory:")
    }

    fn init(conn: Connection, name: &str) -> Result<Self, StorageError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        info!(database = %name, "Pipeline database ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking thread pool
    pub async fn call<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StorageError::Task(format!("mutex poisoned: {}", e)))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Task(format!("spawn_blocking failed: {}", e)))?
    }
}

/// Canonical timestamp text: fixed width so lexical order is time order
pub(crate) fn format_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_time(text: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("timestamp '{}': {}", text, e)))
}
