//! Dead-letter handling
//!
//! Captures records that failed validation or exhausted their write retries,
//! counts repeated failures of the same logical record, and alerts once a
//! record's attempts exceed the retry budget. Entries are never deleted; a
//! successful replay marks them resolved.

use crate::alerts::AlertDispatcher;
use crate::error::{ShardId, StorageError};
use crate::store::{format_time, parse_time, Database};
use crate::types::alert::Alert;
use crate::types::dead_letter::{DeadLetterRecord, DeadLetterStatus, FailureKind};
use crate::types::transaction::RawRecord;
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use tracing::{error, warn};

const SELECT_COLUMNS: &str = "SELECT id, record_key, shard_id, stream_offset, payload, failure_kind,
        failure_reason, attempt_count, first_seen_at, last_failed_at, status
 FROM dead_letters";

/// A failure about to be dead-lettered
#[derive(Debug, Clone)]
pub struct FailedRecord {
    pub record_key: String,
    pub shard_id: ShardId,
    pub offset: u64,
    pub payload: String,
    pub kind: FailureKind,
    pub reason: String,
}

impl FailedRecord {
    pub fn from_raw(raw: &RawRecord, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            record_key: record_key(&raw.payload),
            shard_id: raw.shard_id,
            offset: raw.offset,
            payload: raw.payload_text(),
            kind,
            reason: reason.into(),
        }
    }
}

/// Logical identity of a payload: its `transaction_id` when one can be read,
/// otherwise a SHA-256 fingerprint of the bytes.
pub fn record_key(payload: &[u8]) -> String {
    let id = serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| {
            v.get("transaction_id")
                .and_then(|id| id.as_str())
                .map(|id| id.trim().to_string())
        })
        .filter(|id| !id.is_empty());

    match id {
        Some(id) => id,
        None => {
            let mut hasher = Sha256::new();
            hasher.update(payload);
            let digest = hasher.finalize();
            let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
            format!("sha256:{}", hex)
        }
    }
}

/// Filter for listing dead letters
#[derive(Debug, Clone)]
pub struct DeadLetterQuery {
    pub status: Option<DeadLetterStatus>,
    pub limit: usize,
}

impl Default for DeadLetterQuery {
    fn default() -> Self {
        Self {
            status: None,
            limit: 100,
        }
    }
}

impl DeadLetterQuery {
    pub fn pending(limit: usize) -> Self {
        Self {
            status: Some(DeadLetterStatus::Pending),
            limit,
        }
    }
}

/// Durable dead-letter handler backed by the pipeline database
#[derive(Clone)]
pub struct DeadLetterHandler {
    db: Database,
    retry_budget: u32,
    alerts: AlertDispatcher,
}

impl DeadLetterHandler {
    pub fn new(db: Database, retry_budget: u32, alerts: AlertDispatcher) -> Self {
        Self {
            db,
            retry_budget,
            alerts,
        }
    }

    /// Record a failure. Returns the entry as stored.
    ///
    /// The first failure of a record key creates the entry with
    /// `attempt_count = 1`; later failures increment it. Crossing the retry
    /// budget marks the entry exhausted and emits one alert.
    pub async fn capture(&self, failure: FailedRecord) -> Result<DeadLetterRecord, StorageError> {
        let budget = self.retry_budget;
        let (record, newly_exhausted) = self
            .db
            .call(move |conn| {
                let now = format_time(&Utc::now());
                let txn = conn.transaction()?;

                let existing: Option<(i64, u32, String)> = txn
                    .query_row(
                        "SELECT id, attempt_count, status FROM dead_letters WHERE record_key = ?1",
                        [&failure.record_key],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?;

                // Status after an episode's first failure
                let opening = if budget == 0 {
                    DeadLetterStatus::Exhausted
                } else {
                    DeadLetterStatus::Pending
                };

                let (id, was_exhausted) = match existing {
                    None => {
                        let status = opening;
                        txn.execute(
                            "INSERT INTO dead_letters (record_key, shard_id, stream_offset, payload,
                                 failure_kind, failure_reason, attempt_count, first_seen_at,
                                 last_failed_at, status)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7, ?8)",
                            params![
                                failure.record_key,
                                failure.shard_id,
                                failure.offset as i64,
                                failure.payload,
                                failure.kind.as_str(),
                                failure.reason,
                                now,
                                status.as_str()
                            ],
                        )?;
                        (txn.last_insert_rowid(), false)
                    }
                    Some((id, attempts, status)) => {
                        // A resolved record failing again starts a new episode
                        let reopened = status == DeadLetterStatus::Resolved.as_str();
                        let was_exhausted = status == DeadLetterStatus::Exhausted.as_str();
                        let (attempts, status) = if reopened {
                            (1, opening)
                        } else if was_exhausted || attempts + 1 > budget {
                            (attempts + 1, DeadLetterStatus::Exhausted)
                        } else {
                            (attempts + 1, DeadLetterStatus::Pending)
                        };
                        txn.execute(
                            "UPDATE dead_letters
                             SET shard_id = ?2, stream_offset = ?3, payload = ?4, failure_kind = ?5,
                                 failure_reason = ?6, attempt_count = ?7, last_failed_at = ?8,
                                 status = ?9,
                                 first_seen_at = CASE WHEN ?10 THEN ?8 ELSE first_seen_at END
                             WHERE id = ?1",
                            params![
                                id,
                                failure.shard_id,
                                failure.offset as i64,
                                failure.payload,
                                failure.kind.as_str(),
                                failure.reason,
                                attempts,
                                now,
                                status.as_str(),
                                reopened
                            ],
                        )?;
                        (id, was_exhausted)
                    }
                };

                let record = txn.query_row(
                    &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                    [id],
                    row_to_record,
                )?;
                txn.commit()?;

                let newly_exhausted =
                    !was_exhausted && record.status == DeadLetterStatus::Exhausted;
                Ok((record, newly_exhausted))
            })
            .await?;

        warn!(
            record_key = %record.record_key,
            shard_id = record.shard_id,
            offset = record.offset,
            kind = record.failure_kind.as_str(),
            attempt_count = record.attempt_count,
            reason = %record.failure_reason,
            "Record dead-lettered"
        );

        if newly_exhausted {
            error!(
                record_key = %record.record_key,
                attempt_count = record.attempt_count,
                retry_budget = self.retry_budget,
                "Dead letter exhausted its retry budget"
            );
            self.alerts.dispatch(Alert::dead_letter(&record)).await;
        }

        Ok(record)
    }

    /// Get a dead letter by id
    pub async fn get(&self, id: i64) -> Result<Option<DeadLetterRecord>, StorageError> {
        self.db
            .call(move |conn| {
                Ok(conn
                    .query_row(&format!("{} WHERE id = ?1", SELECT_COLUMNS), [id], row_to_record)
                    .optional()?)
            })
            .await
    }

    /// Get a dead letter by record key
    pub async fn find(&self, record_key: &str) -> Result<Option<DeadLetterRecord>, StorageError> {
        let record_key = record_key.to_string();
        self.db
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("{} WHERE record_key = ?1", SELECT_COLUMNS),
                        [&record_key],
                        row_to_record,
                    )
                    .optional()?)
            })
            .await
    }

    /// List dead letters, oldest failure first
    pub async fn list(&self, query: DeadLetterQuery) -> Result<Vec<DeadLetterRecord>, StorageError> {
        self.db
            .call(move |conn| {
                let limit = query.limit as i64;
                let rows = match query.status {
                    Some(status) => {
                        let mut stmt = conn.prepare(&format!(
                            "{} WHERE status = ?1 ORDER BY last_failed_at ASC, id ASC LIMIT ?2",
                            SELECT_COLUMNS
                        ))?;
                        let rows = stmt
                            .query_map(params![status.as_str(), limit], row_to_record)?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "{} ORDER BY last_failed_at ASC, id ASC LIMIT ?1",
                            SELECT_COLUMNS
                        ))?;
                        let rows = stmt
                            .query_map([limit], row_to_record)?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                };
                Ok(rows)
            })
            .await
    }

    /// Mark a dead letter as successfully replayed
    pub async fn mark_resolved(&self, id: i64) -> Result<(), StorageError> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE dead_letters SET status = ?2 WHERE id = ?1",
                    params![id, DeadLetterStatus::Resolved.as_str()],
                )?;
                Ok(())
            })
            .await
    }

    /// Count dead letters, optionally by status
    pub async fn count(&self, status: Option<DeadLetterStatus>) -> Result<usize, StorageError> {
        self.db
            .call(move |conn| {
                let count: i64 = match status {
                    Some(status) => conn.query_row(
                        "SELECT COUNT(*) FROM dead_letters WHERE status = ?1",
                        [status.as_str()],
                        |row| row.get(0),
                    )?,
                    None => conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?,
                };
                Ok(count as usize)
            })
            .await
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }
}

fn corrupt(column: usize, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, err.into())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<DeadLetterRecord> {
    let kind: String = row.get(5)?;
    let first_seen_at: String = row.get(8)?;
    let last_failed_at: String = row.get(9)?;
    let status: String = row.get(10)?;
    let offset: i64 = row.get(3)?;

    Ok(DeadLetterRecord {
        id: row.get(0)?,
        record_key: row.get(1)?,
        shard_id: row.get(2)?,
        offset: offset as u64,
        payload: row.get(4)?,
        failure_kind: FailureKind::parse(&kind)
            .ok_or_else(|| corrupt(5, format!("unknown failure kind '{}'", kind)))?,
        failure_reason: row.get(6)?,
        attempt_count: row.get(7)?,
        first_seen_at: parse_time(&first_seen_at).map_err(|e| corrupt(8, e))?,
        last_failed_at: parse_time(&last_failed_at).map_err(|e| corrupt(9, e))?,
        status: DeadLetterStatus::parse(&status)
            .ok_or_else(|| corrupt(10, format!("unknown status '{}'", status)))?,
    })
}
