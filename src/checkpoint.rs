//! Per-shard checkpoints: the durable crash-recovery position of each shard.
//!
//! Only [`CheckpointManager::commit`] and [`CheckpointManager::resume`] touch
//! checkpoint state. Offsets never move backwards.

use crate::error::{PipelineError, Result, ShardId, StorageError};
use crate::store::{format_time, parse_time, Database};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Durable position of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCheckpoint {
    pub shard_id: ShardId,
    pub last_committed_offset: u64,
    pub updated_at: DateTime<Utc>,
}

/// Where a worker resumes reading a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePosition {
    /// Nothing committed yet: start from the beginning of the stream
    Beginning,
    /// Resume after this committed offset
    After(u64),
}

impl ResumePosition {
    /// First offset still to be processed
    pub fn next_offset(&self) -> u64 {
        match self {
            ResumePosition::Beginning => 0,
            ResumePosition::After(offset) => offset + 1,
        }
    }
}

/// Result of a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The checkpoint moved forward
    Advanced { previous: Option<u64> },
    /// The offset was at or behind the stored one; nothing changed
    Stale { current: u64 },
}

/// Durable checkpoint backend
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, shard_id: ShardId) -> std::result::Result<Option<ShardCheckpoint>, StorageError>;

    /// Persist `offset` only if it is beyond the stored one
    async fn advance(
        &self,
        shard_id: ShardId,
        offset: u64,
    ) -> std::result::Result<CommitOutcome, StorageError>;

    async fn list(&self) -> std::result::Result<Vec<ShardCheckpoint>, StorageError>;
}

/// Checkpoints in the `shard_checkpoints` table
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    db: Database,
}

impl SqliteCheckpointStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn to_checkpoint(shard_id: ShardId, offset: i64, updated_at: &str) -> std::result::Result<ShardCheckpoint, StorageError> {
    Ok(ShardCheckpoint {
        shard_id,
        last_committed_offset: offset as u64,
        updated_at: parse_time(updated_at)?,
    })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, shard_id: ShardId) -> std::result::Result<Option<ShardCheckpoint>, StorageError> {
        self.db
            .call(move |conn| {
                let row: Option<(i64, String)> = conn
                    .query_row(
                        "SELECT last_committed_offset, updated_at FROM shard_checkpoints WHERE shard_id = ?1",
                        [shard_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                row.map(|(offset, updated_at)| to_checkpoint(shard_id, offset, &updated_at))
                    .transpose()
            })
            .await
    }

    async fn advance(
        &self,
        shard_id: ShardId,
        offset: u64,
    ) -> std::result::Result<CommitOutcome, StorageError> {
        self.db
            .call(move |conn| {
                let txn = conn.transaction()?;
                let current: Option<i64> = txn
                    .query_row(
                        "SELECT last_committed_offset FROM shard_checkpoints WHERE shard_id = ?1",
                        [shard_id],
                        |row| row.get(0),
                    )
                    .optional()?;

                if let Some(current) = current {
                    if offset as i64 <= current {
                        return Ok(CommitOutcome::Stale {
                            current: current as u64,
                        });
                    }
                }

                txn.execute(
                    "INSERT INTO shard_checkpoints (shard_id, last_committed_offset, updated_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(shard_id) DO UPDATE SET
                         last_committed_offset = excluded.last_committed_offset,
                         updated_at = excluded.updated_at
                     WHERE excluded.last_committed_offset > shard_checkpoints.last_committed_offset",
                    params![shard_id, offset as i64, format_time(&Utc::now())],
                )?;
                txn.commit()?;

                Ok(CommitOutcome::Advanced {
                    previous: current.map(|c| c as u64),
                })
            })
            .await
    }

    async fn list(&self) -> std::result::Result<Vec<ShardCheckpoint>, StorageError> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT shard_id, last_committed_offset, updated_at
                     FROM shard_checkpoints ORDER BY shard_id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, ShardId>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.iter()
                    .map(|(shard_id, offset, updated_at)| to_checkpoint(*shard_id, *offset, updated_at))
                    .collect()
            })
            .await
    }
}

/// Sole entry point to checkpoint state
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Record that every record of `shard_id` up to `offset` reached a terminal outcome.
    ///
    /// Durable when this returns. A stale offset is a logged no-op.
    pub async fn commit(&self, shard_id: ShardId, offset: u64) -> Result<CommitOutcome> {
        match self.store.advance(shard_id, offset).await {
            Ok(outcome @ CommitOutcome::Advanced { previous }) => {
                debug!(shard_id, offset, previous = ?previous, "Checkpoint committed");
                Ok(outcome)
            }
            Ok(outcome @ CommitOutcome::Stale { current }) => {
                warn!(shard_id, offset, current, "Ignoring checkpoint commit behind stored offset");
                Ok(outcome)
            }
            Err(e) => {
                error!(shard_id, offset, error = %e, "Checkpoint commit failed");
                Err(PipelineError::CheckpointCommit {
                    shard_id,
                    offset,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Position a restarted worker continues from
    pub async fn resume(&self, shard_id: ShardId) -> Result<ResumePosition> {
        let checkpoint = self.store.load(shard_id).await?;
        Ok(match checkpoint {
            Some(cp) => ResumePosition::After(cp.last_committed_offset),
            None => ResumePosition::Beginning,
        })
    }

    /// Every stored checkpoint
    pub async fn all(&self) -> Result<Vec<ShardCheckpoint>> {
        Ok(self.store.list().await?)
    }
}
