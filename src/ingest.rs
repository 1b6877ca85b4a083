//! Event ingestion: pulling ordered record batches from stream shards.
//!
//! The ingestor only reads. Checkpoints are advanced by the worker once a
//! batch's records are terminal.

use crate::error::{PipelineError, Result, ShardId, SourceError};
use crate::retry::{AttemptError, RetryError, RetryPolicy};
use crate::types::transaction::RawRecord;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, info};

/// A per-shard ordered record stream
#[async_trait]
pub trait ShardSource: Send + Sync {
    /// Up to `max` records of `shard_id` at or after `from_offset`, in offset order
    async fn pull(
        &self,
        shard_id: ShardId,
        from_offset: u64,
        max: usize,
    ) -> std::result::Result<Vec<RawRecord>, SourceError>;
}

/// Shards stored as JSON-lines files, `shard-<id>.jsonl`.
///
/// The offset of a record is its zero-based line number. Blank lines keep
/// their offset but yield no record; an unterminated last line is still
/// being written and is left for a later pull. Lines are handed on as raw
/// bytes, so a line that is not UTF-8 reaches validation like any other
/// malformed record.
///
/// Each shard remembers where its last pull stopped, and a pull at or past
/// that line seeks there instead of rescanning the file. A cursor that no
/// longer lands on a line start is dropped.
pub struct FileShardSource {
    dir: PathBuf,
    cursors: Mutex<HashMap<ShardId, LineCursor>>,
}

/// Byte position of the start of a line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LineCursor {
    line: u64,
    byte: u64,
}

impl FileShardSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn shard_path(&self, shard_id: ShardId) -> PathBuf {
        shard_file(&self.dir, shard_id)
    }

    fn cursor_for(&self, shard_id: ShardId, from_offset: u64) -> LineCursor {
        self.cursors
            .lock()
            .ok()
            .and_then(|cursors| cursors.get(&shard_id).copied())
            .filter(|cursor| cursor.line <= from_offset)
            .unwrap_or_default()
    }

    fn remember(&self, shard_id: ShardId, cursor: LineCursor) {
        if let Ok(mut cursors) = self.cursors.lock() {
            cursors.insert(shard_id, cursor);
        }
    }
}

/// Position `file` at `cursor`. Returns false when the cursor does not
/// start a line of the current file.
async fn seek_to_line(file: &mut File, cursor: LineCursor) -> std::io::Result<bool> {
    if cursor.byte == 0 {
        return Ok(true);
    }
    if cursor.byte > file.metadata().await?.len() {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(cursor.byte - 1)).await?;
    let mut previous = [0u8; 1];
    file.read_exact(&mut previous).await?;
    Ok(previous[0] == b'\n')
}

/// Location of a shard file inside `dir`
pub fn shard_file(dir: &Path, shard_id: ShardId) -> PathBuf {
    dir.join(format!("shard-{}.jsonl", shard_id))
}

#[async_trait]
impl ShardSource for FileShardSource {
    async fn pull(
        &self,
        shard_id: ShardId,
        from_offset: u64,
        max: usize,
    ) -> std::result::Result<Vec<RawRecord>, SourceError> {
        let unavailable = |e: std::io::Error| SourceError::Unavailable {
            shard_id,
            reason: e.to_string(),
        };

        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(SourceError::Gone(shard_id)),
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(SourceError::Gone(shard_id)),
            Err(e) => return Err(unavailable(e)),
        }

        let mut file = match File::open(self.shard_path(shard_id)).await {
            Ok(file) => file,
            // Nothing produced to this shard yet
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable(e)),
        };

        let mut cursor = self.cursor_for(shard_id, from_offset);
        if !seek_to_line(&mut file, cursor).await.map_err(unavailable)? {
            debug!(shard_id, line = cursor.line, byte = cursor.byte, "Shard cursor stale, rescanning");
            file.seek(SeekFrom::Start(0)).await.map_err(unavailable)?;
            cursor = LineCursor::default();
        }

        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut line = Vec::new();

        while records.len() < max {
            line.clear();
            let read = reader.read_until(b'\n', &mut line).await.map_err(unavailable)?;
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }
            if cursor.line >= from_offset {
                let payload = line.trim_ascii();
                if !payload.is_empty() {
                    records.push(RawRecord::new(shard_id, cursor.line, payload));
                }
            }
            cursor.line += 1;
            cursor.byte += read as u64;
        }

        self.remember(shard_id, cursor);
        Ok(records)
    }
}

/// In-memory shards with failure injection
#[derive(Default)]
pub struct MemoryShardSource {
    shards: RwLock<HashMap<ShardId, Vec<Vec<u8>>>>,
    failing: Mutex<HashMap<ShardId, u32>>,
    gone: RwLock<HashSet<ShardId>>,
}

impl MemoryShardSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload to a shard, returning its offset
    pub fn push(&self, shard_id: ShardId, payload: impl Into<Vec<u8>>) -> u64 {
        match self.shards.write() {
            Ok(mut shards) => {
                let records = shards.entry(shard_id).or_default();
                records.push(payload.into());
                (records.len() - 1) as u64
            }
            Err(_) => 0,
        }
    }

    /// Make the next `pulls` pulls of a shard fail as unavailable
    pub fn fail_next(&self, shard_id: ShardId, pulls: u32) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(shard_id, pulls);
        }
    }

    /// Remove a shard for good
    pub fn close(&self, shard_id: ShardId) {
        if let Ok(mut gone) = self.gone.write() {
            gone.insert(shard_id);
        }
    }
}

#[async_trait]
impl ShardSource for MemoryShardSource {
    async fn pull(
        &self,
        shard_id: ShardId,
        from_offset: u64,
        max: usize,
    ) -> std::result::Result<Vec<RawRecord>, SourceError> {
        if self.gone.read().map(|g| g.contains(&shard_id)).unwrap_or(false) {
            return Err(SourceError::Gone(shard_id));
        }

        if let Ok(mut failing) = self.failing.lock() {
            if let Some(remaining) = failing.get_mut(&shard_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SourceError::Unavailable {
                        shard_id,
                        reason: "injected failure".to_string(),
                    });
                }
            }
        }

        let shards = self.shards.read().map_err(|e| SourceError::Unavailable {
            shard_id,
            reason: format!("lock poisoned: {}", e),
        })?;
        Ok(shards
            .get(&shard_id)
            .map(|records| {
                records
                    .iter()
                    .enumerate()
                    .skip(from_offset as usize)
                    .take(max)
                    .map(|(offset, payload)| RawRecord::new(shard_id, offset as u64, payload.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Records pulled from one shard in one call
#[derive(Debug, Clone)]
pub struct Batch {
    pub shard_id: ShardId,
    pub records: Vec<RawRecord>,
}

impl Batch {
    /// Offset of the last record, `None` when empty
    pub fn last_offset(&self) -> Option<u64> {
        self.records.last().map(|r| r.offset)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Pulls bounded batches under the retry policy
#[derive(Clone)]
pub struct EventIngestor {
    source: Arc<dyn ShardSource>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl EventIngestor {
    pub fn new(source: Arc<dyn ShardSource>, retry: RetryPolicy, batch_size: usize) -> Self {
        info!(batch_size, max_attempts = retry.max_attempts, "Event ingestor initialized");
        Self {
            source,
            retry,
            batch_size: batch_size.max(1),
        }
    }

    /// Pull up to `batch_size` records of `shard_id` starting at `from_offset`.
    ///
    /// Fails with `ShardUnavailable` once the retry budget is spent and with
    /// `ShardGone` as soon as the source reports the shard gone.
    pub async fn pull(&self, shard_id: ShardId, from_offset: u64) -> Result<Batch> {
        let source = &self.source;
        let max = self.batch_size;

        let pulled = self
            .retry
            .run_while(
                "shard_pull",
                move |_| source.pull(shard_id, from_offset, max),
                |e| !matches!(e, SourceError::Gone(_)),
            )
            .await;

        match pulled {
            Ok(records) => {
                let batch = Batch { shard_id, records };
                debug!(
                    shard_id,
                    from_offset,
                    records = batch.len(),
                    last_offset = ?batch.last_offset(),
                    "Pulled batch"
                );
                Ok(batch)
            }
            Err(RetryError {
                last: AttemptError::Failed(SourceError::Gone(id)),
                ..
            }) => Err(PipelineError::ShardGone(id)),
            Err(e) => Err(PipelineError::ShardUnavailable {
                shard_id,
                attempts: e.attempts,
                reason: e.last.to_string(),
            }),
        }
    }
}
