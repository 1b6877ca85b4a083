//! Shard workers: one independent pull/process/commit loop per shard.

use crate::checkpoint::{CheckpointManager, CommitOutcome};
use crate::error::{PipelineError, Result, ShardId};
use crate::ingest::EventIngestor;
use crate::pipeline::{RecordOutcome, TransactionPipeline};
use crate::retry::RetryPolicy;
use crate::types::alert::Alert;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Broadcasts a stop request to every worker
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared resources every worker is built from
#[derive(Clone)]
pub struct WorkerContext {
    pub ingestor: EventIngestor,
    pub pipeline: Arc<TransactionPipeline>,
    pub checkpoints: CheckpointManager,
    /// Bounds how many batches are processed at once across shards
    pub batch_slots: Arc<Semaphore>,
    pub poll_interval: Duration,
    /// Backoff while a shard stays unavailable
    pub pause: RetryPolicy,
    pub shutdown: ShutdownHandle,
}

/// Why a worker loop ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Shutdown,
    ShardGone,
}

/// What one pull/process/commit step did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub pulled: usize,
    pub stored: usize,
    pub dead_lettered: usize,
    /// Offset committed by this step, if the checkpoint moved
    pub committed: Option<u64>,
    /// A record could not reach a terminal outcome; the rest of the batch was left for later
    pub stalled: bool,
}

pub struct ShardWorker {
    shard_id: ShardId,
    ctx: WorkerContext,
    shutdown: watch::Receiver<bool>,
    next_offset: Option<u64>,
}

impl ShardWorker {
    pub fn new(shard_id: ShardId, ctx: WorkerContext) -> Self {
        let shutdown = ctx.shutdown.subscribe();
        Self {
            shard_id,
            ctx,
            shutdown,
            next_offset: None,
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Next offset this worker will pull from, once resumed
    pub fn next_offset(&self) -> Option<u64> {
        self.next_offset
    }

    async fn cursor(&mut self) -> Result<u64> {
        if let Some(offset) = self.next_offset {
            return Ok(offset);
        }
        let position = self.ctx.checkpoints.resume(self.shard_id).await?;
        info!(shard_id = self.shard_id, position = ?position, "Resuming shard");
        let offset = position.next_offset();
        self.next_offset = Some(offset);
        Ok(offset)
    }

    /// Pull one batch, process its records in order and commit the terminal prefix
    pub async fn run_once(&mut self) -> Result<BatchReport> {
        let from = self.cursor().await?;

        let _slot = self
            .ctx
            .batch_slots
            .acquire()
            .await
            .map_err(|e| PipelineError::Config(format!("batch slots closed: {}", e)))?;

        let batch = self.ctx.ingestor.pull(self.shard_id, from).await?;
        let mut report = BatchReport {
            pulled: batch.len(),
            ..Default::default()
        };

        let mut last_terminal = None;
        for record in &batch.records {
            match self.ctx.pipeline.process(record).await {
                Ok(RecordOutcome::Stored { .. }) => report.stored += 1,
                Ok(RecordOutcome::DeadLettered { .. }) => report.dead_lettered += 1,
                Err(e) => {
                    error!(
                        shard_id = self.shard_id,
                        offset = record.offset,
                        error = %e,
                        "Record did not reach a terminal outcome, holding checkpoint"
                    );
                    report.stalled = true;
                    break;
                }
            }
            last_terminal = Some(record.offset);
        }

        if let Some(offset) = last_terminal {
            if let CommitOutcome::Advanced { .. } = self.ctx.checkpoints.commit(self.shard_id, offset).await? {
                self.ctx.pipeline.metrics().record_checkpoint();
                report.committed = Some(offset);
            }
            self.next_offset = Some(offset + 1);
        }

        if report.pulled > 0 {
            debug!(
                shard_id = self.shard_id,
                pulled = report.pulled,
                stored = report.stored,
                dead_lettered = report.dead_lettered,
                committed = ?report.committed,
                "Batch processed"
            );
        }
        Ok(report)
    }

    /// Loop until shutdown, shard loss or a fatal error.
    ///
    /// An unavailable shard raises an alert and is paused with backoff; other
    /// shards are unaffected. A failed checkpoint commit stops the worker.
    pub async fn run(mut self) -> Result<WorkerExit> {
        info!(shard_id = self.shard_id, "Shard worker started");
        let mut unavailable_streak = 0u32;

        loop {
            if *self.shutdown.borrow() {
                info!(shard_id = self.shard_id, "Shard worker stopping");
                return Ok(WorkerExit::Shutdown);
            }

            let pause = match self.run_once().await {
                Ok(report) => {
                    unavailable_streak = 0;
                    if report.pulled == 0 || report.stalled {
                        Some(self.ctx.poll_interval)
                    } else {
                        None
                    }
                }
                Err(PipelineError::ShardUnavailable { reason, attempts, .. }) => {
                    unavailable_streak += 1;
                    let delay = self.ctx.pause.delay_for_attempt(unavailable_streak);
                    warn!(
                        shard_id = self.shard_id,
                        attempts,
                        streak = unavailable_streak,
                        pause_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Shard unavailable, pausing"
                    );
                    if unavailable_streak == 1 {
                        self.ctx
                            .pipeline
                            .alerts()
                            .dispatch(Alert::shard_unavailable(self.shard_id, &reason))
                            .await;
                    }
                    Some(delay)
                }
                Err(PipelineError::ShardGone(_)) => {
                    warn!(shard_id = self.shard_id, "Shard is gone, worker exiting");
                    return Ok(WorkerExit::ShardGone);
                }
                Err(e) => {
                    error!(shard_id = self.shard_id, error = %e, "Shard worker failed");
                    return Err(e);
                }
            };

            if let Some(delay) = pause {
                if self.sleep_or_shutdown(delay).await {
                    info!(shard_id = self.shard_id, "Shard worker stopping");
                    return Ok(WorkerExit::Shutdown);
                }
            }
        }
    }

    /// Sleep for `delay`; true when shutdown was requested meanwhile
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => *self.shutdown.borrow(),
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertDispatcher, MemoryAlertSink};
    use crate::checkpoint::{CheckpointStore, ShardCheckpoint, SqliteCheckpointStore};
    use crate::config::AppConfig;
    use crate::dead_letter::DeadLetterHandler;
    use crate::error::StorageError;
    use crate::history::InMemoryHistory;
    use crate::ingest::MemoryShardSource;
    use crate::metrics::PipelineMetrics;
    use crate::pipeline::PipelineParts;
    use crate::storage::SqliteTransactionStore;
    use crate::store::Database;
    use crate::types::alert::AlertKind;
    use async_trait::async_trait;
    use chrono::Utc;

    struct BrokenCheckpoints;

    #[async_trait]
    impl CheckpointStore for BrokenCheckpoints {
        async fn load(&self, _shard_id: ShardId) -> std::result::Result<Option<ShardCheckpoint>, StorageError> {
            Ok(None)
        }

        async fn advance(&self, _shard_id: ShardId, _offset: u64) -> std::result::Result<CommitOutcome, StorageError> {
            Err(StorageError::Task("disk full".to_string()))
        }

        async fn list(&self) -> std::result::Result<Vec<ShardCheckpoint>, StorageError> {
            Ok(Vec::new())
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            call_timeout: Duration::from_millis(500),
        }
    }

    struct Fixture {
        source: Arc<MemoryShardSource>,
        ctx: WorkerContext,
        alerts: Arc<MemoryAlertSink>,
    }

    fn fixture_with(checkpoints: Arc<dyn CheckpointStore>, db: Database) -> Fixture {
        let config = AppConfig::default();
        let metrics = Arc::new(PipelineMetrics::new());
        let alert_sink = Arc::new(MemoryAlertSink::new());
        let alerts = AlertDispatcher::new(alert_sink.clone(), Duration::from_secs(1), metrics.clone());
        let pipeline = TransactionPipeline::new(
            &config,
            PipelineParts {
                history: Arc::new(InMemoryHistory::new()),
                sink: Arc::new(SqliteTransactionStore::new(db.clone(), config.history.clone())),
                dead_letters: DeadLetterHandler::new(db, 3, alerts.clone()),
                alerts,
                metrics,
            },
        );
        let source = Arc::new(MemoryShardSource::new());

        let ctx = WorkerContext {
            ingestor: EventIngestor::new(source.clone(), fast(), 2),
            pipeline: Arc::new(pipeline),
            checkpoints: CheckpointManager::new(checkpoints),
            batch_slots: Arc::new(Semaphore::new(1)),
            poll_interval: Duration::from_millis(5),
            pause: fast(),
            shutdown: ShutdownHandle::new(),
        };

        Fixture {
            source,
            ctx,
            alerts: alert_sink,
        }
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        fixture_with(Arc::new(SqliteCheckpointStore::new(db.clone())), db)
    }

    fn payload(id: &str) -> Vec<u8> {
        format!(
            r#"{{"transaction_id":"{}","amount":12.5,"merchant_mcc":"5812","timestamp":"{}","user_id":"u1"}}"#,
            id,
            Utc::now().to_rfc3339()
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn test_run_once_commits_after_terminal_outcomes() {
        let f = fixture();
        f.source.push(0, payload("a"));
        f.source.push(0, b"not json".to_vec());
        f.source.push(0, payload("c"));

        let mut worker = ShardWorker::new(0, f.ctx.clone());
        let first = worker.run_once().await.unwrap();
        assert_eq!(first.pulled, 2);
        assert_eq!(first.stored, 1);
        assert_eq!(first.dead_lettered, 1);
        assert_eq!(first.committed, Some(1));

        let second = worker.run_once().await.unwrap();
        assert_eq!(second.pulled, 1);
        assert_eq!(second.committed, Some(2));

        let idle = worker.run_once().await.unwrap();
        assert_eq!(idle, BatchReport::default());
        assert_eq!(worker.next_offset(), Some(3));
    }

    #[tokio::test]
    async fn test_new_worker_resumes_after_checkpoint() {
        let f = fixture();
        for id in ["a", "b", "c"] {
            f.source.push(4, payload(id));
        }

        let mut worker = ShardWorker::new(4, f.ctx.clone());
        worker.run_once().await.unwrap();

        let mut restarted = ShardWorker::new(4, f.ctx.clone());
        let report = restarted.run_once().await.unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(report.committed, Some(2));
    }

    #[tokio::test]
    async fn test_commit_failure_is_fatal() {
        let db = Database::open_in_memory().unwrap();
        let f = fixture_with(Arc::new(BrokenCheckpoints), db);
        f.source.push(0, payload("a"));

        let worker = ShardWorker::new(0, f.ctx.clone());
        let result = worker.run().await;
        assert!(matches!(result, Err(PipelineError::CheckpointCommit { shard_id: 0, offset: 0, .. })));
    }

    #[tokio::test]
    async fn test_gone_shard_stops_worker() {
        let f = fixture();
        f.source.close(9);

        let worker = ShardWorker::new(9, f.ctx.clone());
        assert_eq!(worker.run().await.unwrap(), WorkerExit::ShardGone);
    }

    #[tokio::test]
    async fn test_unavailable_shard_alerts_and_recovers() {
        let f = fixture();
        f.source.push(1, payload("a"));
        // Two failed pulls exhaust one ingest retry budget of 2 attempts
        f.source.fail_next(1, 2);

        let shutdown = f.ctx.shutdown.clone();
        let checkpoints = f.ctx.checkpoints.clone();
        let worker = ShardWorker::new(1, f.ctx.clone());
        let handle = tokio::spawn(worker.run());

        let mut committed = false;
        for _ in 0..200 {
            if checkpoints.resume(1).await.unwrap().next_offset() == 1 {
                committed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.shutdown();

        assert!(committed);
        assert_eq!(handle.await.unwrap().unwrap(), WorkerExit::Shutdown);
        let unavailable = f
            .alerts
            .alerts()
            .iter()
            .filter(|a| a.kind == AlertKind::ShardUnavailable)
            .count();
        assert_eq!(unavailable, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_worker() {
        let f = fixture();
        let shutdown = f.ctx.shutdown.clone();
        let handle = tokio::spawn(ShardWorker::new(2, f.ctx.clone()).run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.shutdown();
        assert_eq!(handle.await.unwrap().unwrap(), WorkerExit::Shutdown);
    }
}
