//! Per-record processing: validate, categorize, score, route, store.
//!
//! Every record ends in exactly one terminal outcome, stored or
//! dead-lettered. Only a failure to dead-letter leaves a record
//! non-terminal, and the caller must not checkpoint past it.

use crate::alerts::AlertDispatcher;
use crate::categorizer::MerchantCategorizer;
use crate::config::AppConfig;
use crate::dead_letter::{DeadLetterHandler, FailedRecord};
use crate::error::{PipelineError, Result, StorageError};
use crate::history::HistoryLookup;
use crate::metrics::PipelineMetrics;
use crate::retry::{AttemptError, RetryPolicy};
use crate::router::{RoutingDecision, StorageRouter, StorageTier};
use crate::scoring::RiskScorer;
use crate::storage::{StorageSink, UpsertOutcome};
use crate::types::alert::Alert;
use crate::types::dead_letter::{DeadLetterStatus, FailureKind};
use crate::types::risk::RiskBucket;
use crate::types::transaction::{EnrichedTransaction, RawRecord};
use crate::validator::SchemaValidator;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Terminal outcome of one record
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Stored {
        transaction_id: String,
        tier: StorageTier,
        risk_score: u8,
        risk_bucket: RiskBucket,
        upsert: UpsertOutcome,
    },
    DeadLettered {
        record_key: String,
        kind: FailureKind,
        attempt_count: u32,
        status: DeadLetterStatus,
    },
}

impl RecordOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, RecordOutcome::Stored { .. })
    }
}

/// Result of a dead-letter replay pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub resolved: usize,
    pub failed: usize,
    /// Failures that exhausted the retry budget during this pass
    pub exhausted: usize,
}

/// Collaborators the pipeline is assembled from
pub struct PipelineParts {
    pub history: Arc<dyn HistoryLookup>,
    pub sink: Arc<dyn StorageSink>,
    pub dead_letters: DeadLetterHandler,
    pub alerts: AlertDispatcher,
    pub metrics: Arc<PipelineMetrics>,
}

/// The record-level processing chain shared by all shard workers
pub struct TransactionPipeline {
    validator: SchemaValidator,
    categorizer: MerchantCategorizer,
    scorer: RiskScorer,
    router: StorageRouter,
    sink: Arc<dyn StorageSink>,
    dead_letters: DeadLetterHandler,
    alerts: AlertDispatcher,
    metrics: Arc<PipelineMetrics>,
    write_slots: Arc<Semaphore>,
    write_timeout: Duration,
    storage_retry: RetryPolicy,
}

impl TransactionPipeline {
    pub fn new(config: &AppConfig, parts: PipelineParts) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let categorizer = MerchantCategorizer::new();

        info!(
            mapped_mcc_codes = categorizer.mapped_codes(),
            max_in_flight_writes = config.storage.max_in_flight_writes,
            retry_budget = parts.dead_letters.retry_budget(),
            "Transaction pipeline initialized"
        );

        Self {
            validator: SchemaValidator::new(),
            categorizer,
            scorer: RiskScorer::new(&config.scoring, parts.history, retry.clone()),
            router: StorageRouter::new(&config.routing),
            sink: parts.sink,
            dead_letters: parts.dead_letters,
            alerts: parts.alerts,
            metrics: parts.metrics,
            write_slots: Arc::new(Semaphore::new(config.storage.max_in_flight_writes.max(1))),
            write_timeout: Duration::from_millis(config.storage.write_timeout_ms),
            storage_retry: retry,
        }
    }

    /// Drive one raw record to its terminal outcome.
    ///
    /// Errors only when the record could not be dead-lettered either.
    pub async fn process(&self, raw: &RawRecord) -> Result<RecordOutcome> {
        let start_time = Instant::now();

        let event = match self.validator.validate(raw) {
            Ok(event) => event,
            Err(e) => {
                debug!(
                    shard_id = raw.shard_id,
                    offset = raw.offset,
                    field = %e.field,
                    reason = %e.reason,
                    "Record failed validation"
                );
                return self
                    .dead_letter(FailedRecord::from_raw(raw, FailureKind::Validation, e.reason))
                    .await;
            }
        };

        let category = self.categorizer.categorize(&event.merchant_mcc);
        let assessment = self.scorer.score(&event, category).await;
        let enriched = assessment.enrich(event, category, Utc::now());

        self.metrics.record_scored(
            start_time.elapsed(),
            enriched.risk_score,
            enriched.risk_bucket,
            enriched.degraded_context,
        );

        // Alerting does not wait on the storage outcome
        if enriched.risk_bucket == RiskBucket::HighRisk {
            info!(
                transaction_id = %enriched.transaction_id(),
                user_id = %enriched.user_id(),
                risk_score = enriched.risk_score,
                category = %enriched.category,
                "High risk transaction"
            );
            self.alerts.dispatch(Alert::high_risk(&enriched)).await;
        }

        let decision = self.router.route(&enriched, Utc::now());

        match self.store(&enriched, &decision).await {
            Ok(upsert) => {
                self.metrics.record_stored(decision.tier);
                debug!(
                    shard_id = raw.shard_id,
                    offset = raw.offset,
                    transaction_id = %enriched.transaction_id(),
                    risk_score = enriched.risk_score,
                    risk_bucket = %enriched.risk_bucket,
                    tier = %decision.tier,
                    processing_time_us = start_time.elapsed().as_micros() as u64,
                    "Transaction stored"
                );
                Ok(RecordOutcome::Stored {
                    transaction_id: enriched.event.transaction_id,
                    tier: decision.tier,
                    risk_score: enriched.risk_score,
                    risk_bucket: enriched.risk_bucket,
                    upsert,
                })
            }
            Err((kind, e)) => {
                warn!(
                    shard_id = raw.shard_id,
                    offset = raw.offset,
                    transaction_id = %enriched.transaction_id(),
                    kind = kind.as_str(),
                    error = %e,
                    "Storage write failed"
                );
                self.dead_letter(FailedRecord::from_raw(raw, kind, e.to_string()))
                    .await
            }
        }
    }

    /// Upsert under the write slot limit and the storage retry budget.
    ///
    /// Records that cannot be serialized are not retried. An attempt that
    /// times out is abandoned rather than cancelled: a blocking write already
    /// handed to the database may still commit after the record has been
    /// dead-lettered. Replay upserts the same key and resolves the entry, so
    /// the late copy is absorbed.
    async fn store(
        &self,
        tx: &EnrichedTransaction,
        decision: &RoutingDecision,
    ) -> std::result::Result<UpsertOutcome, (FailureKind, PipelineError)> {
        let slots = &self.write_slots;
        let sink = &self.sink;
        let wait = self.write_timeout;

        let result = self
            .storage_retry
            .run_while(
                "storage_upsert",
                move |_| async move {
                    let _permit = match tokio::time::timeout(wait, slots.acquire()).await {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) => return Err(StorageError::Task("write slots closed".to_string())),
                        Err(_) => return Err(StorageError::Saturated(wait.as_millis() as u64)),
                    };
                    sink.upsert(tx, decision).await
                },
                |e| !matches!(e, StorageError::Serialization(_)),
            )
            .await;

        result.map_err(|e| {
            let kind = match &e.last {
                AttemptError::Failed(StorageError::Serialization(_)) => FailureKind::Processing,
                _ => FailureKind::Storage,
            };
            let err = PipelineError::TransientIo {
                operation: "storage_upsert",
                attempts: e.attempts,
                message: e.last.to_string(),
            };
            (kind, err)
        })
    }

    async fn dead_letter(&self, failure: FailedRecord) -> Result<RecordOutcome> {
        let kind = failure.kind;
        let record = self
            .dead_letters
            .capture(failure)
            .await
            .map_err(|e| PipelineError::DeadLetter(e.to_string()))?;
        self.metrics.record_dead_letter(kind);

        Ok(RecordOutcome::DeadLettered {
            record_key: record.record_key,
            kind,
            attempt_count: record.attempt_count,
            status: record.status,
        })
    }

    /// Re-run pending dead letters through the pipeline.
    ///
    /// Successes are marked resolved; failures are captured again, which
    /// counts the attempt and may exhaust the entry.
    pub async fn replay_dead_letters(&self, limit: usize) -> Result<ReplaySummary> {
        let pending = self
            .dead_letters
            .list(crate::dead_letter::DeadLetterQuery::pending(limit))
            .await?;

        let mut summary = ReplaySummary::default();
        for entry in pending {
            summary.replayed += 1;
            let raw = RawRecord::new(entry.shard_id, entry.offset, entry.payload.as_bytes());

            match self.process(&raw).await? {
                RecordOutcome::Stored { .. } => {
                    self.dead_letters.mark_resolved(entry.id).await?;
                    summary.resolved += 1;
                    info!(record_key = %entry.record_key, id = entry.id, "Dead letter resolved");
                }
                RecordOutcome::DeadLettered { status, attempt_count, .. } => {
                    summary.failed += 1;
                    if status == DeadLetterStatus::Exhausted {
                        summary.exhausted += 1;
                    }
                    warn!(
                        record_key = %entry.record_key,
                        attempt_count,
                        status = status.as_str(),
                        "Dead letter replay failed"
                    );
                }
            }
        }

        info!(
            replayed = summary.replayed,
            resolved = summary.resolved,
            failed = summary.failed,
            exhausted = summary.exhausted,
            "Dead-letter replay finished"
        );
        Ok(summary)
    }

    pub fn dead_letters(&self) -> &DeadLetterHandler {
        &self.dead_letters
    }

    pub fn alerts(&self) -> &AlertDispatcher {
        &self.alerts
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::MemoryAlertSink;
    use crate::history::InMemoryHistory;
    use crate::storage::SqliteTransactionStore;
    use crate::store::Database;
    use crate::types::alert::AlertKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Sink that fails while `down` is set
    struct FlakySink {
        inner: SqliteTransactionStore,
        down: AtomicBool,
    }

    #[async_trait]
    impl StorageSink for FlakySink {
        async fn upsert(
            &self,
            tx: &EnrichedTransaction,
            decision: &RoutingDecision,
        ) -> std::result::Result<UpsertOutcome, StorageError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StorageError::Task("sink offline".to_string()));
            }
            self.inner.upsert(tx, decision).await
        }
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.retry.max_attempts = 2;
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 2;
        config.dead_letter.retry_budget = 2;
        config
    }

    struct Fixture {
        pipeline: TransactionPipeline,
        sink: Arc<FlakySink>,
        alerts: Arc<MemoryAlertSink>,
    }

    fn build(
        config: &AppConfig,
        db: Database,
        sink: Arc<dyn StorageSink>,
    ) -> (TransactionPipeline, Arc<MemoryAlertSink>) {
        let metrics = Arc::new(PipelineMetrics::new());
        let alert_sink = Arc::new(MemoryAlertSink::new());
        let alerts = AlertDispatcher::new(alert_sink.clone(), Duration::from_secs(1), metrics.clone());

        let pipeline = TransactionPipeline::new(
            config,
            PipelineParts {
                history: Arc::new(InMemoryHistory::new()),
                sink,
                dead_letters: DeadLetterHandler::new(db, config.dead_letter.retry_budget, alerts.clone()),
                alerts,
                metrics,
            },
        );
        (pipeline, alert_sink)
    }

    fn fixture() -> Fixture {
        let config = test_config();
        let db = Database::open_in_memory().unwrap();
        let sink = Arc::new(FlakySink {
            inner: SqliteTransactionStore::new(db.clone(), config.history.clone()),
            down: AtomicBool::new(false),
        });
        let (pipeline, alerts) = build(&config, db, sink.clone());

        Fixture {
            pipeline,
            sink,
            alerts,
        }
    }

    /// Sink whose first write blocks until released
    struct GatedSink {
        inner: SqliteTransactionStore,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
        gated: AtomicBool,
    }

    #[async_trait]
    impl StorageSink for GatedSink {
        async fn upsert(
            &self,
            tx: &EnrichedTransaction,
            decision: &RoutingDecision,
        ) -> std::result::Result<UpsertOutcome, StorageError> {
            if self.gated.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.upsert(tx, decision).await
        }
    }

    /// Sink that hands each write to a detached task, like a blocking
    /// database call, and commits it only after `delay` while `late` is set
    struct LateSink {
        inner: SqliteTransactionStore,
        late: AtomicBool,
        delay: Duration,
    }

    #[async_trait]
    impl StorageSink for LateSink {
        async fn upsert(
            &self,
            tx: &EnrichedTransaction,
            decision: &RoutingDecision,
        ) -> std::result::Result<UpsertOutcome, StorageError> {
            let inner = self.inner.clone();
            let (tx, decision) = (tx.clone(), decision.clone());
            let delay = if self.late.load(Ordering::SeqCst) {
                self.delay
            } else {
                Duration::ZERO
            };
            let write = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.upsert(&tx, &decision).await
            });
            write
                .await
                .map_err(|e| StorageError::Task(e.to_string()))?
        }
    }

    fn raw(offset: u64, payload: &str) -> RawRecord {
        RawRecord::new(0, offset, payload.as_bytes())
    }

    fn payload(id: &str) -> String {
        format!(
            r#"{{"transaction_id":"{}","amount":"42.00","merchant_mcc":"5411","timestamp":"{}","user_id":"u9"}}"#,
            id,
            Utc::now().to_rfc3339()
        )
    }

    #[tokio::test]
    async fn test_valid_record_is_stored() {
        let f = fixture();
        let outcome = f.pipeline.process(&raw(0, &payload("t-ok"))).await.unwrap();

        match outcome {
            RecordOutcome::Stored { transaction_id, tier, upsert, .. } => {
                assert_eq!(transaction_id, "t-ok");
                assert_eq!(tier, StorageTier::Hot);
                assert_eq!(upsert, UpsertOutcome::Inserted);
            }
            other => panic!("expected Stored, got {:?}", other),
        }
        assert_eq!(f.pipeline.metrics().snapshot().stored_hot, 1);
    }

    #[tokio::test]
    async fn test_invalid_record_is_dead_lettered() {
        let f = fixture();
        let outcome = f
            .pipeline
            .process(&raw(3, r#"{"transaction_id":"t-bad","amount":0,"merchant_mcc":"5411","timestamp":"2024-01-01T00:00:00Z","user_id":"u"}"#))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RecordOutcome::DeadLettered {
                record_key: "t-bad".to_string(),
                kind: FailureKind::Validation,
                attempt_count: 1,
                status: DeadLetterStatus::Pending,
            }
        );
        let entry = f.pipeline.dead_letters().find("t-bad").await.unwrap().unwrap();
        assert_eq!(entry.failure_reason, "amount must be greater than zero");
        assert_eq!(entry.offset, 3);
    }

    #[tokio::test]
    async fn test_storage_failure_dead_letters_then_replay_resolves() {
        let f = fixture();
        f.sink.down.store(true, Ordering::SeqCst);

        let outcome = f.pipeline.process(&raw(0, &payload("t-flaky"))).await.unwrap();
        match outcome {
            RecordOutcome::DeadLettered { kind, attempt_count, .. } => {
                assert_eq!(kind, FailureKind::Storage);
                assert_eq!(attempt_count, 1);
            }
            other => panic!("expected DeadLettered, got {:?}", other),
        }

        f.sink.down.store(false, Ordering::SeqCst);
        let summary = f.pipeline.replay_dead_letters(10).await.unwrap();
        assert_eq!(summary.replayed, 1);
        assert_eq!(summary.resolved, 1);

        let entry = f.pipeline.dead_letters().find("t-flaky").await.unwrap().unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Resolved);
        assert_eq!(f.pipeline.dead_letters().count(Some(DeadLetterStatus::Pending)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replay_exhausts_budget_and_alerts_once() {
        let f = fixture();
        let bad = r#"{"amount":"10.00","merchant_mcc":"5411"}"#;

        f.pipeline.process(&raw(0, bad)).await.unwrap();
        // Budget is 2: attempt 2 stays pending, attempt 3 exhausts
        let first = f.pipeline.replay_dead_letters(10).await.unwrap();
        assert_eq!(first.exhausted, 0);
        let second = f.pipeline.replay_dead_letters(10).await.unwrap();
        assert_eq!(second.exhausted, 1);

        // Exhausted entries are no longer pending
        let third = f.pipeline.replay_dead_letters(10).await.unwrap();
        assert_eq!(third.replayed, 0);

        let exhausted: Vec<_> = f
            .alerts
            .alerts()
            .into_iter()
            .filter(|a| a.kind == AlertKind::DeadLetterExhausted)
            .collect();
        assert_eq!(exhausted.len(), 1);
    }

    #[tokio::test]
    async fn test_saturated_write_slots_dead_letter_instead_of_queueing() {
        let mut config = test_config();
        config.storage.max_in_flight_writes = 1;
        config.storage.write_timeout_ms = 20;
        config.retry.call_timeout_ms = 5_000;
        let db = Database::open_in_memory().unwrap();
        let sink = Arc::new(GatedSink {
            inner: SqliteTransactionStore::new(db.clone(), config.history.clone()),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
            gated: AtomicBool::new(true),
        });
        let (pipeline, _) = build(&config, db, sink.clone());
        let pipeline = Arc::new(pipeline);

        let holder = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.process(&raw(0, &payload("t-slow"))).await })
        };
        sink.entered.notified().await;

        let outcome = pipeline.process(&raw(1, &payload("t-waiting"))).await.unwrap();
        match outcome {
            RecordOutcome::DeadLettered { kind, .. } => assert_eq!(kind, FailureKind::Storage),
            other => panic!("expected DeadLettered, got {:?}", other),
        }
        let entry = pipeline.dead_letters().find("t-waiting").await.unwrap().unwrap();
        assert!(entry.failure_reason.contains("saturated"), "{}", entry.failure_reason);

        sink.release.notify_one();
        assert!(holder.await.unwrap().unwrap().is_stored());
    }

    #[tokio::test]
    async fn test_write_committed_after_timeout_is_absorbed_by_replay() {
        let mut config = test_config();
        config.retry.max_attempts = 1;
        config.retry.call_timeout_ms = 20;
        let db = Database::open_in_memory().unwrap();
        let store = SqliteTransactionStore::new(db.clone(), config.history.clone());
        let sink = Arc::new(LateSink {
            inner: store.clone(),
            late: AtomicBool::new(true),
            delay: Duration::from_millis(60),
        });
        let (pipeline, _) = build(&config, db, sink.clone());

        let outcome = pipeline.process(&raw(0, &payload("t-late"))).await.unwrap();
        assert!(matches!(outcome, RecordOutcome::DeadLettered { kind: FailureKind::Storage, .. }));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.get("t-late").await.unwrap().is_some());

        sink.late.store(false, Ordering::SeqCst);
        let summary = pipeline.replay_dead_letters(10).await.unwrap();
        assert_eq!(summary.resolved, 1);
        assert_eq!(store.count(StorageTier::Hot).await.unwrap(), 1);
        let entry = pipeline.dead_letters().find("t-late").await.unwrap().unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Resolved);
    }
}
