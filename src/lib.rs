//! Transaction Enrichment Pipeline Library
//!
//! Ingests sharded streams of financial transactions, validates and
//! categorizes each event, scores its fraud risk against the user's recent
//! activity and routes the enriched record to a hot or cold storage tier.
//! Failures are isolated in a replayable dead-letter store and per-shard
//! checkpoints give at-least-once processing across restarts.

pub mod alerts;
pub mod categorizer;
pub mod checkpoint;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod history;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod router;
pub mod scoring;
pub mod storage;
pub mod store;
pub mod types;
pub mod validator;
pub mod worker;

pub use config::AppConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{PipelineParts, RecordOutcome, TransactionPipeline};
pub use types::{alert::Alert, transaction::EnrichedTransaction, transaction::TransactionEvent};
pub use worker::{ShardWorker, ShutdownHandle, WorkerContext};
