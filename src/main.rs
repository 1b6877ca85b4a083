//! Transaction Pipeline - Main Entry Point
//!
//! Runs one worker per configured shard: pull, validate, categorize, score,
//! route and store, with dead-lettering and per-shard checkpoints. Also
//! exposes dead-letter replay and inspection commands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use transaction_pipeline::{
    alerts::{AlertDispatcher, AlertSink, LogAlertSink, NatsAlertSink},
    checkpoint::{CheckpointManager, SqliteCheckpointStore},
    config::{AppConfig, LoggingConfig, DEFAULT_CONFIG_PATH},
    dead_letter::{DeadLetterHandler, DeadLetterQuery},
    ingest::{EventIngestor, FileShardSource},
    metrics::{MetricsReporter, PipelineMetrics},
    pipeline::{PipelineParts, TransactionPipeline},
    retry::RetryPolicy,
    storage::SqliteTransactionStore,
    store::Database,
    types::dead_letter::DeadLetterStatus,
    worker::{ShardWorker, ShutdownHandle, WorkerContext, WorkerExit},
};

#[derive(Parser, Debug)]
#[command(name = "transaction-pipeline", version, about = "Streaming transaction enrichment pipeline")]
struct Cli {
    /// Configuration file (missing file means defaults)
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process every configured shard until Ctrl-C
    Run,
    /// Replay pending dead letters through the pipeline
    Replay {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// List dead letters
    DeadLetters {
        /// pending, exhausted or resolved
        #[arg(long)]
        status: Option<DeadLetterStatus>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show per-shard checkpoints
    Checkpoints,
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().or_else(|_| {
        tracing_subscriber::EnvFilter::try_new(format!("transaction_pipeline={}", logging.level))
    })?;

    if logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

/// Pick the alert sink: NATS when configured and reachable, the log otherwise
async fn alert_sink(config: &AppConfig) -> Arc<dyn AlertSink> {
    match &config.alerts.nats_url {
        Some(url) => match async_nats::connect(url.as_str()).await {
            Ok(client) => {
                info!("Connected to NATS at {}", url);
                info!("Publishing alerts to: {}", config.alerts.subject);
                Arc::new(NatsAlertSink::new(client, &config.alerts.subject))
            }
            Err(e) => {
                warn!(error = %e, url = %url, "Failed to connect to NATS, alerts go to the log");
                Arc::new(LogAlertSink)
            }
        },
        None => Arc::new(LogAlertSink),
    }
}

/// Everything the commands share
struct Runtime {
    config: AppConfig,
    db: Database,
    pipeline: Arc<TransactionPipeline>,
    metrics: Arc<PipelineMetrics>,
}

async fn build_runtime(config: AppConfig) -> Result<Runtime> {
    let db = Database::open(&config.storage.database_path)
        .with_context(|| format!("Failed to open database {}", config.storage.database_path))?;

    let metrics = Arc::new(PipelineMetrics::new());
    let alerts = AlertDispatcher::new(
        alert_sink(&config).await,
        Duration::from_millis(config.alerts.publish_timeout_ms),
        metrics.clone(),
    );
    let store = Arc::new(SqliteTransactionStore::new(db.clone(), config.history.clone()));
    let dead_letters = DeadLetterHandler::new(db.clone(), config.dead_letter.retry_budget, alerts.clone());

    let pipeline = TransactionPipeline::new(
        &config,
        PipelineParts {
            history: store.clone(),
            sink: store,
            dead_letters,
            alerts,
            metrics: metrics.clone(),
        },
    );

    Ok(Runtime {
        config,
        db,
        pipeline: Arc::new(pipeline),
        metrics,
    })
}

async fn run_pipeline(rt: Runtime) -> Result<()> {
    let config = &rt.config;
    let retry = RetryPolicy::from_config(&config.retry);
    let source = Arc::new(FileShardSource::new(&config.source.shard_dir));
    let shutdown = ShutdownHandle::new();

    let ctx = WorkerContext {
        ingestor: EventIngestor::new(source, retry.clone(), config.pipeline.batch_size),
        pipeline: rt.pipeline.clone(),
        checkpoints: CheckpointManager::new(Arc::new(SqliteCheckpointStore::new(rt.db.clone()))),
        batch_slots: Arc::new(Semaphore::new(config.pipeline.workers)),
        poll_interval: Duration::from_millis(config.pipeline.poll_interval_ms),
        pause: retry,
        shutdown: shutdown.clone(),
    };

    info!(
        shards = ?config.source.shards,
        shard_dir = %config.source.shard_dir,
        workers = config.pipeline.workers,
        batch_size = config.pipeline.batch_size,
        "Starting shard workers"
    );

    // Start metrics reporter (prints summary every 30 seconds)
    let reporter = tokio::spawn(MetricsReporter::new(rt.metrics.clone(), 30).start());

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, draining workers"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
        signal_shutdown.shutdown();
    });

    let handles: Vec<_> = config
        .source
        .shards
        .iter()
        .map(|&shard_id| {
            let worker = ShardWorker::new(shard_id, ctx.clone());
            (shard_id, tokio::spawn(worker.run()))
        })
        .collect();

    let (shard_ids, tasks): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
    let mut failed = 0;
    for (shard_id, joined) in shard_ids.into_iter().zip(join_all(tasks).await) {
        match joined {
            Ok(Ok(WorkerExit::Shutdown)) => info!(shard_id, "Worker stopped"),
            Ok(Ok(WorkerExit::ShardGone)) => warn!(shard_id, "Worker stopped: shard gone"),
            Ok(Err(e)) => {
                failed += 1;
                error!(shard_id, error = %e, "Worker failed");
            }
            Err(e) => {
                failed += 1;
                error!(shard_id, error = %e, "Worker task panicked");
            }
        }
    }

    reporter.abort();
    info!("Pipeline shutting down...");
    rt.metrics.print_summary();

    if failed > 0 {
        anyhow::bail!("{} shard worker(s) failed", failed);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from_path(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    init_logging(&config.logging)?;

    info!("Starting Transaction Pipeline");
    info!(
        "Risk buckets: low<{}, medium<{}, high>={}; hot window {} days; retry budget {}",
        config.scoring.thresholds.medium_from,
        config.scoring.thresholds.high_from,
        config.scoring.thresholds.high_from,
        config.routing.hot_window_days,
        config.dead_letter.retry_budget
    );

    let rt = build_runtime(config).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_pipeline(rt).await?,
        Command::Replay { limit } => {
            let summary = rt.pipeline.replay_dead_letters(limit).await?;
            println!(
                "replayed {} dead letters: {} resolved, {} failed ({} exhausted)",
                summary.replayed, summary.resolved, summary.failed, summary.exhausted
            );
        }
        Command::DeadLetters { status, limit } => {
            let entries = rt
                .pipeline
                .dead_letters()
                .list(DeadLetterQuery { status, limit })
                .await?;
            for entry in &entries {
                println!("{}", serde_json::to_string(entry)?);
            }
            info!(count = entries.len(), "Listed dead letters");
        }
        Command::Checkpoints => {
            let checkpoints = CheckpointManager::new(Arc::new(SqliteCheckpointStore::new(rt.db.clone())));
            for cp in checkpoints.all().await? {
                println!(
                    "shard {:>4}  offset {:>10}  next {:>10}  updated {}",
                    cp.shard_id,
                    cp.last_committed_offset,
                    cp.last_committed_offset + 1,
                    cp.updated_at.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}
