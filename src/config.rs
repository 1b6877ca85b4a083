//! Configuration management for the transaction pipeline

use crate::error::ShardId;
use crate::types::risk::RiskThresholds;
use crate::types::transaction::Category;
use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Stream input configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Directory holding `shard-<id>.jsonl` files
    pub shard_dir: String,
    /// Shards consumed by this process
    pub shards: Vec<ShardId>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            shard_dir: "data/shards".to_string(),
            shards: vec![0, 1, 2, 3],
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of shard batches processed concurrently
    pub workers: usize,
    /// Maximum records pulled per batch
    pub batch_size: usize,
    /// Idle wait when a shard has no new records
    pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 100,
            poll_interval_ms: 500,
        }
    }
}

/// Retry budget for external calls (shard pulls, history lookups, storage writes)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Timeout applied to each individual attempt
    pub call_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            call_timeout_ms: 2_000,
        }
    }
}

/// Relative weight of each scoring factor
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FactorWeights {
    pub amount_deviation: f64,
    pub category: f64,
    pub location_mismatch: f64,
    pub velocity: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            amount_deviation: 0.35,
            category: 0.20,
            location_mismatch: 0.30,
            velocity: 0.15,
        }
    }
}

/// Static per-category risk weight, each in [0, 1]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CategoryWeights {
    pub grocery: f64,
    pub clothing: f64,
    pub gas: f64,
    pub electronics: f64,
    pub dining: f64,
    pub unknown: f64,
}

impl CategoryWeights {
    pub fn weight(&self, category: Category) -> f64 {
        match category {
            Category::Grocery => self.grocery,
            Category::Clothing => self.clothing,
            Category::Gas => self.gas,
            Category::Electronics => self.electronics,
            Category::Dining => self.dining,
            Category::Unknown => self.unknown,
        }
    }
}

impl Default for CategoryWeights {
    fn default() -> Self {
        Self {
            grocery: 0.10,
            clothing: 0.30,
            gas: 0.60,
            electronics: 0.80,
            dining: 0.20,
            unknown: 0.50,
        }
    }
}

/// Fraud scoring policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    #[serde(default)]
    pub weights: FactorWeights,
    #[serde(default)]
    pub category_weights: CategoryWeights,
    #[serde(default)]
    pub thresholds: RiskThresholds,
    /// Amount / trailing average ratio at which the deviation factor saturates
    pub amount_deviation_saturation: f64,
    /// Amount at which the amount factor saturates when no history is available
    pub reference_amount: f64,
    /// Transactions in the trailing window at which velocity saturates
    pub velocity_saturation: u32,
    /// Geo points closer than this are the same place
    pub geo_match_radius_km: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: FactorWeights::default(),
            category_weights: CategoryWeights::default(),
            thresholds: RiskThresholds::default(),
            amount_deviation_saturation: 5.0,
            reference_amount: 1_000.0,
            velocity_saturation: 10,
            geo_match_radius_km: 50.0,
        }
    }
}

/// Storage tier routing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Events newer than this many days go to the hot tier
    pub hot_window_days: i64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { hot_window_days: 90 }
    }
}

/// Dead-letter policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Attempts allowed before a record is terminally dead-lettered and alerted
    pub retry_budget: u32,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self { retry_budget: 3 }
    }
}

/// Storage sink configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding both tiers, checkpoints and dead letters
    pub database_path: String,
    /// Upper bound on concurrent writes across all workers
    pub max_in_flight_writes: usize,
    /// How long a write waits for a free slot before failing
    pub write_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "data/pipeline.db".to_string(),
            max_in_flight_writes: 16,
            write_timeout_ms: 2_000,
        }
    }
}

/// Recent-activity lookup configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// How far back amounts and locations are sampled
    pub lookback_days: i64,
    /// Maximum transactions sampled per user
    pub max_samples: usize,
    /// Trailing window for the velocity count
    pub velocity_window_minutes: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            max_samples: 50,
            velocity_window_minutes: 60,
        }
    }
}

/// Alerting sink configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// NATS server URL; alerts are only logged when absent
    pub nats_url: Option<String>,
    /// Subject for outgoing alerts
    pub subject: String,
    pub publish_timeout_ms: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            nats_url: None,
            subject: "pipeline.alerts".to_string(),
            publish_timeout_ms: 1_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default file
    pub fn load() -> Result<Self> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific path, then apply `PIPELINE__*` overrides
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(Environment::with_prefix("PIPELINE").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.source.shards.is_empty() {
            bail!("source.shards must name at least one shard");
        }
        if self.pipeline.workers == 0 || self.pipeline.batch_size == 0 {
            bail!("pipeline.workers and pipeline.batch_size must be positive");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.multiplier < 1.0 {
            bail!("retry.multiplier must be >= 1.0");
        }
        let t = &self.scoring.thresholds;
        if !(1 < t.medium_from && t.medium_from < t.high_from && t.high_from <= 100) {
            bail!(
                "scoring.thresholds must satisfy 1 < medium_from < high_from <= 100 (got {} / {})",
                t.medium_from,
                t.high_from
            );
        }
        let w = &self.scoring.weights;
        let weights = [w.amount_deviation, w.category, w.location_mismatch, w.velocity];
        if weights.iter().any(|&x| x < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            bail!("scoring.weights must be non-negative with a positive sum");
        }
        if self.scoring.amount_deviation_saturation <= 1.0 {
            bail!("scoring.amount_deviation_saturation must be > 1.0");
        }
        if self.scoring.reference_amount <= 0.0 || self.scoring.velocity_saturation == 0 {
            bail!("scoring.reference_amount and scoring.velocity_saturation must be positive");
        }
        if self.routing.hot_window_days <= 0 {
            bail!("routing.hot_window_days must be positive");
        }
        if self.storage.max_in_flight_writes == 0 {
            bail!("storage.max_in_flight_writes must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.scoring.thresholds.medium_from, 34);
        assert_eq!(config.scoring.thresholds.high_from, 67);
        assert_eq!(config.routing.hot_window_days, 90);
        assert_eq!(config.dead_letter.retry_budget, 3);
        assert!(config.alerts.nats_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_category_weights_cover_every_category() {
        let weights = CategoryWeights::default();
        for category in Category::ALL {
            let w = weights.weight(category);
            assert!((0.0..=1.0).contains(&w));
        }
        assert!(weights.weight(Category::Electronics) > weights.weight(Category::Grocery));
        assert!(weights.weight(Category::Gas) > weights.weight(Category::Grocery));
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut config = AppConfig::default();
        config.scoring.thresholds = RiskThresholds {
            medium_from: 70,
            high_from: 40,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[pipeline]\nworkers = 2\nbatch_size = 10\npoll_interval_ms = 50\n\n[routing]\nhot_window_days = 30"
        )
        .unwrap();

        let config = AppConfig::load_from_path(&path).unwrap();
        assert_eq!(config.pipeline.workers, 2);
        assert_eq!(config.pipeline.batch_size, 10);
        assert_eq!(config.routing.hot_window_days, 30);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_partial_section_fills_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "[storage]\ndatabase_path = \"other.db\"\n").unwrap();

        let config = AppConfig::load_from_path(&path).unwrap();
        assert_eq!(config.storage.database_path, "other.db");
        assert_eq!(config.storage.max_in_flight_writes, 16);
    }
}
