//! Throughput and outcome counters for the transaction pipeline.

use crate::router::StorageTier;
use crate::types::alert::AlertKind;
use crate::types::dead_letter::FailureKind;
use crate::types::risk::RiskBucket;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Metrics collector shared by every shard worker
pub struct PipelineMetrics {
    /// Records that were scored
    pub transactions_processed: AtomicU64,
    pub stored_hot: AtomicU64,
    pub stored_cold: AtomicU64,
    /// Records scored without user history
    pub degraded_scores: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub alerts_generated: AtomicU64,
    pub alert_failures: AtomicU64,
    pub checkpoints_committed: AtomicU64,
    alerts_by_kind: RwLock<HashMap<String, u64>>,
    buckets: RwLock<HashMap<String, u64>>,
    dead_letters_by_kind: RwLock<HashMap<String, u64>>,
    /// Processing times (in microseconds)
    processing_times: RwLock<Vec<u64>>,
    /// Risk score distribution, ten points per bucket
    score_buckets: RwLock<[u64; 10]>,
    start_time: Instant,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub stored_hot: u64,
    pub stored_cold: u64,
    pub degraded: u64,
    pub dead_lettered: u64,
    pub alerts: u64,
    pub alert_failures: u64,
    pub checkpoints: u64,
}

fn bump(map: &RwLock<HashMap<String, u64>>, key: &str) {
    if let Ok(mut map) = map.write() {
        *map.entry(key.to_string()).or_insert(0) += 1;
    }
}

fn read_map(map: &RwLock<HashMap<String, u64>>) -> HashMap<String, u64> {
    map.read().map(|m| m.clone()).unwrap_or_default()
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            transactions_processed: AtomicU64::new(0),
            stored_hot: AtomicU64::new(0),
            stored_cold: AtomicU64::new(0),
            degraded_scores: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            alerts_generated: AtomicU64::new(0),
            alert_failures: AtomicU64::new(0),
            checkpoints_committed: AtomicU64::new(0),
            alerts_by_kind: RwLock::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
            dead_letters_by_kind: RwLock::new(HashMap::new()),
            processing_times: RwLock::new(Vec::with_capacity(1000)),
            score_buckets: RwLock::new([0; 10]),
            start_time: Instant::now(),
        }
    }

    /// Record a scored transaction
    pub fn record_scored(&self, processing_time: Duration, risk_score: u8, bucket: RiskBucket, degraded: bool) {
        self.transactions_processed.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.degraded_scores.fetch_add(1, Ordering::Relaxed);
        }
        bump(&self.buckets, bucket.as_str());

        if let Ok(mut times) = self.processing_times.write() {
            times.push(processing_time.as_micros() as u64);
            // Keep only the most recent window
            if times.len() > 10000 {
                times.drain(0..5000);
            }
        }

        let slot = (risk_score.saturating_sub(1) / 10).min(9) as usize;
        if let Ok(mut slots) = self.score_buckets.write() {
            slots[slot] += 1;
        }
    }

    pub fn record_stored(&self, tier: StorageTier) {
        match tier {
            StorageTier::Hot => self.stored_hot.fetch_add(1, Ordering::Relaxed),
            StorageTier::Cold => self.stored_cold.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_dead_letter(&self, kind: FailureKind) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        bump(&self.dead_letters_by_kind, kind.as_str());
    }

    pub fn record_alert(&self, kind: AlertKind) {
        self.alerts_generated.fetch_add(1, Ordering::Relaxed);
        bump(&self.alerts_by_kind, kind.as_str());
    }

    pub fn record_alert_failure(&self) {
        self.alert_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self) {
        self.checkpoints_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get processing time statistics
    pub fn get_processing_stats(&self) -> ProcessingStats {
        let mut sorted = match self.processing_times.read() {
            Ok(times) if !times.is_empty() => times.clone(),
            _ => return ProcessingStats::default(),
        };
        sorted.sort_unstable();

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len();
        let at = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];

        ProcessingStats {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: at(0.5),
            p95_us: at(0.95),
            p99_us: at(0.99),
            max_us: sorted[count - 1],
        }
    }

    /// Transactions per second since startup
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.transactions_processed.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn get_score_distribution(&self) -> [u64; 10] {
        self.score_buckets.read().map(|s| *s).unwrap_or([0; 10])
    }

    pub fn alerts_by_kind(&self) -> HashMap<String, u64> {
        read_map(&self.alerts_by_kind)
    }

    pub fn risk_buckets(&self) -> HashMap<String, u64> {
        read_map(&self.buckets)
    }

    pub fn dead_letters_by_kind(&self) -> HashMap<String, u64> {
        read_map(&self.dead_letters_by_kind)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.transactions_processed.load(Ordering::Relaxed),
            stored_hot: self.stored_hot.load(Ordering::Relaxed),
            stored_cold: self.stored_cold.load(Ordering::Relaxed),
            degraded: self.degraded_scores.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            alerts: self.alerts_generated.load(Ordering::Relaxed),
            alert_failures: self.alert_failures.load(Ordering::Relaxed),
            checkpoints: self.checkpoints_committed.load(Ordering::Relaxed),
        }
    }

    /// Print summary statistics
    pub fn print_summary(&self) {
        let snapshot = self.snapshot();
        let processing = self.get_processing_stats();
        let throughput = self.get_throughput();
        let high_rate = if snapshot.processed > 0 {
            let high = self
                .risk_buckets()
                .get(RiskBucket::HighRisk.as_str())
                .copied()
                .unwrap_or(0);
            (high as f64 / snapshot.processed as f64) * 100.0
        } else {
            0.0
        };

        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║            TRANSACTION PIPELINE - METRICS SUMMARY            ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Transactions Scored:    {:>8}  │  Throughput: {:>6.1} tx/s ║",
            snapshot.processed, throughput
        );
        info!(
            "║ Stored hot / cold: {:>6} / {:<6} │  High Risk:  {:>6.1}%     ║",
            snapshot.stored_hot, snapshot.stored_cold, high_rate
        );
        info!(
            "║ Dead Lettered: {:>6}  Degraded: {:>6}  Checkpoints: {:>6} ║",
            snapshot.dead_lettered, snapshot.degraded, snapshot.checkpoints
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Processing Time (μs): mean={:>5} p50={:>5} p95={:>5} p99={:>5} ║",
            processing.mean_us, processing.p50_us, processing.p95_us, processing.p99_us
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Alerts: {:>6} (failed deliveries: {:>4})                     ║",
            snapshot.alerts, snapshot.alert_failures
        );
        for (kind, count) in &self.alerts_by_kind() {
            info!("║   {:22}: {:>6}                            ║", kind, count);
        }
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Risk Score Distribution:                                     ║");
        let score_dist = self.get_score_distribution();
        let total: u64 = score_dist.iter().sum();
        for (i, &count) in score_dist.iter().enumerate() {
            let pct = if total > 0 { (count as f64 / total as f64) * 100.0 } else { 0.0 };
            let bar: String = "█".repeat(((pct / 2.0) as usize).min(20));
            info!(
                "║   {:>3}-{:<3}: {:>6} ({:>5.1}%) {}",
                i * 10 + 1,
                (i + 1) * 10,
                count,
                pct,
                bar
            );
        }
        info!("╚══════════════════════════════════════════════════════════════╝");
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Processing time statistics
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Prints a periodic summary while the pipeline runs
pub struct MetricsReporter {
    metrics: Arc<PipelineMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<PipelineMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = PipelineMetrics::new();

        metrics.record_scored(Duration::from_micros(100), 12, RiskBucket::LowRisk, false);
        metrics.record_scored(Duration::from_micros(200), 84, RiskBucket::HighRisk, true);
        metrics.record_stored(StorageTier::Hot);
        metrics.record_stored(StorageTier::Cold);
        metrics.record_dead_letter(FailureKind::Validation);
        metrics.record_alert(AlertKind::HighRisk);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.degraded, 1);
        assert_eq!(snapshot.stored_hot, 1);
        assert_eq!(snapshot.stored_cold, 1);
        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(snapshot.alerts, 1);
        assert_eq!(metrics.alerts_by_kind().get("high_risk"), Some(&1));
        assert_eq!(metrics.dead_letters_by_kind().get("validation"), Some(&1));
        assert_eq!(metrics.risk_buckets().get("HIGH_RISK"), Some(&1));
    }

    #[test]
    fn test_score_distribution_edges() {
        let metrics = PipelineMetrics::new();
        for score in [1, 10, 11, 100] {
            metrics.record_scored(Duration::from_micros(5), score, RiskBucket::LowRisk, false);
        }

        let dist = metrics.get_score_distribution();
        assert_eq!(dist[0], 2);
        assert_eq!(dist[1], 1);
        assert_eq!(dist[9], 1);
    }

    #[test]
    fn test_processing_stats() {
        let metrics = PipelineMetrics::new();
        assert_eq!(metrics.get_processing_stats().count, 0);

        for us in [100, 200, 300] {
            metrics.record_scored(Duration::from_micros(us), 50, RiskBucket::MediumRisk, false);
        }
        let stats = metrics.get_processing_stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.mean_us, 200);
        assert_eq!(stats.max_us, 300);
    }
}
