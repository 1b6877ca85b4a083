//! Storage tier routing: a pure decision over event time.

use crate::config::RoutingConfig;
use crate::types::transaction::EnrichedTransaction;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Storage tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    /// Recent, frequently queried
    Hot,
    /// Older, archival
    Cold,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Hot => "hot",
            StorageTier::Cold => "cold",
        }
    }

    /// Backing table in the SQLite sink
    pub(crate) fn table(&self) -> &'static str {
        match self {
            StorageTier::Hot => "hot_transactions",
            StorageTier::Cold => "cold_transactions",
        }
    }

    pub(crate) fn other(&self) -> StorageTier {
        match self {
            StorageTier::Hot => StorageTier::Cold,
            StorageTier::Cold => StorageTier::Hot,
        }
    }
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an enriched transaction is written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub tier: StorageTier,
    /// Event year-month, `YYYY-MM`
    pub partition_key: String,
}

/// Routes enriched transactions to a tier and partition
pub struct StorageRouter {
    hot_window: Duration,
}

impl StorageRouter {
    pub fn new(config: &RoutingConfig) -> Self {
        Self {
            hot_window: Duration::days(config.hot_window_days),
        }
    }

    /// Decide tier and partition relative to `now`.
    ///
    /// Events no older than the hot window (including future-dated ones) are HOT.
    pub fn route(&self, tx: &EnrichedTransaction, now: DateTime<Utc>) -> RoutingDecision {
        let age = now.signed_duration_since(tx.event.timestamp);
        let tier = if age <= self.hot_window {
            StorageTier::Hot
        } else {
            StorageTier::Cold
        };

        RoutingDecision {
            tier,
            partition_key: partition_key(&tx.event.timestamp),
        }
    }
}

/// Year-month partition key of an event time
pub fn partition_key(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m").to_string()
}
