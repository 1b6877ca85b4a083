//! Dead-letter record definitions

use crate::error::ShardId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a record was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Structural rejection by the validator
    Validation,
    /// Storage write failed after its retry budget
    Storage,
    /// Any other downstream failure
    Processing,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Storage => "storage",
            FailureKind::Processing => "processing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(FailureKind::Validation),
            "storage" => Some(FailureKind::Storage),
            "processing" => Some(FailureKind::Processing),
            _ => None,
        }
    }
}

/// Lifecycle of a dead-letter entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStatus {
    /// Captured, eligible for replay
    Pending,
    /// Attempt count exceeded the retry budget; alerted
    Exhausted,
    /// Replayed successfully
    Resolved,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Pending => "pending",
            DeadLetterStatus::Exhausted => "exhausted",
            DeadLetterStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeadLetterStatus::Pending),
            "exhausted" => Some(DeadLetterStatus::Exhausted),
            "resolved" => Some(DeadLetterStatus::Resolved),
            _ => None,
        }
    }
}

impl std::str::FromStr for DeadLetterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown dead-letter status '{}'", s))
    }
}

/// A failed record preserved for inspection and replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: i64,
    /// Logical identity: the transaction id, or a payload fingerprint
    pub record_key: String,
    pub shard_id: ShardId,
    pub offset: u64,
    pub payload: String,
    pub failure_kind: FailureKind,
    pub failure_reason: String,
    pub attempt_count: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub status: DeadLetterStatus,
}
