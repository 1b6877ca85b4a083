//! Alert data structures

use crate::error::ShardId;
use crate::types::dead_letter::DeadLetterRecord;
use crate::types::risk::RiskBucket;
use crate::types::transaction::EnrichedTransaction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Factor level at which a factor is reported as triggered on an alert
const TRIGGER_LEVEL: f64 = 0.5;

/// What raised the alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A transaction classified HIGH_RISK
    HighRisk,
    /// A dead-letter record exceeded its retry budget
    DeadLetterExhausted,
    /// A shard could not be reached within its retry budget
    ShardUnavailable,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HighRisk => "high_risk",
            AlertKind::DeadLetterExhausted => "dead_letter_exhausted",
            AlertKind::ShardUnavailable => "shard_unavailable",
        }
    }
}

/// Alert published to the alerting sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique alert identifier
    pub alert_id: String,

    pub kind: AlertKind,

    /// Transaction id, dead-letter record key, or shard name
    pub subject: String,

    pub user_id: Option<String>,

    pub risk_score: Option<u8>,

    pub risk_bucket: Option<RiskBucket>,

    /// Scoring factors that contributed to the alert
    pub triggered_features: Vec<String>,

    /// Additional context
    pub message: String,

    /// Alert generation timestamp
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    fn new(kind: AlertKind, subject: String, message: String) -> Self {
        Self {
            alert_id: uuid::Uuid::new_v4().to_string(),
            kind,
            subject,
            user_id: None,
            risk_score: None,
            risk_bucket: None,
            triggered_features: Vec::new(),
            message,
            timestamp: Utc::now(),
        }
    }

    /// Alert for a HIGH_RISK classification
    pub fn high_risk(tx: &EnrichedTransaction) -> Self {
        let mut message = format!(
            "{} {} at MCC {} ({})",
            tx.event.amount, tx.risk_bucket, tx.event.merchant_mcc, tx.category
        );
        if tx.degraded_context {
            message.push_str(", scored without history");
        }

        let mut alert = Self::new(AlertKind::HighRisk, tx.event.transaction_id.clone(), message);
        alert.user_id = Some(tx.event.user_id.clone());
        alert.risk_score = Some(tx.risk_score);
        alert.risk_bucket = Some(tx.risk_bucket);
        alert.triggered_features = tx.risk_factors.triggered(TRIGGER_LEVEL);
        alert
    }

    /// Alert for a dead-letter record that ran out of attempts
    pub fn dead_letter(record: &DeadLetterRecord) -> Self {
        Self::new(
            AlertKind::DeadLetterExhausted,
            record.record_key.clone(),
            format!(
                "{} failure after {} attempts (shard {}, offset {}): {}",
                record.failure_kind.as_str(),
                record.attempt_count,
                record.shard_id,
                record.offset,
                record.failure_reason
            ),
        )
    }

    /// Alert for a shard that stayed unreachable
    pub fn shard_unavailable(shard_id: ShardId, reason: &str) -> Self {
        Self::new(
            AlertKind::ShardUnavailable,
            format!("shard-{}", shard_id),
            reason.to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::dead_letter::{DeadLetterStatus, FailureKind};

    #[test]
    fn test_dead_letter_alert_message() {
        let record = DeadLetterRecord {
            id: 7,
            record_key: "t9".to_string(),
            shard_id: 2,
            offset: 41,
            payload: "{}".to_string(),
            failure_kind: FailureKind::Storage,
            failure_reason: "disk full".to_string(),
            attempt_count: 4,
            first_seen_at: Utc::now(),
            last_failed_at: Utc::now(),
            status: DeadLetterStatus::Exhausted,
        };

        let alert = Alert::dead_letter(&record);
        assert_eq!(alert.kind, AlertKind::DeadLetterExhausted);
        assert_eq!(alert.subject, "t9");
        assert!(alert.message.contains("after 4 attempts"));
        assert!(alert.risk_score.is_none());
    }

    #[test]
    fn test_alert_serialization() {
        let alert = Alert::shard_unavailable(3, "connection refused");

        let json = serde_json::to_string(&alert).unwrap();
        let deserialized: Alert = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.kind, AlertKind::ShardUnavailable);
        assert_eq!(deserialized.subject, "shard-3");
        assert_eq!(alert.alert_id, deserialized.alert_id);
    }
}
