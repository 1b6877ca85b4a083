//! Error taxonomy for the transaction pipeline

use thiserror::Error;

/// Identifier of a stream shard
pub type ShardId = u32;

/// Structural rejection of a raw record. Terminal: never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct ValidationError {
    /// Offending field (or `payload` when the record is not an object)
    pub field: String,
    /// Human readable reason, used verbatim as the dead-letter failure reason
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a required field that is absent or empty
    pub fn missing(field: &str) -> Self {
        Self::new(field, format!("missing {}", field))
    }
}

/// Failure reported by a shard source for a single pull attempt
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    /// The shard could not be reached right now; worth retrying
    #[error("shard {shard_id} unavailable: {reason}")]
    Unavailable { shard_id: ShardId, reason: String },

    /// The shard no longer exists
    #[error("shard {0} is gone")]
    Gone(ShardId),
}

/// Failure reported by the storage sink, the dead-letter store or the checkpoint store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage saturated: no write slot within {0} ms")]
    Saturated(u64),

    #[error("storage task failed: {0}")]
    Task(String),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

/// Failure of the recent-activity lookup. Never fatal: scoring degrades instead.
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("history unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Top-level pipeline error
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("validation failed on {}: {}", .0.field, .0.reason)]
    Validation(#[from] ValidationError),

    /// Retryable I/O failure after the retry budget ran out
    #[error("{operation} failed after {attempts} attempts: {message}")]
    TransientIo {
        operation: &'static str,
        attempts: u32,
        message: String,
    },

    #[error("shard {shard_id} unavailable after {attempts} attempts: {reason}")]
    ShardUnavailable {
        shard_id: ShardId,
        attempts: u32,
        reason: String,
    },

    #[error("shard {0} is permanently gone")]
    ShardGone(ShardId),

    /// Fatal for the owning worker
    #[error("checkpoint commit failed for shard {shard_id} at offset {offset}: {message}")]
    CheckpointCommit {
        shard_id: ShardId,
        offset: u64,
        message: String,
    },

    #[error("dead-letter capture failed: {0}")]
    DeadLetter(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_displays_reason_only() {
        let err = ValidationError::missing("transaction_id");
        assert_eq!(err.to_string(), "missing transaction_id");
        assert_eq!(err.field, "transaction_id");
    }

    #[test]
    fn test_pipeline_error_wraps_validation() {
        let err: PipelineError = ValidationError::new("amount", "amount must be greater than zero").into();
        assert_eq!(
            err.to_string(),
            "validation failed on amount: amount must be greater than zero"
        );
    }
}
