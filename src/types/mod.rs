//! Type definitions for the transaction pipeline

pub mod alert;
pub mod dead_letter;
pub mod risk;
pub mod transaction;

pub use alert::{Alert, AlertKind};
pub use dead_letter::{DeadLetterRecord, DeadLetterStatus, FailureKind};
pub use risk::{RiskBucket, RiskFactors, RiskThresholds};
pub use transaction::{Category, EnrichedTransaction, Location, RawRecord, TransactionEvent};
