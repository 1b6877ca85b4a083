//! Fraud risk scoring components

pub mod aggregator;
pub mod factors;
pub mod scorer;

pub use aggregator::ScoreAggregator;
pub use factors::FactorExtractor;
pub use scorer::{RiskAssessment, RiskScorer};
