//! Fraud risk scorer

use crate::config::ScoringConfig;
use crate::history::{HistoryLookup, UserHistory};
use crate::retry::RetryPolicy;
use crate::scoring::aggregator::ScoreAggregator;
use crate::scoring::factors::FactorExtractor;
use crate::types::risk::{RiskBucket, RiskFactors, RiskThresholds};
use crate::types::transaction::{Category, EnrichedTransaction, TransactionEvent};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of scoring one event
#[derive(Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    /// Integer score in 1..=100
    pub score: u8,
    pub bucket: RiskBucket,
    pub factors: RiskFactors,
    /// Scored without the user's history
    pub degraded: bool,
}

impl RiskAssessment {
    /// Attach the assessment to its event
    pub fn enrich(
        self,
        event: TransactionEvent,
        category: Category,
        processed_at: DateTime<Utc>,
    ) -> EnrichedTransaction {
        EnrichedTransaction {
            event,
            category,
            risk_score: self.score,
            risk_bucket: self.bucket,
            risk_factors: self.factors,
            degraded_context: self.degraded,
            processed_at,
        }
    }
}

/// Scores validated events against the user's recent activity.
///
/// Never fails: if the history lookup errors or times out after its retry
/// budget, the event is scored from amount and category alone.
pub struct RiskScorer {
    extractor: FactorExtractor,
    aggregator: ScoreAggregator,
    thresholds: RiskThresholds,
    history: Arc<dyn HistoryLookup>,
    retry: RetryPolicy,
}

impl RiskScorer {
    pub fn new(config: &ScoringConfig, history: Arc<dyn HistoryLookup>, retry: RetryPolicy) -> Self {
        Self {
            extractor: FactorExtractor::new(config.clone()),
            aggregator: ScoreAggregator::new(config.weights.clone()),
            thresholds: config.thresholds.clone(),
            history,
            retry,
        }
    }

    /// Score with a history lookup
    pub async fn score(&self, event: &TransactionEvent, category: Category) -> RiskAssessment {
        let history = &self.history;
        let user_id = event.user_id.as_str();
        let transaction_id = event.transaction_id.as_str();

        let lookup = self
            .retry
            .run("history_lookup", move |_| {
                history.recent_activity(user_id, transaction_id)
            })
            .await;

        match lookup {
            Ok(recent) => self.assess(event, category, Some(&recent)),
            Err(e) => {
                warn!(
                    transaction_id = %event.transaction_id,
                    user_id = %event.user_id,
                    error = %e,
                    "History unavailable, scoring with degraded context"
                );
                self.assess(event, category, None)
            }
        }
    }

    /// Pure scoring step. `None` history means degraded context.
    pub fn assess(
        &self,
        event: &TransactionEvent,
        category: Category,
        history: Option<&UserHistory>,
    ) -> RiskAssessment {
        let factors = self.extractor.extract(event, category, history);
        let aggregate = self.aggregator.aggregate(&factors);
        let score = ScoreAggregator::to_score(aggregate);
        let bucket = RiskBucket::from_score(score, &self.thresholds);

        debug!(
            transaction_id = %event.transaction_id,
            score,
            bucket = %bucket,
            degraded = history.is_none(),
            "Scored transaction"
        );

        RiskAssessment {
            score,
            bucket,
            factors,
            degraded: history.is_none(),
        }
    }

    pub fn thresholds(&self) -> &RiskThresholds {
        &self.thresholds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryHistory;
    use crate::types::transaction::Location;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn event(amount: i64, user: &str, place: &str) -> TransactionEvent {
        TransactionEvent {
            transaction_id: "t1".to_string(),
            amount: Decimal::new(amount, 0),
            merchant_mcc: "5732".to_string(),
            location: Some(Location::Named(place.to_string())),
            timestamp: Utc::now(),
            user_id: user.to_string(),
            raw_payload: "{}".to_string(),
        }
    }

    fn scorer(history: Arc<InMemoryHistory>) -> RiskScorer {
        RiskScorer::new(
            &ScoringConfig::default(),
            history,
            RetryPolicy::once(Duration::from_millis(200)),
        )
    }

    #[tokio::test]
    async fn test_deviant_purchase_in_new_city_is_high_risk() {
        let history = Arc::new(InMemoryHistory::new());
        history.insert(
            "u1",
            UserHistory {
                amounts: vec![40.0, 50.0, 60.0],
                locations: vec![Location::Named("Springfield".to_string())],
                recent_count: 2,
            },
        );

        let assessment = scorer(history).score(&event(500, "u1", "new city"), Category::Electronics).await;

        assert_eq!(assessment.score, 84);
        assert_eq!(assessment.bucket, RiskBucket::HighRisk);
        assert!(!assessment.degraded);
    }

    #[tokio::test]
    async fn test_routine_purchase_is_low_risk() {
        let history = Arc::new(InMemoryHistory::new());
        history.insert(
            "u2",
            UserHistory {
                amounts: vec![45.0, 55.0],
                locations: vec![Location::Named("Austin".to_string())],
                recent_count: 1,
            },
        );

        let assessment = scorer(history).score(&event(50, "u2", "Austin"), Category::Grocery).await;
        assert_eq!(assessment.bucket, RiskBucket::LowRisk);
    }

    #[tokio::test]
    async fn test_outage_degrades_instead_of_failing() {
        let history = Arc::new(InMemoryHistory::new());
        history.set_available(false);

        let assessment = scorer(history).score(&event(500, "u1", "new city"), Category::Electronics).await;

        assert!(assessment.degraded);
        assert_eq!(assessment.factors.location_mismatch, None);
        assert_eq!(assessment.factors.velocity, None);
        // (0.35 * 0.5 + 0.2 * 0.8) / 0.55 = 0.609
        assert_eq!(assessment.score, 61);
        assert_eq!(assessment.bucket, RiskBucket::MediumRisk);
    }

    #[test]
    fn test_scores_stay_in_range() {
        let scorer = scorer(Arc::new(InMemoryHistory::new()));
        for amount in [1, 10, 1_000, 1_000_000] {
            for category in Category::ALL {
                let a = scorer.assess(&event(amount, "u", "x"), category, None);
                assert!((1..=100).contains(&a.score));
                assert_eq!(a.bucket, RiskBucket::from_score(a.score, scorer.thresholds()));
            }
        }
    }

    #[test]
    fn test_enrich_carries_assessment() {
        let scorer = scorer(Arc::new(InMemoryHistory::new()));
        let ev = event(500, "u1", "new city");
        let assessment = scorer.assess(&ev, Category::Electronics, None);
        let now = Utc::now();
        let enriched = assessment.clone().enrich(ev, Category::Electronics, now);

        assert_eq!(enriched.risk_score, assessment.score);
        assert_eq!(enriched.category, Category::Electronics);
        assert!(enriched.degraded_context);
        assert_eq!(enriched.processed_at, now);
    }
}
