//! Risk factor extraction.
//!
//! Turns an event, its category and the user's recent activity into
//! normalized [`RiskFactors`], each in `[0, 1]`.

use crate::config::ScoringConfig;
use crate::history::UserHistory;
use crate::types::risk::RiskFactors;
use crate::types::transaction::{Category, TransactionEvent};
use rust_decimal::prelude::ToPrimitive;

/// Extracts scoring factors from a transaction.
pub struct FactorExtractor {
    config: ScoringConfig,
}

impl FactorExtractor {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// Factors for an event scored against the user's history.
    ///
    /// With `None` only amount and category are available; the amount is then
    /// measured against the configured reference amount.
    pub fn extract(
        &self,
        event: &TransactionEvent,
        category: Category,
        history: Option<&UserHistory>,
    ) -> RiskFactors {
        let amount = event.amount.to_f64().unwrap_or(0.0);
        let category_weight = self.config.category_weights.weight(category).clamp(0.0, 1.0);

        let Some(history) = history else {
            return RiskFactors {
                amount_deviation: self.reference_ratio(amount),
                category_weight,
                location_mismatch: None,
                velocity: None,
            };
        };

        let amount_deviation = match history.trailing_average() {
            Some(avg) if avg > 0.0 => self.deviation(amount, avg),
            // No baseline to deviate from
            _ => self.reference_ratio(amount),
        };

        let location_mismatch = match &event.location {
            Some(location) if !history.locations.is_empty() => {
                let known = history
                    .locations
                    .iter()
                    .any(|seen| seen.matches(location, self.config.geo_match_radius_km));
                Some(if known { 0.0 } else { 1.0 })
            }
            _ => None,
        };

        let saturation = self.config.velocity_saturation.max(1) as f64;
        let velocity = Some((history.recent_count as f64 / saturation).clamp(0.0, 1.0));

        RiskFactors {
            amount_deviation,
            category_weight,
            location_mismatch,
            velocity,
        }
    }

    /// `(amount / avg - 1) / (saturation - 1)`; at or below the average is 0
    fn deviation(&self, amount: f64, avg: f64) -> f64 {
        let span = (self.config.amount_deviation_saturation - 1.0).max(f64::EPSILON);
        ((amount / avg - 1.0) / span).clamp(0.0, 1.0)
    }

    fn reference_ratio(&self, amount: f64) -> f64 {
        if self.config.reference_amount <= 0.0 {
            return 0.0;
        }
        (amount / self.config.reference_amount).clamp(0.0, 1.0)
    }
}

impl Default for FactorExtractor {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}
