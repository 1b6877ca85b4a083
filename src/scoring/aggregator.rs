//! Weighted aggregation of risk factors

use crate::config::FactorWeights;
use crate::types::risk::RiskFactors;

/// Combines factors into a single score.
///
/// Factors that are absent do not count towards the total weight, so a
/// record scored with fewer factors is not pulled towards zero.
pub struct ScoreAggregator {
    weights: FactorWeights,
}

impl ScoreAggregator {
    pub fn new(weights: FactorWeights) -> Self {
        Self { weights }
    }

    /// Weighted average of the present factors, in `[0, 1]`
    pub fn aggregate(&self, factors: &RiskFactors) -> f64 {
        let present = [
            Some((factors.amount_deviation, self.weights.amount_deviation)),
            Some((factors.category_weight, self.weights.category)),
            factors.location_mismatch.map(|v| (v, self.weights.location_mismatch)),
            factors.velocity.map(|v| (v, self.weights.velocity)),
        ];

        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        for (value, weight) in present.into_iter().flatten() {
            let weight = weight.max(0.0);
            weighted_sum += value * weight;
            total_weight += weight;
        }

        if total_weight > 0.0 {
            (weighted_sum / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Map an aggregate in `[0, 1]` onto the 1..=100 score range
    pub fn to_score(aggregate: f64) -> u8 {
        let x = if aggregate.is_finite() { aggregate.clamp(0.0, 1.0) } else { 0.0 };
        (1.0 + (99.0 * x).round()).clamp(1.0, 100.0) as u8
    }
}

impl Default for ScoreAggregator {
    fn default() -> Self {
        Self::new(FactorWeights::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_aggregation() {
        let aggregator = ScoreAggregator::default();
        let factors = RiskFactors {
            amount_deviation: 1.0,
            category_weight: 0.8,
            location_mismatch: Some(1.0),
            velocity: Some(0.2),
        };

        // 0.35 + 0.16 + 0.30 + 0.03
        let aggregated = aggregator.aggregate(&factors);
        assert!((aggregated - 0.84).abs() < 1e-9);
        assert_eq!(ScoreAggregator::to_score(aggregated), 84);
    }

    #[test]
    fn test_missing_factors_renormalize() {
        let aggregator = ScoreAggregator::default();
        let factors = RiskFactors {
            amount_deviation: 0.5,
            category_weight: 0.8,
            location_mismatch: None,
            velocity: None,
        };

        // (0.175 + 0.16) / 0.55
        let aggregated = aggregator.aggregate(&factors);
        assert!((aggregated - 0.335 / 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_zero_weights() {
        let aggregator = ScoreAggregator::new(FactorWeights {
            amount_deviation: 0.0,
            category: 0.0,
            location_mismatch: 0.0,
            velocity: 0.0,
        });
        assert_eq!(aggregator.aggregate(&RiskFactors::default()), 0.0);
    }

    #[test]
    fn test_score_range() {
        assert_eq!(ScoreAggregator::to_score(0.0), 1);
        assert_eq!(ScoreAggregator::to_score(1.0), 100);
        assert_eq!(ScoreAggregator::to_score(-3.0), 1);
        assert_eq!(ScoreAggregator::to_score(7.0), 100);
        assert_eq!(ScoreAggregator::to_score(f64::NAN), 1);
        assert_eq!(ScoreAggregator::to_score(0.5), 51);
    }
}
