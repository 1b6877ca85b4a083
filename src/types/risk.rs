//! Risk score bucketing

use serde::{Deserialize, Serialize};

/// Risk bucket derived from the 1–100 risk score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskBucket {
    LowRisk,
    MediumRisk,
    HighRisk,
}

impl RiskBucket {
    /// Determine the bucket for a score under the given thresholds
    pub fn from_score(score: u8, thresholds: &RiskThresholds) -> Self {
        if score >= thresholds.high_from {
            RiskBucket::HighRisk
        } else if score >= thresholds.medium_from {
            RiskBucket::MediumRisk
        } else {
            RiskBucket::LowRisk
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBucket::LowRisk => "LOW_RISK",
            RiskBucket::MediumRisk => "MEDIUM_RISK",
            RiskBucket::HighRisk => "HIGH_RISK",
        }
    }
}

impl std::fmt::Display for RiskBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configurable bucket boundaries (inclusive lower bounds)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// First score classified MEDIUM_RISK
    pub medium_from: u8,
    /// First score classified HIGH_RISK
    pub high_from: u8,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            medium_from: 34,
            high_from: 67,
        }
    }
}

/// Normalized contribution of each scoring factor, all in [0, 1].
///
/// Factors that could not be computed (no history) are `None` and do not
/// take part in the weighted average.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskFactors {
    pub amount_deviation: f64,
    pub category_weight: f64,
    pub location_mismatch: Option<f64>,
    pub velocity: Option<f64>,
}

impl RiskFactors {
    /// Names of the factors that fired at or above `level`
    pub fn triggered(&self, level: f64) -> Vec<String> {
        let mut triggered = Vec::new();
        if self.amount_deviation >= level {
            triggered.push("amount_deviation".to_string());
        }
        if self.category_weight >= level {
            triggered.push("category_weight".to_string());
        }
        if self.location_mismatch.is_some_and(|v| v >= level) {
            triggered.push("location_mismatch".to_string());
        }
        if self.velocity.is_some_and(|v| v >= level) {
            triggered.push("velocity".to_string());
        }
        triggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_boundaries() {
        let thresholds = RiskThresholds::default();

        assert_eq!(RiskBucket::from_score(1, &thresholds), RiskBucket::LowRisk);
        assert_eq!(RiskBucket::from_score(33, &thresholds), RiskBucket::LowRisk);
        assert_eq!(RiskBucket::from_score(34, &thresholds), RiskBucket::MediumRisk);
        assert_eq!(RiskBucket::from_score(66, &thresholds), RiskBucket::MediumRisk);
        assert_eq!(RiskBucket::from_score(67, &thresholds), RiskBucket::HighRisk);
        assert_eq!(RiskBucket::from_score(100, &thresholds), RiskBucket::HighRisk);
    }

    #[test]
    fn test_custom_thresholds() {
        let thresholds = RiskThresholds {
            medium_from: 50,
            high_from: 90,
        };
        assert_eq!(RiskBucket::from_score(49, &thresholds), RiskBucket::LowRisk);
        assert_eq!(RiskBucket::from_score(89, &thresholds), RiskBucket::MediumRisk);
        assert_eq!(RiskBucket::from_score(90, &thresholds), RiskBucket::HighRisk);
    }

    #[test]
    fn test_triggered_factors() {
        let factors = RiskFactors {
            amount_deviation: 1.0,
            category_weight: 0.2,
            location_mismatch: Some(1.0),
            velocity: None,
        };
        assert_eq!(
            factors.triggered(0.5),
            vec!["amount_deviation".to_string(), "location_mismatch".to_string()]
        );
    }
}
