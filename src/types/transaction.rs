//! Transaction data structures flowing through the pipeline

use crate::error::ShardId;
use crate::types::risk::{RiskBucket, RiskFactors};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Mean Earth radius used for geo distance
const EARTH_RADIUS_KM: f64 = 6371.0;

/// A record exactly as pulled from a shard, before validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub shard_id: ShardId,
    /// Zero-based position of the record within its shard
    pub offset: u64,
    pub payload: Vec<u8>,
}

impl RawRecord {
    pub fn new(shard_id: ShardId, offset: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            shard_id,
            offset,
            payload: payload.into(),
        }
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Where a transaction happened: a named place or a geo point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Location {
    Geo { lat: f64, lon: f64 },
    Named(String),
}

impl Location {
    /// Whether two locations denote the same place.
    ///
    /// Names compare case-insensitively; geo points match when they are within
    /// `radius_km` of each other. A name never matches a geo point.
    pub fn matches(&self, other: &Location, radius_km: f64) -> bool {
        match (self, other) {
            (Location::Named(a), Location::Named(b)) => {
                a.trim().eq_ignore_ascii_case(b.trim())
            }
            (
                Location::Geo { lat: lat1, lon: lon1 },
                Location::Geo { lat: lat2, lon: lon2 },
            ) => haversine_km(*lat1, *lon1, *lat2, *lon2) <= radius_km,
            _ => false,
        }
    }
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// A validated transaction event. Immutable once built by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub transaction_id: String,
    pub amount: Decimal,
    /// Four ASCII digits
    pub merchant_mcc: String,
    pub location: Option<Location>,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    /// Original payload text, kept verbatim
    pub raw_payload: String,
}

/// Semantic merchant category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Grocery,
    Clothing,
    Gas,
    Electronics,
    Dining,
    Unknown,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Grocery,
        Category::Clothing,
        Category::Gas,
        Category::Electronics,
        Category::Dining,
        Category::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Grocery => "GROCERY",
            Category::Clothing => "CLOTHING",
            Category::Gas => "GAS",
            Category::Electronics => "ELECTRONICS",
            Category::Dining => "DINING",
            Category::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transaction after categorization and risk scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedTransaction {
    #[serde(flatten)]
    pub event: TransactionEvent,

    pub category: Category,

    /// Always within 1..=100
    pub risk_score: u8,

    pub risk_bucket: RiskBucket,

    /// Per-factor contributions behind the score
    pub risk_factors: RiskFactors,

    /// Scored without the user's history (lookup unavailable)
    pub degraded_context: bool,

    pub processed_at: DateTime<Utc>,
}

impl EnrichedTransaction {
    pub fn transaction_id(&self) -> &str {
        &self.event.transaction_id
    }

    pub fn user_id(&self) -> &str {
        &self.event.user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::risk::RiskFactors;
    use std::str::FromStr;

    fn sample_event() -> TransactionEvent {
        TransactionEvent {
            transaction_id: "tx_123".to_string(),
            amount: Decimal::from_str("42.10").unwrap(),
            merchant_mcc: "5411".to_string(),
            location: Some(Location::Named("Lisbon".to_string())),
            timestamp: Utc::now(),
            user_id: "u1".to_string(),
            raw_payload: "{}".to_string(),
        }
    }

    #[test]
    fn test_enriched_serialization_uses_wire_labels() {
        let enriched = EnrichedTransaction {
            event: sample_event(),
            category: Category::Grocery,
            risk_score: 12,
            risk_bucket: RiskBucket::LowRisk,
            risk_factors: RiskFactors::default(),
            degraded_context: false,
            processed_at: Utc::now(),
        };

        let json = serde_json::to_value(&enriched).unwrap();
        assert_eq!(json["category"], "GROCERY");
        assert_eq!(json["risk_bucket"], "LOW_RISK");
        assert_eq!(json["transaction_id"], "tx_123");

        let back: EnrichedTransaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, enriched);
    }

    #[test]
    fn test_named_locations_match_case_insensitively() {
        let a = Location::Named("New York ".to_string());
        let b = Location::Named("new york".to_string());
        assert!(a.matches(&b, 0.0));
        assert!(!a.matches(&Location::Named("Boston".to_string()), 1000.0));
    }

    #[test]
    fn test_geo_locations_match_within_radius() {
        // Roughly 5 km apart
        let a = Location::Geo { lat: 40.7128, lon: -74.0060 };
        let b = Location::Geo { lat: 40.7580, lon: -73.9855 };
        assert!(a.matches(&b, 25.0));
        assert!(!a.matches(&b, 1.0));
        assert!(!a.matches(&Location::Named("NYC".to_string()), 25.0));
    }

    #[test]
    fn test_location_untagged_deserialization() {
        let geo: Location = serde_json::from_str(r#"{"lat": 1.5, "lon": 2.5}"#).unwrap();
        assert_eq!(geo, Location::Geo { lat: 1.5, lon: 2.5 });
        let named: Location = serde_json::from_str(r#""Paris""#).unwrap();
        assert_eq!(named, Location::Named("Paris".to_string()));
    }
}
