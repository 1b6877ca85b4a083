//! Structural validation of raw stream records.
//!
//! Turns a raw JSON payload into a [`TransactionEvent`] or rejects it with the
//! first [`ValidationError`] found. Checks run in a fixed order so the same
//! record always fails with the same reason.

use crate::error::ValidationError;
use crate::types::transaction::{Location, RawRecord, TransactionEvent};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;

/// Length of a merchant category code
const MCC_LEN: usize = 4;

/// Validator for raw transaction payloads
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }

    /// Parse and validate a raw record
    pub fn validate(&self, record: &RawRecord) -> Result<TransactionEvent, ValidationError> {
        let value: Value = serde_json::from_slice(&record.payload)
            .map_err(|e| ValidationError::new("payload", format!("malformed payload: {}", e)))?;
        let obj = value
            .as_object()
            .ok_or_else(|| ValidationError::new("payload", "payload must be a JSON object"))?;

        let transaction_id = required_string(obj, "transaction_id")?;
        let amount = parse_amount(obj.get("amount"))?;
        let merchant_mcc = parse_mcc(obj.get("merchant_mcc"))?;
        let timestamp = parse_timestamp(obj.get("timestamp"))?;
        let user_id = required_string(obj, "user_id")?;
        let location = parse_location(obj.get("location"))?;

        Ok(TransactionEvent {
            transaction_id,
            amount,
            merchant_mcc,
            location,
            timestamp,
            user_id,
            raw_payload: record.payload_text(),
        })
    }
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn required_string(obj: &Map<String, Value>, field: &str) -> Result<String, ValidationError> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Null) | None => Err(ValidationError::missing(field)),
        Some(Value::String(_)) => Err(ValidationError::missing(field)),
        Some(_) => Err(ValidationError::new(field, format!("{} must be a string", field))),
    }
}

fn parse_amount(value: Option<&Value>) -> Result<Decimal, ValidationError> {
    let amount = match value {
        None | Some(Value::Null) => return Err(ValidationError::missing("amount")),
        Some(Value::Number(n)) => {
            let text = n.to_string();
            Decimal::from_str(&text).or_else(|_| Decimal::from_scientific(&text))
        }
        Some(Value::String(s)) => Decimal::from_str(s.trim()),
        Some(_) => {
            return Err(ValidationError::new(
                "amount",
                "amount must be a decimal number",
            ))
        }
    }
    .map_err(|_| ValidationError::new("amount", "amount must be a decimal number"))?;

    if amount <= Decimal::ZERO {
        return Err(ValidationError::new(
            "amount",
            "amount must be greater than zero",
        ));
    }
    Ok(amount)
}

fn parse_mcc(value: Option<&Value>) -> Result<String, ValidationError> {
    let code = match value {
        None | Some(Value::Null) => return Err(ValidationError::missing("merchant_mcc")),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) if n.is_u64() => n.to_string(),
        Some(_) => String::new(),
    };

    if code.len() == MCC_LEN && code.bytes().all(|b| b.is_ascii_digit()) {
        Ok(code)
    } else {
        Err(ValidationError::new(
            "merchant_mcc",
            "merchant_mcc must be exactly 4 digits",
        ))
    }
}

fn parse_timestamp(value: Option<&Value>) -> Result<DateTime<Utc>, ValidationError> {
    let parsed = match value {
        None | Some(Value::Null) => return Err(ValidationError::missing("timestamp")),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        Some(_) => None,
    };

    parsed.ok_or_else(|| ValidationError::new("timestamp", "malformed timestamp"))
}

fn parse_location(value: Option<&Value>) -> Result<Option<Location>, ValidationError> {
    let invalid = || ValidationError::new("location", "location must be a place name or {lat, lon}");

    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if !s.trim().is_empty() => {
            Ok(Some(Location::Named(s.trim().to_string())))
        }
        Some(Value::Object(geo)) => {
            let lat = geo.get("lat").and_then(Value::as_f64).ok_or_else(invalid)?;
            let lon = geo.get("lon").and_then(Value::as_f64).ok_or_else(invalid)?;
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return Err(ValidationError::new(
                    "location",
                    "location coordinates out of range",
                ));
            }
            Ok(Some(Location::Geo { lat, lon }))
        }
        Some(_) => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> RawRecord {
        RawRecord::new(0, 0, serde_json::to_vec(&value).unwrap())
    }

    fn valid_payload() -> Value {
        json!({
            "transaction_id": "t1",
            "amount": 12.50,
            "merchant_mcc": "5411",
            "location": "Austin",
            "timestamp": "2026-10-01T12:00:00Z",
            "user_id": "u1"
        })
    }

    fn reject(value: Value) -> ValidationError {
        SchemaValidator::new().validate(&record(value)).unwrap_err()
    }

    #[test]
    fn test_accepts_valid_event() {
        let event = SchemaValidator::new().validate(&record(valid_payload())).unwrap();

        assert_eq!(event.transaction_id, "t1");
        assert_eq!(event.amount, Decimal::from_str("12.5").unwrap());
        assert_eq!(event.merchant_mcc, "5411");
        assert_eq!(event.location, Some(Location::Named("Austin".to_string())));
        assert_eq!(event.user_id, "u1");
        assert!(event.raw_payload.contains("\"t1\""));
    }

    #[test]
    fn test_rejects_non_positive_amounts() {
        let mut zero = valid_payload();
        zero["amount"] = json!(0);
        assert_eq!(reject(zero).reason, "amount must be greater than zero");

        let mut negative = valid_payload();
        negative["amount"] = json!("-5.00");
        let err = reject(negative);
        assert_eq!(err.field, "amount");
        assert_eq!(err.reason, "amount must be greater than zero");
    }

    #[test]
    fn test_accepts_string_decimal_amount() {
        let mut payload = valid_payload();
        payload["amount"] = json!("12.50");
        let event = SchemaValidator::new().validate(&record(payload)).unwrap();
        assert_eq!(event.amount.to_string(), "12.50");
    }

    #[test]
    fn test_missing_transaction_id() {
        let mut payload = valid_payload();
        payload.as_object_mut().unwrap().remove("transaction_id");
        let err = reject(payload);
        assert_eq!(err.field, "transaction_id");
        assert_eq!(err.to_string(), "missing transaction_id");

        let mut blank = valid_payload();
        blank["transaction_id"] = json!("   ");
        assert_eq!(reject(blank).reason, "missing transaction_id");
    }

    #[test]
    fn test_mcc_must_be_four_digits() {
        for bad in [json!("541"), json!("54111"), json!("54a1"), json!(true)] {
            let mut payload = valid_payload();
            payload["merchant_mcc"] = bad;
            assert_eq!(reject(payload).field, "merchant_mcc");
        }

        let mut numeric = valid_payload();
        numeric["merchant_mcc"] = json!(5732);
        let event = SchemaValidator::new().validate(&record(numeric)).unwrap();
        assert_eq!(event.merchant_mcc, "5732");
    }

    #[test]
    fn test_timestamp_formats() {
        let mut bad = valid_payload();
        bad["timestamp"] = json!("yesterday");
        assert_eq!(reject(bad).reason, "malformed timestamp");

        let mut epoch = valid_payload();
        epoch["timestamp"] = json!(1_700_000_000);
        let event = SchemaValidator::new().validate(&record(epoch)).unwrap();
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_geo_location() {
        let mut payload = valid_payload();
        payload["location"] = json!({"lat": 52.52, "lon": 13.40});
        let event = SchemaValidator::new().validate(&record(payload)).unwrap();
        assert_eq!(event.location, Some(Location::Geo { lat: 52.52, lon: 13.40 }));

        let mut out_of_range = valid_payload();
        out_of_range["location"] = json!({"lat": 120.0, "lon": 0.0});
        assert_eq!(reject(out_of_range).field, "location");
    }

    #[test]
    fn test_rejects_non_object_payloads() {
        let raw = RawRecord::new(0, 0, b"not json".to_vec());
        let err = SchemaValidator::new().validate(&raw).unwrap_err();
        assert_eq!(err.field, "payload");

        assert_eq!(reject(json!([1, 2, 3])).field, "payload");
    }
}
