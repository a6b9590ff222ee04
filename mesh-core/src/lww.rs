//! Last-write-wins resolution.
//!
//! Records are matched by natural key; the one with the strictly greater
//! `updatedAt` wins. Timestamps arrive either as epoch millis or as date
//! strings and are normalized to millis before comparison.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Number, Value};
use thiserror::Error;

/// Wire field carrying the modification time.
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Outcome of comparing an incoming record against local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No local record with that key; insert the incoming one.
    Create,
    /// Incoming is strictly newer; overwrite.
    Replace,
    /// Local wins (newer, equal, or incoming has no timestamp).
    Keep,
}

/// Errors from timestamp normalization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    /// String that is neither millis nor a recognizable date.
    #[error("unparseable timestamp: {0:?}")]
    Malformed(String),

    /// JSON type that cannot hold a timestamp.
    #[error("timestamp must be a number or string, got {0}")]
    InvalidType(&'static str),
}

/// Decide what to do with an incoming record.
///
/// `existing` is `None` when no local record has the same key, otherwise the
/// local record's timestamp (which may itself be unset).
pub fn resolve(existing: Option<Option<i64>>, incoming: Option<i64>) -> Resolution {
    match (existing, incoming) {
        (None, _) => Resolution::Create,
        (Some(_), None) => Resolution::Keep,
        (Some(None), Some(_)) => Resolution::Replace,
        (Some(Some(local)), Some(incoming)) if incoming > local => Resolution::Replace,
        (Some(Some(_)), Some(_)) => Resolution::Keep,
    }
}

/// Parse an `updatedAt` JSON value into epoch millis.
///
/// `null` means unset. Accepted forms: integer millis, finite float millis
/// (truncated), a numeric string, RFC 3339, `YYYY-MM-DDTHH:MM:SS[.fff]`
/// (taken as UTC) and `YYYY-MM-DD` (midnight UTC).
pub fn parse_updated_at(value: &Value) -> Result<Option<i64>, TimestampError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => number_to_millis(n).map(Some),
        Value::String(s) => parse_date_string(s).map(Some),
        Value::Bool(_) => Err(TimestampError::InvalidType("boolean")),
        Value::Array(_) => Err(TimestampError::InvalidType("array")),
        Value::Object(_) => Err(TimestampError::InvalidType("object")),
    }
}

/// Rewrite a record's `updatedAt` in place as integer millis.
///
/// Returns the parsed timestamp. An unset timestamp is removed from the
/// record. Non-object values are left alone and report unset.
pub fn normalize_updated_at(record: &mut Value) -> Result<Option<i64>, TimestampError> {
    let Value::Object(fields) = record else {
        return Ok(None);
    };
    let parsed = match fields.get(UPDATED_AT_FIELD) {
        Some(raw) => parse_updated_at(raw)?,
        None => None,
    };
    match parsed {
        Some(millis) => {
            fields.insert(UPDATED_AT_FIELD.into(), Value::Number(millis.into()));
        }
        None => {
            fields.remove(UPDATED_AT_FIELD);
        }
    }
    Ok(parsed)
}

fn number_to_millis(n: &Number) -> Result<i64, TimestampError> {
    if let Some(i) = n.as_i64() {
        return Ok(i);
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f.abs() < i64::MAX as f64 => Ok(f as i64),
        _ => Err(TimestampError::Malformed(n.to_string())),
    }
}

fn parse_date_string(raw: &str) -> Result<i64, TimestampError> {
    let s = raw.trim();
    if let Ok(millis) = s.parse::<i64>() {
        return Ok(millis);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc().timestamp_millis());
    }
    if let Some(midnight) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight.and_utc().timestamp_millis());
    }
    Err(TimestampError::Malformed(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_local_creates() {
        assert_eq!(resolve(None, Some(100)), Resolution::Create);
        assert_eq!(resolve(None, None), Resolution::Create);
    }

    #[test]
    fn strictly_newer_replaces() {
        assert_eq!(resolve(Some(Some(100)), Some(101)), Resolution::Replace);
        assert_eq!(resolve(Some(Some(100)), Some(50)), Resolution::Keep);
    }

    #[test]
    fn equal_timestamps_keep_local() {
        assert_eq!(resolve(Some(Some(100)), Some(100)), Resolution::Keep);
    }

    #[test]
    fn unset_local_loses_to_timestamped_incoming() {
        assert_eq!(resolve(Some(None), Some(1)), Resolution::Replace);
    }

    #[test]
    fn unset_incoming_never_replaces() {
        assert_eq!(resolve(Some(None), None), Resolution::Keep);
        assert_eq!(resolve(Some(Some(1)), None), Resolution::Keep);
    }

    #[test]
    fn higher_timestamp_wins_in_either_order() {
        // Apply a then b, and b then a, starting from an empty store
        let a = Some(100);
        let b = Some(200);

        let mut winner = a;
        if resolve(Some(winner), b) == Resolution::Replace {
            winner = b;
        }
        assert_eq!(winner, b);

        let mut winner = b;
        if resolve(Some(winner), a) == Resolution::Replace {
            winner = a;
        }
        assert_eq!(winner, b);
    }

    #[test]
    fn parses_integer_and_null() {
        assert_eq!(parse_updated_at(&json!(1700000000000_i64)), Ok(Some(1700000000000)));
        assert_eq!(parse_updated_at(&Value::Null), Ok(None));
        assert_eq!(parse_updated_at(&json!(12.9)), Ok(Some(12)));
        assert_eq!(parse_updated_at(&json!("42")), Ok(Some(42)));
    }

    #[test]
    fn parses_date_strings() {
        assert_eq!(
            parse_updated_at(&json!("1970-01-01T00:00:01.500Z")),
            Ok(Some(1500))
        );
        assert_eq!(
            parse_updated_at(&json!("1970-01-01T01:00:00+01:00")),
            Ok(Some(0))
        );
        assert_eq!(parse_updated_at(&json!("1970-01-02")), Ok(Some(86_400_000)));
        assert_eq!(
            parse_updated_at(&json!("1970-01-01T00:00:02")),
            Ok(Some(2000))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_updated_at(&json!("last tuesday")),
            Err(TimestampError::Malformed(_))
        ));
        assert_eq!(
            parse_updated_at(&json!(true)),
            Err(TimestampError::InvalidType("boolean"))
        );
        assert_eq!(
            parse_updated_at(&json!({})),
            Err(TimestampError::InvalidType("object"))
        );
    }

    #[test]
    fn normalize_rewrites_in_place() {
        let mut record = json!({"name": "Rice", "updatedAt": "1970-01-01T00:00:00.100Z"});
        assert_eq!(normalize_updated_at(&mut record), Ok(Some(100)));
        assert_eq!(record["updatedAt"], json!(100));
    }

    #[test]
    fn normalize_drops_null() {
        let mut record = json!({"name": "Rice", "updatedAt": null});
        assert_eq!(normalize_updated_at(&mut record), Ok(None));
        assert!(record.get("updatedAt").is_none());

        let mut record = json!({"name": "Rice"});
        assert_eq!(normalize_updated_at(&mut record), Ok(None));
    }

    #[test]
    fn normalize_leaves_record_on_error() {
        let mut record = json!({"name": "Rice", "updatedAt": "soon"});
        assert!(normalize_updated_at(&mut record).is_err());
        assert_eq!(record["updatedAt"], json!("soon"));
    }
}
