//! # Ordered-Candidate JSON Lookups
//!
//! Upstream payloads carry the same concept under several historical shapes.
//! Instead of optional-chaining at every call site, each field declares a
//! literal, ordered list of [`JsonPath`]s and the helpers here return the
//! first candidate that yields a usable value.
//!
//! ```text
//! TOTAL_PATHS = [priceSummary.total, totals.total, payNow.amount, ...]
//!                      │               │              │
//!                      ▼               ▼              ▼
//!                    null?  ──────►  "100.0" ──► first hit wins
//! ```
//!
//! Path segments that parse as an integer index into arrays, so
//! `["activities", "0", "type"]` works.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// A literal path into a JSON document.
pub type JsonPath = &'static [&'static str];

/// Keys under which a scalar may be wrapped: `{"value": ...}` and friends.
pub const ENVELOPE_KEYS: [&str; 4] = ["value", "date", "timestamp", "formattedDate"];

/// Returns the first `Some` in candidate order.
///
/// ```rust
/// use fiskal_core::json_path::first_non_null;
///
/// assert_eq!(first_non_null([None, Some(2), Some(3)]), Some(2));
/// assert_eq!(first_non_null::<i32, _>([None, None]), None);
/// ```
pub fn first_non_null<T, I>(candidates: I) -> Option<T>
where
    I: IntoIterator<Item = Option<T>>,
{
    candidates.into_iter().flatten().next()
}

/// Walks `path` into `value`. `null` counts as absent.
pub fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// First candidate path that resolves to something other than null or `""`.
pub fn first_at<'a>(value: &'a Value, paths: &[JsonPath]) -> Option<&'a Value> {
    paths
        .iter()
        .filter_map(|path| lookup(value, path))
        .find(|v| !matches!(v, Value::String(s) if s.trim().is_empty()))
}

/// Scalar as trimmed, non-empty text. Numbers are rendered, objects are not text.
pub fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First candidate path that yields text (after unwrapping one envelope).
pub fn text_at(value: &Value, paths: &[JsonPath]) -> Option<String> {
    first_non_null(
        paths
            .iter()
            .map(|path| lookup(value, path).and_then(|v| as_text(unwrap_envelope(v)))),
    )
}

/// First candidate path that is a non-empty JSON object.
pub fn object_at<'a>(value: &'a Value, paths: &[JsonPath]) -> Option<&'a Value> {
    paths
        .iter()
        .filter_map(|path| lookup(value, path))
        .find(|v| v.as_object().is_some_and(|m| !m.is_empty()))
}

/// First candidate path that is a boolean.
pub fn bool_at(value: &Value, paths: &[JsonPath]) -> Option<bool> {
    first_non_null(paths.iter().map(|path| {
        lookup(value, path).and_then(|v| match v {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        })
    }))
}

// =============================================================================
// Envelopes
// =============================================================================

/// Strips `{value|date|timestamp|formattedDate: x}` wrappers.
///
/// Only single-purpose wrappers are unwrapped; an object that carries one of
/// the envelope keys next to many other fields is returned as-is only if no
/// envelope key holds a non-null value. Unwrapping stops after two levels.
pub fn unwrap_envelope(value: &Value) -> &Value {
    let mut current = value;
    for _ in 0..2 {
        let Value::Object(map) = current else {
            break;
        };
        match ENVELOPE_KEYS
            .iter()
            .find_map(|key| map.get(*key).filter(|v| !v.is_null()))
        {
            Some(inner) => current = inner,
            None => break,
        }
    }
    current
}

// =============================================================================
// Dates
// =============================================================================

/// Epoch values above this are milliseconds (year 5138 in seconds).
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Parses a date/time in any of the shapes upstream has used.
///
/// ## Accepted Shapes
/// ```text
/// "2024-01-01T10:00:00Z"            RFC 3339
/// "2024-01-01T10:00:00.123+02:00"   RFC 3339 with offset
/// "2024-01-01T10:00:00"             naive, assumed UTC
/// "2024-01-01 10:00:00"             naive with space
/// "2024-01-01"                      midnight UTC
/// 1704103200 / 1704103200000        epoch seconds / milliseconds
/// {"value": <any of the above>}     envelope (also date/timestamp/formattedDate)
/// ```
pub fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match unwrap_envelope(value) {
        Value::String(s) => parse_datetime_str(s),
        Value::Number(n) => n.as_i64().and_then(parse_epoch),
        _ => None,
    }
}

fn parse_datetime_str(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }

    s.parse::<i64>().ok().and_then(parse_epoch)
}

fn parse_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value >= EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

/// First candidate path that parses as a date.
pub fn datetime_at(value: &Value, paths: &[JsonPath]) -> Option<DateTime<Utc>> {
    first_non_null(
        paths
            .iter()
            .map(|path| lookup(value, path).and_then(parse_datetime)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_objects_and_arrays() {
        let doc = json!({"a": {"b": [{"c": 1}, {"c": 2}]}, "n": null});
        assert_eq!(lookup(&doc, &["a", "b", "1", "c"]), Some(&json!(2)));
        assert_eq!(lookup(&doc, &["a", "x"]), None);
        assert_eq!(lookup(&doc, &["n"]), None);
        assert_eq!(lookup(&doc, &["a", "b", "x"]), None);
    }

    #[test]
    fn test_first_at_skips_blank_strings_and_keeps_order() {
        const PATHS: &[JsonPath] = &[&["first"], &["second"], &["third"]];
        let doc = json!({"first": "  ", "second": "two", "third": "three"});
        assert_eq!(first_at(&doc, PATHS), Some(&json!("two")));
        assert_eq!(text_at(&doc, PATHS), Some("two".to_string()));
    }

    #[test]
    fn test_text_at_unwraps_envelopes() {
        const PATHS: &[JsonPath] = &[&["status"]];
        let doc = json!({"status": {"value": "PAID"}});
        assert_eq!(text_at(&doc, PATHS), Some("PAID".to_string()));
    }

    #[test]
    fn test_unwrap_envelope() {
        assert_eq!(unwrap_envelope(&json!({"value": 5})), &json!(5));
        assert_eq!(
            unwrap_envelope(&json!({"date": {"timestamp": "x"}})),
            &json!("x")
        );
        assert_eq!(unwrap_envelope(&json!({"other": 1})), &json!({"other": 1}));
    }

    #[test]
    fn test_parse_datetime_shapes() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert_eq!(parse_datetime(&json!("2024-01-01T10:00:00Z")), Some(expected));
        assert_eq!(
            parse_datetime(&json!("2024-01-01T12:00:00+02:00")),
            Some(expected)
        );
        assert_eq!(parse_datetime(&json!("2024-01-01T10:00:00")), Some(expected));
        assert_eq!(parse_datetime(&json!("2024-01-01 10:00:00")), Some(expected));
        assert_eq!(parse_datetime(&json!(1704103200)), Some(expected));
        assert_eq!(parse_datetime(&json!(1704103200000_i64)), Some(expected));
        assert_eq!(
            parse_datetime(&json!({"formattedDate": "2024-01-01T10:00:00Z"})),
            Some(expected)
        );
        assert_eq!(
            parse_datetime(&json!("2024-01-01")),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_datetime(&json!("not a date")), None);
        assert_eq!(parse_datetime(&json!({})), None);
    }

    #[test]
    fn test_bool_at() {
        const PATHS: &[JsonPath] = &[&["missing"], &["flag"]];
        assert_eq!(bool_at(&json!({"flag": "TRUE"}), PATHS), Some(true));
        assert_eq!(bool_at(&json!({"flag": false}), PATHS), Some(false));
        assert_eq!(bool_at(&json!({}), PATHS), None);
    }
}
