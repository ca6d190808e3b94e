#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Identifier of a time series as assigned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeriesId(String);

impl SeriesId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SeriesId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for SeriesId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolved metadata of a referenced time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesMetadata {
    pub id: SeriesId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub meta: Value,
}

/// A single wire-format datapoint: epoch-second timestamp, arbitrary JSON
/// payload, optional metadata, optional duration in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub t: f64,
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dt: Option<f64>,
}

impl DataPoint {
    #[must_use]
    pub fn new(t: f64, d: Value) -> Self {
        Self {
            t,
            d,
            m: None,
            dt: None,
        }
    }

    #[must_use]
    pub fn with_duration(t: f64, d: Value, dt: f64) -> Self {
        Self {
            t,
            d,
            m: None,
            dt: Some(dt),
        }
    }

    /// Timestamp as a UTC datetime, if inside chrono's representable range.
    #[must_use]
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        epoch_to_datetime(self.t)
    }
}

#[must_use]
pub fn epoch_to_datetime(t: f64) -> Option<DateTime<Utc>> {
    if !t.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((t * 1000.0) as i64)
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValueError {
    #[error("value {0} is not representable as a number")]
    NonNumeric(String),
}

/// True for booleans and the bool-shaped values the wire tends to carry:
/// `"true"`/`"false"` strings and the integers 0/1.
#[must_use]
pub fn is_bool_like(value: &Value) -> bool {
    match value {
        Value::Bool(_) => true,
        Value::String(s) => s == "true" || s == "false",
        Value::Number(n) => matches!(n.as_i64(), Some(0 | 1)),
        _ => false,
    }
}

#[must_use]
pub fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s == "true" => Some(true),
        Value::String(s) if s == "false" => Some(false),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// True for finite numbers, numeric strings, and bool-likes.
#[must_use]
pub fn is_number_like(value: &Value) -> bool {
    as_number(value).is_some()
}

/// Numeric coercion: numbers pass through, numeric strings parse,
/// bool-likes map to 1/0. Non-finite values are rejected.
#[must_use]
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => {
            if let Ok(v) = s.parse::<f64>() {
                return v.is_finite().then_some(v);
            }
            as_bool(value).map(|b| if b { 1.0 } else { 0.0 })
        }
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub fn as_number_strict(value: &Value) -> Result<f64, ValueError> {
    as_number(value).ok_or_else(|| ValueError::NonNumeric(value.to_string()))
}

/// True for values usable as a category key: number-likes and strings.
#[must_use]
pub fn is_key_like(value: &Value) -> bool {
    is_number_like(value) || value.is_string()
}

/// True for objects carrying numeric `latitude`/`longitude` (and, when
/// present, a numeric `accuracy`).
#[must_use]
pub fn is_location(value: &Value) -> bool {
    let Value::Object(map) = value else {
        return false;
    };
    let coord_ok = |key: &str| map.get(key).is_some_and(is_number_like);
    if !coord_ok("latitude") || !coord_ok("longitude") {
        return false;
    }
    match map.get("accuracy") {
        None => true,
        Some(accuracy) => is_number_like(accuracy),
    }
}

/// Clamp each datapoint's duration so it never overlaps the start of the
/// next datapoint. Merged series from the backend can carry overlapping
/// durations.
pub fn clamp_durations(points: &mut [DataPoint]) {
    for i in 0..points.len().saturating_sub(1) {
        let next_t = points[i + 1].t;
        let point = &mut points[i];
        if let Some(dt) = point.dt
            && point.t + dt > next_t
        {
            point.dt = Some(next_t - point.t);
        }
    }
}

/// Expand datapoints with a nonzero duration into explicit start/end pairs,
/// placing the end point `offset` seconds before the duration expires.
#[must_use]
pub fn explicit_duration(points: &[DataPoint], offset: f64) -> Vec<DataPoint> {
    let mut out = Vec::with_capacity(points.len() * 2);
    for point in points {
        out.push(point.clone());
        if let Some(dt) = point.dt
            && dt != 0.0
        {
            out.push(DataPoint::new(point.t + dt - offset, point.d.clone()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        DataPoint, as_number, clamp_durations, explicit_duration, is_bool_like, is_key_like,
        is_location, is_number_like,
    };

    #[test]
    fn numeric_coercion_accepts_strings_and_bools() {
        assert_eq!(as_number(&json!(3.5)), Some(3.5));
        assert_eq!(as_number(&json!("42")), Some(42.0));
        assert_eq!(as_number(&json!(true)), Some(1.0));
        assert_eq!(as_number(&json!("true")), Some(1.0));
        assert_eq!(as_number(&json!("pizza")), None);
        assert_eq!(as_number(&json!({"a": 1})), None);
    }

    #[test]
    fn bool_like_covers_wire_shapes() {
        assert!(is_bool_like(&json!(false)));
        assert!(is_bool_like(&json!("false")));
        assert!(is_bool_like(&json!(1)));
        assert!(!is_bool_like(&json!(2)));
        assert!(!is_bool_like(&json!("yes")));
    }

    #[test]
    fn key_like_accepts_numbers_and_strings_only() {
        assert!(is_key_like(&json!("walking")));
        assert!(is_key_like(&json!(7)));
        assert!(!is_key_like(&json!([1, 2])));
        assert!(!is_key_like(&json!(null)));
    }

    #[test]
    fn location_requires_numeric_coordinates() {
        assert!(is_location(&json!({"latitude": 52.0, "longitude": 13.4})));
        assert!(is_location(&json!({
            "latitude": "52.0",
            "longitude": 13.4,
            "accuracy": 10
        })));
        assert!(!is_location(&json!({"latitude": 52.0})));
        assert!(!is_location(&json!({
            "latitude": 52.0,
            "longitude": 13.4,
            "accuracy": "high"
        })));
        assert!(is_number_like(&json!("13")));
    }

    #[test]
    fn durations_are_clamped_to_the_next_timestamp() {
        let mut points = vec![
            DataPoint::with_duration(0.0, json!(1), 5.0),
            DataPoint::with_duration(3.0, json!(2), 1.0),
            DataPoint::new(10.0, json!(3)),
        ];
        clamp_durations(&mut points);
        assert_eq!(points[0].dt, Some(3.0));
        assert_eq!(points[1].dt, Some(1.0));
    }

    #[test]
    fn explicit_duration_expands_ranged_points() {
        let points = vec![
            DataPoint::with_duration(0.0, json!("a"), 2.0),
            DataPoint::new(5.0, json!("b")),
        ];
        let out = explicit_duration(&points, 0.001);
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].t, 1.999);
        assert_eq!(out[1].d, json!("a"));
        assert_eq!(out[2].t, 5.0);
    }

    #[test]
    fn datapoint_serde_omits_absent_fields() {
        let point = DataPoint::new(1.0, json!(5));
        let encoded = serde_json::to_string(&point).expect("encode");
        assert_eq!(encoded, r#"{"t":1.0,"d":5}"#);

        let decoded: DataPoint =
            serde_json::from_str(r#"{"t":2,"d":7,"dt":1.5}"#).expect("decode");
        assert_eq!(decoded.dt, Some(1.5));
        assert_eq!(decoded.m, None);
    }
}
