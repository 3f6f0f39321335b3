//! Fused record model and the field-level rules applied while building one.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;

pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_SESSION_START: &str = "session_start_time";
pub const FIELD_DURATION: &str = "duration_seconds";
pub const FIELD_LOCATION: &str = "location";
pub const FIELD_START_LOCATION: &str = "start_location";
pub const FIELD_ALTITUDE: &str = "altitude";
pub const FIELD_ACCURACY: &str = "accuracy";
pub const FIELD_BEARING: &str = "bearing";
pub const FIELD_PROVIDER: &str = "provider";
pub const FIELD_SPEED: &str = "speed";
pub const FIELD_FREQUENCY: &str = "frequency";
pub const FIELD_AMPLITUDE: &str = "amplitude";
pub const FIELD_BATTERY: &str = "battery_percentage";

/// Scalar stored under one record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// One fused sample: field name to scalar value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_text(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), FieldValue::Text(value.into()));
    }

    pub fn insert_int(&mut self, key: impl Into<String>, value: i64) {
        self.fields.insert(key.into(), FieldValue::Int(value));
    }

    pub fn insert_bool(&mut self, key: impl Into<String>, value: bool) {
        self.fields.insert(key.into(), FieldValue::Bool(value));
    }

    /// Inserts `value` only when [`accept_numeric`] allows it. Returns whether it was kept.
    pub fn insert_number(&mut self, key: impl Into<String>, value: f64) -> bool {
        if !accept_numeric(value) {
            return false;
        }
        self.fields.insert(key.into(), FieldValue::Float(value));
        true
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &FieldValue> {
        self.fields.values()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize record")
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("parse record")
    }
}

/// Finite and strictly inside the i64 range; anything else is dropped at the field level.
pub fn accept_numeric(value: f64) -> bool {
    value.is_finite() && value < i64::MAX as f64 && value > i64::MIN as f64
}

/// ISO-8601, millisecond precision, explicit offset (`2017-08-14T10:21:03.250-04:00`).
pub fn format_timestamp<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string()
}

/// `android.sensor.accelerometer` -> `accelerometer`.
pub fn sensor_base_name(sensor_type: &str) -> &str {
    let trimmed = sensor_type.trim();
    match trimmed.rsplit('.').next() {
        Some(last) if !last.is_empty() => last,
        _ => trimmed,
    }
}

/// Field name per axis. Multi-axis sensors share a base name, so each axis gets its index.
pub fn sensor_field_names(sensor_type: &str, axes: usize) -> Vec<String> {
    let base = sensor_base_name(sensor_type);
    if axes == 1 {
        return vec![base.to_string()];
    }
    (0..axes).map(|idx| format!("{base}_{idx}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    #[test]
    fn accept_numeric_rejects_non_finite_and_out_of_range() {
        assert!(accept_numeric(0.0));
        assert!(accept_numeric(-9.81));
        assert!(accept_numeric(1.0e15));
        assert!(!accept_numeric(f64::NAN));
        assert!(!accept_numeric(f64::INFINITY));
        assert!(!accept_numeric(f64::NEG_INFINITY));
        assert!(!accept_numeric(1.0e19));
        assert!(!accept_numeric(-1.0e19));
        assert!(!accept_numeric(f32::MAX as f64));
    }

    #[test]
    fn insert_number_drops_only_the_bad_field() {
        let mut record = Record::new();
        assert!(record.insert_number("good", 1.5));
        assert!(!record.insert_number("bad", f64::NAN));
        assert!(record.contains("good"));
        assert!(!record.contains("bad"));
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn timestamp_has_millis_and_offset() {
        let offset = FixedOffset::west_opt(4 * 3600).unwrap();
        let at = offset.with_ymd_and_hms(2017, 8, 14, 10, 21, 3).unwrap()
            + chrono::Duration::milliseconds(250);
        assert_eq!(format_timestamp(&at), "2017-08-14T10:21:03.250-04:00");

        let utc = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_timestamp(&utc), "2020-01-02T03:04:05.000+00:00");
    }

    #[test]
    fn sensor_names_use_last_segment_and_axis_suffix() {
        assert_eq!(sensor_base_name("android.sensor.accelerometer"), "accelerometer");
        assert_eq!(sensor_base_name("light"), "light");
        assert_eq!(sensor_base_name("vendor.sensor."), "vendor.sensor.");
        assert_eq!(sensor_field_names("android.sensor.light", 1), vec!["light"]);
        assert_eq!(
            sensor_field_names("android.sensor.gyroscope", 3),
            vec!["gyroscope_0", "gyroscope_1", "gyroscope_2"]
        );
    }

    #[test]
    fn record_json_keeps_scalar_kinds() {
        let mut record = Record::new();
        record.insert_text(FIELD_TIMESTAMP, "2020-01-02T03:04:05.000+00:00");
        record.insert_int(FIELD_DURATION, 12);
        record.insert_number(FIELD_AMPLITUDE, 12.5);
        record.insert_bool("charging", true);

        let raw = record.to_json().unwrap();
        let parsed = Record::from_json(&raw).unwrap();
        assert_eq!(parsed.get(FIELD_DURATION), Some(&FieldValue::Int(12)));
        assert_eq!(parsed.get(FIELD_AMPLITUDE), Some(&FieldValue::Float(12.5)));
        assert_eq!(parsed.get("charging"), Some(&FieldValue::Bool(true)));
        assert_eq!(
            parsed.get(FIELD_TIMESTAMP).and_then(FieldValue::as_str),
            Some("2020-01-02T03:04:05.000+00:00")
        );
    }
}
