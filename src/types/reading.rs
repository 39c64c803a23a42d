//! Device readings: the tagged sensor value and the immutable `Reading`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::PatientId;

// ============================================================================
// Sensor Values
// ============================================================================

/// A single sensor parameter value.
///
/// Devices send flat JSON objects; anything other than a number, string,
/// boolean or null is rejected at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Null,
}

impl SensorValue {
    /// Numeric projection used when building trial columns.
    ///
    /// Numbers pass through, numeric strings are parsed, booleans map to
    /// 1.0 / 0.0, everything else is `None`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            SensorValue::Number(v) if v.is_finite() => Some(*v),
            SensorValue::Number(_) => None,
            SensorValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            SensorValue::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            SensorValue::Null => None,
        }
    }

    /// Convert a JSON value, rejecting nested arrays and objects.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(SensorValue::Null),
            serde_json::Value::Bool(b) => Some(SensorValue::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(SensorValue::Number),
            serde_json::Value::String(s) => Some(SensorValue::Text(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }
}

impl From<f64> for SensorValue {
    fn from(v: f64) -> Self {
        SensorValue::Number(v)
    }
}

impl From<bool> for SensorValue {
    fn from(v: bool) -> Self {
        SensorValue::Bool(v)
    }
}

impl From<&str> for SensorValue {
    fn from(v: &str) -> Self {
        SensorValue::Text(v.to_string())
    }
}

// ============================================================================
// Reading
// ============================================================================

/// One timestamped sensor payload from a device. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub patient_id: PatientId,
    pub device_id: String,
    pub values: BTreeMap<String, SensorValue>,
    pub timestamp: DateTime<Utc>,
    /// True when the timestamp came from the device rather than `now()`.
    #[serde(default)]
    pub device_timestamped: bool,
}

impl Reading {
    /// Build a server-stamped reading.
    pub fn new(
        patient_id: PatientId,
        device_id: impl Into<String>,
        values: BTreeMap<String, SensorValue>,
    ) -> Self {
        Self {
            patient_id,
            device_id: device_id.into(),
            values,
            timestamp: Utc::now(),
            device_timestamped: false,
        }
    }

    /// Attach a device-supplied timestamp.
    #[must_use]
    pub fn with_device_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self.device_timestamped = true;
        self
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// Inbound reading frame as sent by devices.
///
/// `sensor_data` is kept as raw JSON so the gateway can report precisely
/// which field failed validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawReading {
    #[serde(default)]
    pub patient_id: Option<i64>,
    #[serde(default)]
    pub device_id: Option<String>,
    pub sensor_data: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Per-reading acknowledgment sent back to the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingAck {
    pub status: AckStatus,
    pub trial_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
}

impl ReadingAck {
    pub fn ok(trial_id: Option<u64>, timestamp: DateTime<Utc>) -> Self {
        Self {
            status: AckStatus::Ok,
            trial_id,
            timestamp,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Error,
            trial_id: None,
            timestamp: Utc::now(),
            message: Some(message.into()),
        }
    }
}
