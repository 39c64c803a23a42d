//! Ingestion Gateway
//!
//! Entry point for every device reading. Validates the frame, fans it out to
//! the rolling buffer (always) and to the active trial's accumulator (when
//! one exists), and produces the acknowledgment sent back to the device.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::rolling_buffer::RollingBufferStore;
use crate::trials::{AppendOutcome, TrialAccumulator, TrialError, TrialStateMachine};
use crate::types::{PatientId, RawReading, Reading, ReadingAck, SensorValue};

/// Errors for a single reading. Neither closes the connection.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Persistence(TrialError),
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::InvalidPayload(_) => "INVALID_PAYLOAD",
            IngestError::Persistence(e) => e.code(),
        }
    }
}

pub struct IngestionGateway {
    buffer: Arc<RollingBufferStore>,
    trials: Arc<TrialStateMachine>,
    accumulator: Arc<TrialAccumulator>,
}

impl IngestionGateway {
    pub fn new(
        buffer: Arc<RollingBufferStore>,
        trials: Arc<TrialStateMachine>,
        accumulator: Arc<TrialAccumulator>,
    ) -> Self {
        Self {
            buffer,
            trials,
            accumulator,
        }
    }

    /// Handle one raw text frame from a device stream.
    pub fn on_reading(
        &self,
        patient_id: PatientId,
        device_id: &str,
        raw: &str,
    ) -> Result<ReadingAck, IngestError> {
        let reading = parse_reading(patient_id, device_id, raw)?;
        self.ingest(reading)
    }

    /// Route an already-validated reading.
    pub fn ingest(&self, reading: Reading) -> Result<ReadingAck, IngestError> {
        let patient_id = reading.patient_id;
        let timestamp = reading.timestamp;

        // Independent copy; the buffer never sees the trial log entry.
        self.buffer.append(patient_id, reading.clone());

        let Some(trial_id) = self.trials.active_trial(patient_id) else {
            return Ok(ReadingAck::ok(None, timestamp));
        };

        match self.accumulator.append(trial_id, reading) {
            Ok(AppendOutcome::Appended { .. } | AppendOutcome::Duplicate) => {
                Ok(ReadingAck::ok(Some(trial_id), timestamp))
            }
            Err(TrialError::TrialNotActive { .. }) => {
                // Lost the race with end_trial: buffer only.
                tracing::debug!(patient_id, trial_id, "Trial no longer active, reading kept in live buffer only");
                Ok(ReadingAck::ok(None, timestamp))
            }
            Err(e) => {
                tracing::error!(patient_id, trial_id, error = %e, "Failed to append reading to trial log");
                Err(IngestError::Persistence(e))
            }
        }
    }
}

/// Validate a device frame and build the `Reading` it describes.
pub fn parse_reading(
    patient_id: PatientId,
    device_id: &str,
    raw: &str,
) -> Result<Reading, IngestError> {
    if patient_id <= 0 {
        return Err(IngestError::InvalidPayload(format!(
            "invalid patient id {patient_id}"
        )));
    }

    let frame: RawReading = serde_json::from_str(raw)
        .map_err(|e| IngestError::InvalidPayload(format!("malformed reading: {e}")))?;

    if let Some(claimed) = frame.patient_id {
        if claimed != patient_id {
            return Err(IngestError::InvalidPayload(format!(
                "patient_id {claimed} does not match stream patient {patient_id}"
            )));
        }
    }

    let serde_json::Value::Object(fields) = &frame.sensor_data else {
        return Err(IngestError::InvalidPayload(
            "sensor_data must be an object".to_string(),
        ));
    };
    if fields.is_empty() {
        return Err(IngestError::InvalidPayload(
            "sensor_data is empty".to_string(),
        ));
    }

    let mut values = BTreeMap::new();
    for (key, value) in fields {
        let value = SensorValue::from_json(value).ok_or_else(|| {
            IngestError::InvalidPayload(format!("sensor_data.{key} must be a scalar"))
        })?;
        values.insert(key.clone(), value);
    }

    let device_id = frame.device_id.as_deref().unwrap_or(device_id);
    let reading = Reading::new(patient_id, device_id, values);

    match frame.timestamp.as_deref().map(str::trim) {
        None | Some("") => Ok(reading),
        Some(ts) => parse_timestamp(ts)
            .map(|at| reading.with_device_timestamp(at))
            .ok_or_else(|| IngestError::InvalidPayload(format!("unparseable timestamp '{ts}'"))),
    }
}

/// RFC 3339, or a naive ISO 8601 date-time taken as UTC.
fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(ts) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(ts, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryTrialStore;
    use crate::types::AckStatus;

    fn gateway() -> (IngestionGateway, Arc<TrialStateMachine>, Arc<RollingBufferStore>, Arc<TrialAccumulator>) {
        let store = Arc::new(InMemoryTrialStore::new());
        let accumulator = Arc::new(TrialAccumulator::new(store.clone(), true));
        let trials = Arc::new(TrialStateMachine::new(store, Arc::clone(&accumulator)));
        let buffer = Arc::new(RollingBufferStore::new(60));
        let gw = IngestionGateway::new(
            Arc::clone(&buffer),
            Arc::clone(&trials),
            Arc::clone(&accumulator),
        );
        (gw, trials, buffer, accumulator)
    }

    #[test]
    fn test_parse_rejects_bad_payloads() {
        for raw in [
            "not json",
            r#"{"sensor_data": {}}"#,
            r#"{"sensor_data": [1, 2]}"#,
            r#"{"sensor_data": {"hr": {"nested": 1}}}"#,
            r#"{"sensor_data": {"hr": 70}, "timestamp": "yesterday"}"#,
            r#"{"patient_id": 9, "sensor_data": {"hr": 70}}"#,
        ] {
            assert!(
                matches!(parse_reading(42, "dev", raw), Err(IngestError::InvalidPayload(_))),
                "accepted {raw}"
            );
        }
        assert!(parse_reading(0, "dev", r#"{"sensor_data": {"hr": 70}}"#).is_err());
    }

    #[test]
    fn test_parse_timestamps() {
        let r = parse_reading(42, "dev", r#"{"sensor_data": {"hr": 70}}"#).unwrap();
        assert!(!r.device_timestamped);

        let r = parse_reading(
            42,
            "dev",
            r#"{"sensor_data": {"hr": 70}, "timestamp": "2024-03-01T10:00:00+02:00"}"#,
        )
        .unwrap();
        assert!(r.device_timestamped);
        assert_eq!(r.timestamp.to_rfc3339(), "2024-03-01T08:00:00+00:00");

        let r = parse_reading(
            42,
            "dev",
            r#"{"sensor_data": {"hr": 70}, "timestamp": "2024-03-01T10:00:00.250"}"#,
        )
        .unwrap();
        assert_eq!(r.timestamp.timestamp_millis() % 1000, 250);
    }

    #[test]
    fn test_reading_without_trial_goes_to_buffer_only() {
        let (gw, _, buffer, _) = gateway();
        let ack = gw
            .on_reading(42, "dev", r#"{"sensor_data": {"heart_rate": 70}}"#)
            .unwrap();

        assert_eq!(ack.status, AckStatus::Ok);
        assert_eq!(ack.trial_id, None);
        assert_eq!(buffer.query(42, 10).len(), 1);
    }

    #[tokio::test]
    async fn test_reading_with_active_trial_is_accumulated() {
        let (gw, trials, buffer, accumulator) = gateway();
        let trial_id = trials.start_trial(42, None).await.unwrap().trial_id;

        let ack = gw
            .on_reading(42, "dev", r#"{"sensor_data": {"heart_rate": 70}}"#)
            .unwrap();

        assert_eq!(ack.trial_id, Some(trial_id));
        assert_eq!(accumulator.appended_count(trial_id), Some(1));
        assert_eq!(buffer.query(42, 10).len(), 1);
    }

    #[tokio::test]
    async fn test_sealed_trial_routes_to_buffer_only() {
        let (gw, trials, buffer, accumulator) = gateway();
        let trial_id = trials.start_trial(42, None).await.unwrap().trial_id;
        accumulator.seal(trial_id);

        let ack = gw
            .on_reading(42, "dev", r#"{"sensor_data": {"heart_rate": 70}}"#)
            .unwrap();

        assert_eq!(ack.status, AckStatus::Ok);
        assert_eq!(ack.trial_id, None);
        assert_eq!(accumulator.appended_count(trial_id), Some(0));
        assert_eq!(buffer.query(42, 10).len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_device_reading_is_acked_once_logged() {
        let (gw, trials, buffer, accumulator) = gateway();
        let trial_id = trials.start_trial(42, None).await.unwrap().trial_id;
        let raw = r#"{"sensor_data": {"heart_rate": 70}, "timestamp": "2024-03-01T10:00:00Z"}"#;

        assert_eq!(gw.on_reading(42, "dev", raw).unwrap().trial_id, Some(trial_id));
        assert_eq!(gw.on_reading(42, "dev", raw).unwrap().trial_id, Some(trial_id));

        assert_eq!(accumulator.appended_count(trial_id), Some(1));
        assert_eq!(buffer.query(42, 10).len(), 2);
    }
}
