//! Trial rows, trial log entries and the finalized trial record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{PatientId, Reading, TrialId};

// ============================================================================
// Trial
// ============================================================================

/// Lifecycle status of a trial.
///
/// `Inactive -> Active -> Finalizing -> Closed`. `Finalizing` may fall back
/// to `Active` when finalization fails. `Closed` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    #[default]
    Inactive,
    Active,
    Finalizing,
    Closed,
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrialStatus::Inactive => write!(f, "inactive"),
            TrialStatus::Active => write!(f, "active"),
            TrialStatus::Finalizing => write!(f, "finalizing"),
            TrialStatus::Closed => write!(f, "closed"),
        }
    }
}

/// A bounded recording session for one patient. Never physically deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub trial_id: TrialId,
    pub patient_id: PatientId,
    #[serde(default)]
    pub device_id: Option<String>,
    pub status: TrialStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn start(trial_id: TrialId, patient_id: PatientId, device_id: Option<String>) -> Self {
        Self {
            trial_id,
            patient_id,
            device_id,
            status: TrialStatus::Active,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: TrialStatus) -> Self {
        self.status = status;
        self
    }

    /// Terminal transition: status `Closed` with `end_time` set.
    #[must_use]
    pub fn closed(mut self, at: DateTime<Utc>) -> Self {
        self.status = TrialStatus::Closed;
        self.end_time = Some(at);
        self
    }
}

// ============================================================================
// Trial Log
// ============================================================================

/// One accumulated reading, ordered within its trial by `sequence_no`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialLogEntry {
    pub trial_id: TrialId,
    pub sequence_no: u64,
    pub reading: Reading,
}

// ============================================================================
// Finalized Record
// ============================================================================

/// Summary statistics over the non-null values of one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: usize,
}

/// The single durable, columnar artifact produced when a trial ends.
///
/// Every column in `parameters` is aligned index-for-index with
/// `timestamps`; readings that lack a parameter contribute `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedTrialRecord {
    pub trial_id: TrialId,
    pub patient_id: PatientId,
    #[serde(default)]
    pub device_id: Option<String>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub parameters: BTreeMap<String, Vec<Option<f64>>>,
    pub summary_stats: BTreeMap<String, ParameterStats>,
    pub created_at: DateTime<Utc>,
}

impl FinalizedTrialRecord {
    pub fn reading_count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn time_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((*self.timestamps.first()?, *self.timestamps.last()?))
    }
}

/// A finalized record together with its human-readable metadata summary,
/// written as one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTrialRecord {
    pub record: FinalizedTrialRecord,
    pub metadata: String,
}

/// Reference handed back to trial-control callers.
pub fn record_ref(trial_id: TrialId) -> String {
    format!("trial_records/{trial_id}")
}
