//! Trial Finalizer
//!
//! Turns a trial's accumulated log into one columnar `FinalizedTrialRecord`.
//!
//! Commit order:
//! 1. drain the log (read only)
//! 2. write record + metadata as one value  <- durability checkpoint
//! 3. purge the log, mark the trial `Closed`
//!
//! A failure before step 2 leaves the log untouched. Steps after the
//! checkpoint are idempotent; if they fail, a retried `end_trial` or the
//! startup recovery pass finds the stored record and completes them.

use chrono::{DateTime, Utc};
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;

use super::{TrialAccumulator, TrialError};
use crate::storage::TrialStore;
use crate::types::{
    record_ref, FinalizedTrialRecord, ParameterStats, StoredTrialRecord, Trial, TrialLogEntry,
};

/// Index columns that leak into payloads from dataframe-based senders.
const RESERVED_KEYS: &[&str] = &["Rows", "Index", "__index_level_0__"];

/// Result of a successful finalization.
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub record: FinalizedTrialRecord,
    pub record_ref: String,
    pub readings: usize,
    /// True when an already-stored record was reused.
    pub recovered: bool,
}

pub struct TrialFinalizer {
    store: Arc<dyn TrialStore>,
    accumulator: Arc<TrialAccumulator>,
}

impl TrialFinalizer {
    pub fn new(store: Arc<dyn TrialStore>, accumulator: Arc<TrialAccumulator>) -> Self {
        Self { store, accumulator }
    }

    /// Finalize a trial whose accumulator has been sealed.
    pub fn finalize(&self, trial: &Trial) -> Result<FinalizeOutcome, TrialError> {
        let trial_id = trial.trial_id;

        let existing = self
            .store
            .get_record(trial_id)
            .map_err(TrialError::persistence(trial_id))?;
        if let Some(stored) = existing {
            tracing::info!(trial_id, "Finalized record already stored, completing close");
            return Ok(self.complete(trial, stored.record, true));
        }

        let entries = self.accumulator.drain(trial_id)?;
        if entries.is_empty() {
            return Err(TrialError::EmptyTrial { trial_id });
        }

        let now = Utc::now();
        let record = build_record(trial, &entries, now);
        let metadata = render_metadata(&record, now);

        self.store
            .put_record(&StoredTrialRecord {
                record: record.clone(),
                metadata,
            })
            .map_err(TrialError::persistence(trial_id))?;

        tracing::info!(
            trial_id,
            patient_id = trial.patient_id,
            readings = record.reading_count(),
            parameters = record.parameters.len(),
            "Finalized trial record written"
        );

        Ok(self.complete(trial, record, false))
    }

    /// Post-checkpoint steps: purge the log and close the trial row.
    ///
    /// Failures are logged, not returned: the stored record is the source
    /// of truth and these steps are retried on the next pass.
    pub fn complete(
        &self,
        trial: &Trial,
        record: FinalizedTrialRecord,
        recovered: bool,
    ) -> FinalizeOutcome {
        let trial_id = trial.trial_id;

        match self.store.purge_log(trial_id) {
            Ok(removed) => tracing::debug!(trial_id, removed, "Trial log purged"),
            Err(e) => tracing::warn!(trial_id, error = %e, "Trial log purge failed, will retry on recovery"),
        }

        let closed = trial.clone().closed(Utc::now());
        if let Err(e) = self.store.put_trial(&closed) {
            tracing::warn!(trial_id, error = %e, "Failed to mark trial closed, will retry on recovery");
        }

        FinalizeOutcome {
            readings: record.reading_count(),
            record_ref: record_ref(trial_id),
            record,
            recovered,
        }
    }
}

/// Build the columnar record from a log in sequence order.
pub fn build_record(
    trial: &Trial,
    entries: &[TrialLogEntry],
    created_at: DateTime<Utc>,
) -> FinalizedTrialRecord {
    let keys: BTreeSet<&str> = entries
        .iter()
        .flat_map(|e| e.reading.values.keys())
        .map(String::as_str)
        .filter(|k| !RESERVED_KEYS.contains(k))
        .collect();

    let timestamps = entries.iter().map(|e| e.reading.timestamp).collect();

    let parameters: BTreeMap<String, Vec<Option<f64>>> = keys
        .iter()
        .map(|key| {
            let column = entries
                .iter()
                .map(|e| e.reading.values.get(*key).and_then(|v| v.as_number()))
                .collect();
            ((*key).to_string(), column)
        })
        .collect();

    let summary_stats = parameters
        .iter()
        .filter_map(|(key, column)| column_stats(column).map(|s| (key.clone(), s)))
        .collect();

    FinalizedTrialRecord {
        trial_id: trial.trial_id,
        patient_id: trial.patient_id,
        device_id: trial.device_id.clone(),
        timestamps,
        parameters,
        summary_stats,
        created_at,
    }
}

/// min / max / avg over the non-null values of a column.
///
/// Returns `None` for a column with no finite values. A stat that is not
/// finite cannot be stored as JSON, so such a column gets no entry.
pub fn column_stats(column: &[Option<f64>]) -> Option<ParameterStats> {
    let values: Vec<f64> = column
        .iter()
        .flatten()
        .copied()
        .filter(|v| v.is_finite())
        .collect();
    if values.is_empty() {
        return None;
    }
    let stats = ParameterStats {
        min: Statistics::min(&values),
        max: Statistics::max(&values),
        avg: scaled_mean(&values),
        count: values.len(),
    };
    [stats.min, stats.max, stats.avg]
        .iter()
        .all(|v| v.is_finite())
        .then_some(stats)
}

/// Mean as a compensated sum of `v / n`.
///
/// Each term is at most `max|v| / n`, so the sum stays within the range of
/// the inputs even when a plain running sum would overflow.
fn scaled_mean(values: &[f64]) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    let mut sum = 0.0_f64;
    let mut compensation = 0.0_f64;
    for v in values {
        let y = v / n - compensation;
        let t = sum + y;
        compensation = (t - sum) - y;
        sum = t;
    }
    sum
}

/// Human-readable audit summary stored next to the record.
pub fn render_metadata(record: &FinalizedTrialRecord, recorded_on: DateTime<Utc>) -> String {
    let (start, end) = record.time_range().map_or_else(
        || ("unknown".to_string(), "unknown".to_string()),
        |(s, e)| (s.to_rfc3339(), e.to_rfc3339()),
    );
    let params: Vec<&str> = record.parameters.keys().map(String::as_str).collect();

    let mut out = String::new();
    let _ = writeln!(out, "Trial {} for patient {}", record.trial_id, record.patient_id);
    let _ = writeln!(out, "Data points: {}", record.reading_count());
    let _ = writeln!(out, "Parameters: {}", params.join(", "));
    let _ = writeln!(out, "Time range: {start} to {end}");
    let _ = writeln!(out, "Recorded on: {}", recorded_on.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out);
    let _ = writeln!(out, "Statistics:");
    for (key, s) in &record.summary_stats {
        let _ = writeln!(out, "  {key}: min={:.2}, max={:.2}, avg={:.2}", s.min, s.max, s.avg);
    }
    out
}
