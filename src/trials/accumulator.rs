//! Trial Accumulator
//!
//! Trial-scoped append log, independent of the rolling buffer. Each open
//! trial has its own lock; the sequence number is assigned and the entry
//! written under that lock, so `seal` is a barrier: once it returns, no
//! further entry can land in the trial's log.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use super::TrialError;
use crate::storage::TrialStore;
use crate::types::{PatientId, Reading, Trial, TrialId, TrialLogEntry};

/// Result of a successful `append`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { sequence_no: u64 },
    /// Same device and device timestamp already logged for this trial.
    Duplicate,
}

#[derive(Debug)]
struct TrialLog {
    patient_id: PatientId,
    open: bool,
    next_seq: u64,
    seen: HashSet<(String, DateTime<Utc>)>,
}

impl TrialLog {
    fn new(patient_id: PatientId) -> Self {
        Self {
            patient_id,
            open: true,
            next_seq: 1,
            seen: HashSet::new(),
        }
    }
}

type LogSlot = Arc<Mutex<TrialLog>>;

fn lock(slot: &LogSlot) -> MutexGuard<'_, TrialLog> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Append-only per-trial reading log backed by a `TrialStore`.
pub struct TrialAccumulator {
    store: Arc<dyn TrialStore>,
    dedupe_device_timestamps: bool,
    logs: RwLock<HashMap<TrialId, LogSlot>>,
}

impl TrialAccumulator {
    pub fn new(store: Arc<dyn TrialStore>, dedupe_device_timestamps: bool) -> Self {
        Self {
            store,
            dedupe_device_timestamps,
            logs: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, trial_id: TrialId) -> Option<LogSlot> {
        self.logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&trial_id)
            .cloned()
    }

    /// Start accepting readings for a freshly started trial.
    pub fn open(&self, trial_id: TrialId, patient_id: PatientId) {
        self.logs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(trial_id, Arc::new(Mutex::new(TrialLog::new(patient_id))));
    }

    /// Re-open a trial that already has a persisted log (startup recovery).
    ///
    /// Sequence numbering continues after the highest persisted entry and
    /// the dedupe index is rebuilt from the log.
    pub fn resume(&self, trial: &Trial) -> Result<usize, TrialError> {
        let entries = self
            .store
            .read_log(trial.trial_id)
            .map_err(TrialError::persistence(trial.trial_id))?;

        let mut log = TrialLog::new(trial.patient_id);
        log.next_seq = entries.iter().map(|e| e.sequence_no).max().unwrap_or(0) + 1;
        if self.dedupe_device_timestamps {
            log.seen = entries
                .iter()
                .filter(|e| e.reading.device_timestamped)
                .map(|e| (e.reading.device_id.clone(), e.reading.timestamp))
                .collect();
        }

        self.logs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(trial.trial_id, Arc::new(Mutex::new(log)));

        Ok(entries.len())
    }

    /// Durably append a reading and assign its sequence number.
    pub fn append(&self, trial_id: TrialId, reading: Reading) -> Result<AppendOutcome, TrialError> {
        let slot = self
            .slot(trial_id)
            .ok_or(TrialError::TrialNotActive { trial_id })?;
        let mut log = lock(&slot);

        if !log.open {
            return Err(TrialError::TrialNotActive { trial_id });
        }
        if reading.patient_id != log.patient_id {
            return Err(TrialError::PatientMismatch {
                trial_id,
                patient_id: reading.patient_id,
            });
        }

        let dedupe_key = (self.dedupe_device_timestamps && reading.device_timestamped)
            .then(|| (reading.device_id.clone(), reading.timestamp));
        if let Some(key) = &dedupe_key {
            if log.seen.contains(key) {
                tracing::debug!(trial_id, device_id = %key.0, timestamp = %key.1, "Duplicate reading ignored");
                return Ok(AppendOutcome::Duplicate);
            }
        }

        let sequence_no = log.next_seq;
        let entry = TrialLogEntry {
            trial_id,
            sequence_no,
            reading,
        };
        self.store
            .append_log(&entry)
            .map_err(TrialError::persistence(trial_id))?;

        // Advance only after the write so a failed append leaves no gap.
        log.next_seq += 1;
        if let Some(key) = dedupe_key {
            log.seen.insert(key);
        }

        Ok(AppendOutcome::Appended { sequence_no })
    }

    /// Stop accepting readings. Returns false if the trial is unknown.
    pub fn seal(&self, trial_id: TrialId) -> bool {
        self.slot(trial_id).is_some_and(|slot| {
            lock(&slot).open = false;
            true
        })
    }

    /// Accept readings again after a failed finalization.
    pub fn reopen(&self, trial_id: TrialId) -> bool {
        self.slot(trial_id).is_some_and(|slot| {
            lock(&slot).open = true;
            true
        })
    }

    /// Drop in-memory state for a closed trial. Persisted data is untouched.
    pub fn forget(&self, trial_id: TrialId) {
        self.logs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&trial_id);
    }

    pub fn is_open(&self, trial_id: TrialId) -> bool {
        self.slot(trial_id).is_some_and(|slot| lock(&slot).open)
    }

    /// Number of entries appended so far (including any resumed from disk).
    pub fn appended_count(&self, trial_id: TrialId) -> Option<u64> {
        self.slot(trial_id).map(|slot| lock(&slot).next_seq - 1)
    }

    /// Full log in sequence order. Reads only; purging is the finalizer's job.
    pub fn drain(&self, trial_id: TrialId) -> Result<Vec<TrialLogEntry>, TrialError> {
        let entries = self
            .store
            .read_log(trial_id)
            .map_err(TrialError::persistence(trial_id))?;

        let gaps = entries
            .windows(2)
            .filter(|w| w[1].sequence_no != w[0].sequence_no + 1)
            .count();
        if gaps > 0 || entries.first().is_some_and(|e| e.sequence_no != 1) {
            tracing::warn!(trial_id, gaps, entries = entries.len(), "Trial log sequence is not contiguous");
        }

        Ok(entries)
    }
}
