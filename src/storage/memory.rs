//! In-memory trial store
//!
//! Thread-safe via `RwLock`. Not durable, data is lost on restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::{StoreError, TrialStore};
use crate::types::{PatientId, StoredTrialRecord, Trial, TrialId, TrialLogEntry};

/// In-memory persistence for tests and ephemeral deployments
#[derive(Default)]
pub struct InMemoryTrialStore {
    last_trial_id: AtomicU64,
    trials: RwLock<BTreeMap<TrialId, Trial>>,
    logs: RwLock<HashMap<TrialId, BTreeMap<u64, TrialLogEntry>>>,
    records: RwLock<HashMap<TrialId, StoredTrialRecord>>,
}

impl InMemoryTrialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

impl TrialStore for InMemoryTrialStore {
    fn next_trial_id(&self) -> Result<TrialId, StoreError> {
        Ok(self.last_trial_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn put_trial(&self, trial: &Trial) -> Result<(), StoreError> {
        let mut trials = self.trials.write().map_err(poisoned)?;
        trials.insert(trial.trial_id, trial.clone());
        Ok(())
    }

    fn get_trial(&self, trial_id: TrialId) -> Result<Option<Trial>, StoreError> {
        let trials = self.trials.read().map_err(poisoned)?;
        Ok(trials.get(&trial_id).cloned())
    }

    fn list_trials(&self, patient_id: PatientId) -> Result<Vec<Trial>, StoreError> {
        let trials = self.trials.read().map_err(poisoned)?;
        Ok(trials
            .values()
            .filter(|t| t.patient_id == patient_id)
            .cloned()
            .collect())
    }

    fn open_trials(&self) -> Result<Vec<Trial>, StoreError> {
        let trials = self.trials.read().map_err(poisoned)?;
        Ok(trials
            .values()
            .filter(|t| t.status != crate::types::TrialStatus::Closed)
            .cloned()
            .collect())
    }

    fn append_log(&self, entry: &TrialLogEntry) -> Result<(), StoreError> {
        let mut logs = self.logs.write().map_err(poisoned)?;
        logs.entry(entry.trial_id)
            .or_default()
            .insert(entry.sequence_no, entry.clone());
        Ok(())
    }

    fn read_log(&self, trial_id: TrialId) -> Result<Vec<TrialLogEntry>, StoreError> {
        let logs = self.logs.read().map_err(poisoned)?;
        Ok(logs
            .get(&trial_id)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default())
    }

    fn purge_log(&self, trial_id: TrialId) -> Result<usize, StoreError> {
        let mut logs = self.logs.write().map_err(poisoned)?;
        Ok(logs.remove(&trial_id).map_or(0, |log| log.len()))
    }

    fn put_record(&self, record: &StoredTrialRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        records.insert(record.record.trial_id, record.clone());
        Ok(())
    }

    fn get_record(&self, trial_id: TrialId) -> Result<Option<StoredTrialRecord>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(&trial_id).cloned())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}
