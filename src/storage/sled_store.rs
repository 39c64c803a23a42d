//! Sled-backed trial store
//!
//! Layout (one sled tree per collection, JSON values):
//! - `trials`:    trial_id (u64 BE) -> Trial
//! - `trial_log`: trial_id (u64 BE) ++ sequence_no (u64 BE) -> TrialLogEntry
//! - `records`:   trial_id (u64 BE) -> StoredTrialRecord
//! - `meta`:      "last_trial_id" -> u64 BE
//!
//! Big-endian keys make prefix scans over `trial_log` come back in
//! sequence order.

use std::path::Path;
use std::sync::Arc;

use super::{StoreError, TrialStore};
use crate::types::{PatientId, StoredTrialRecord, Trial, TrialId, TrialLogEntry, TrialStatus};

const LAST_TRIAL_ID_KEY: &[u8] = b"last_trial_id";

/// Trial storage on an embedded sled database
#[derive(Clone)]
pub struct SledTrialStore {
    db: Arc<sled::Db>,
    trials: sled::Tree,
    log: sled::Tree,
    records: sled::Tree,
    meta: sled::Tree,
    flush_each_append: bool,
}

fn log_key(trial_id: TrialId, sequence_no: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&trial_id.to_be_bytes());
    key[8..].copy_from_slice(&sequence_no.to_be_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("expected 8-byte counter, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

impl SledTrialStore {
    /// Open or create the trial database at `path`.
    ///
    /// With `flush_each_append` every log append is flushed before
    /// returning; otherwise sled's background flush applies and the log is
    /// flushed explicitly at finalization and shutdown.
    pub fn open<P: AsRef<Path>>(path: P, flush_each_append: bool) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let db = sled::open(path_ref)?;
        let store = Self {
            trials: db.open_tree("trials")?,
            log: db.open_tree("trial_log")?,
            records: db.open_tree("records")?,
            meta: db.open_tree("meta")?,
            db: Arc::new(db),
            flush_each_append,
        };

        tracing::info!(
            path = %path_ref.display(),
            trials = store.trials.len(),
            pending_log_entries = store.log.len(),
            records = store.records.len(),
            "Trial store opened"
        );

        Ok(store)
    }
}

impl TrialStore for SledTrialStore {
    fn next_trial_id(&self) -> Result<TrialId, StoreError> {
        let updated = self.meta.update_and_fetch(LAST_TRIAL_ID_KEY, |old| {
            let current = old
                .and_then(|b| <[u8; 8]>::try_from(b).ok())
                .map_or(0, u64::from_be_bytes);
            Some((current + 1).to_be_bytes().to_vec())
        })?;

        let bytes = updated.ok_or_else(|| StoreError::Corrupt("trial id counter missing".into()))?;
        let id = decode_u64(&bytes)?;
        self.meta.flush()?;
        Ok(id)
    }

    fn put_trial(&self, trial: &Trial) -> Result<(), StoreError> {
        let value = serde_json::to_vec(trial)?;
        self.trials.insert(trial.trial_id.to_be_bytes(), value)?;
        self.trials.flush()?;
        Ok(())
    }

    fn get_trial(&self, trial_id: TrialId) -> Result<Option<Trial>, StoreError> {
        match self.trials.get(trial_id.to_be_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn list_trials(&self, patient_id: PatientId) -> Result<Vec<Trial>, StoreError> {
        let mut trials = Vec::new();
        for item in self.trials.iter() {
            let (_key, value) = item?;
            match serde_json::from_slice::<Trial>(&value) {
                Ok(trial) if trial.patient_id == patient_id => trials.push(trial),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Skipping undecodable trial row"),
            }
        }
        Ok(trials)
    }

    fn open_trials(&self) -> Result<Vec<Trial>, StoreError> {
        let mut trials = Vec::new();
        for item in self.trials.iter() {
            let (_key, value) = item?;
            let trial: Trial = serde_json::from_slice(&value)?;
            if trial.status != TrialStatus::Closed {
                trials.push(trial);
            }
        }
        Ok(trials)
    }

    fn append_log(&self, entry: &TrialLogEntry) -> Result<(), StoreError> {
        let value = serde_json::to_vec(entry)?;
        self.log
            .insert(log_key(entry.trial_id, entry.sequence_no), value)?;
        if self.flush_each_append {
            self.log.flush()?;
        }
        Ok(())
    }

    fn read_log(&self, trial_id: TrialId) -> Result<Vec<TrialLogEntry>, StoreError> {
        let mut entries = Vec::new();
        for item in self.log.scan_prefix(trial_id.to_be_bytes()) {
            let (_key, value) = item?;
            entries.push(serde_json::from_slice::<TrialLogEntry>(&value)?);
        }
        Ok(entries)
    }

    fn purge_log(&self, trial_id: TrialId) -> Result<usize, StoreError> {
        let mut batch = sled::Batch::default();
        let mut removed = 0;
        for item in self.log.scan_prefix(trial_id.to_be_bytes()) {
            let (key, _value) = item?;
            batch.remove(key);
            removed += 1;
        }

        if removed > 0 {
            self.log.apply_batch(batch)?;
            self.log.flush()?;
            tracing::debug!(trial_id, removed, "Purged trial log");
        }

        Ok(removed)
    }

    fn put_record(&self, record: &StoredTrialRecord) -> Result<(), StoreError> {
        let value = serde_json::to_vec(record)?;
        self.records
            .insert(record.record.trial_id.to_be_bytes(), value)?;
        self.records.flush()?;
        Ok(())
    }

    fn get_record(&self, trial_id: TrialId) -> Result<Option<StoredTrialRecord>, StoreError> {
        match self.records.get(trial_id.to_be_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn ping(&self) -> Result<(), StoreError> {
        self.meta.get(LAST_TRIAL_ID_KEY)?;
        Ok(())
    }

    fn size_bytes(&self) -> Option<u64> {
        self.db.size_on_disk().ok()
    }

    fn backend_name(&self) -> &'static str {
        "Sled"
    }
}
