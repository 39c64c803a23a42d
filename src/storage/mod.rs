//! Durable trial storage
//!
//! The `TrialStore` trait is the seam between the trial lifecycle and its
//! durable collaborators:
//! - trial rows (one per trial, never deleted)
//! - the trial-scoped append log (purged only after finalization commits)
//! - finalized trial records with their metadata summary
//!
//! Backends:
//! - `SledTrialStore`: embedded sled database for deployments
//! - `InMemoryTrialStore`: process-local store for tests and ephemeral runs

mod memory;
mod sled_store;

pub use memory::InMemoryTrialStore;
pub use sled_store::SledTrialStore;

use crate::types::{PatientId, StoredTrialRecord, Trial, TrialId, TrialLogEntry};

/// Storage backend errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt entry: {0}")]
    Corrupt(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Trait for pluggable trial persistence backends
///
/// Every method is a single-row write or a read; no multi-row transaction
/// is required of implementations. Implementations must be thread-safe.
pub trait TrialStore: Send + Sync {
    /// Allocate the next trial id. Ids start at 1 and are never reused.
    fn next_trial_id(&self) -> Result<TrialId, StoreError>;

    /// Insert or replace a trial row.
    fn put_trial(&self, trial: &Trial) -> Result<(), StoreError>;

    fn get_trial(&self, trial_id: TrialId) -> Result<Option<Trial>, StoreError>;

    /// All trials for a patient, oldest first.
    fn list_trials(&self, patient_id: PatientId) -> Result<Vec<Trial>, StoreError>;

    /// All trials whose status is not `Closed`.
    fn open_trials(&self) -> Result<Vec<Trial>, StoreError>;

    /// Append one log entry. Re-appending the same `(trial_id, sequence_no)`
    /// overwrites rather than duplicates.
    fn append_log(&self, entry: &TrialLogEntry) -> Result<(), StoreError>;

    /// Full log for a trial in `sequence_no` order. Never deletes.
    fn read_log(&self, trial_id: TrialId) -> Result<Vec<TrialLogEntry>, StoreError>;

    /// Delete a trial's log. Idempotent; returns the number of entries removed.
    fn purge_log(&self, trial_id: TrialId) -> Result<usize, StoreError>;

    /// Write a finalized record and its metadata as one value.
    fn put_record(&self, record: &StoredTrialRecord) -> Result<(), StoreError>;

    fn get_record(&self, trial_id: TrialId) -> Result<Option<StoredTrialRecord>, StoreError>;

    /// Force buffered writes to durable storage.
    fn flush(&self) -> Result<(), StoreError>;

    /// Cheap liveness probe for health checks.
    fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Approximate on-disk footprint, when the backend has one.
    fn size_bytes(&self) -> Option<u64> {
        None
    }

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}
