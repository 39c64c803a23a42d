//! Trial State Machine
//!
//! Per-patient lifecycle: `Inactive -> Active -> Finalizing -> Closed`.
//!
//! Each patient has two locks:
//! - `control` (async): serializes start/end for that patient, held across
//!   the whole finalization so a concurrent start observes either the
//!   reverted `Active` trial or a clean `Inactive` state;
//! - `phase` (sync): guards the current phase for cheap lookups from the
//!   ingestion path. Never held across an await.
//!
//! No lock spans more than one patient.
//!
//! Store calls made from the async paths run on the blocking pool: sled
//! writes flush to disk and finalization reads and purges the whole log.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use super::{FinalizeOutcome, TrialAccumulator, TrialError, TrialFinalizer};
use crate::storage::{StoreError, TrialStore};
use crate::types::{FinalizedTrialRecord, PatientId, Trial, TrialId, TrialStatus};

#[derive(Debug, Clone, Default)]
enum Phase {
    #[default]
    Inactive,
    Active(Trial),
    Finalizing(Trial),
}

#[derive(Default)]
struct PatientSlot {
    control: tokio::sync::Mutex<()>,
    phase: Mutex<Phase>,
}

impl PatientSlot {
    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Externally visible lifecycle state for a patient.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrialState {
    Inactive,
    Active { trial: Trial },
    Finalizing { trial: Trial },
}

/// Result of `start_trial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub trial_id: TrialId,
    /// True when an active trial already existed and was returned as-is.
    pub already_active: bool,
}

/// Result of a successful `end_trial`.
#[derive(Debug, Clone)]
pub struct EndOutcome {
    pub trial_id: TrialId,
    pub readings: usize,
    pub record_ref: String,
    pub record: FinalizedTrialRecord,
}

/// Counts from the startup recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Trials restored to `Active` with their log intact.
    pub resumed: usize,
    /// Trials whose record was already stored and were closed out.
    pub completed: usize,
}

pub struct TrialStateMachine {
    store: Arc<dyn TrialStore>,
    accumulator: Arc<TrialAccumulator>,
    finalizer: Arc<TrialFinalizer>,
    slots: RwLock<HashMap<PatientId, Arc<PatientSlot>>>,
}

impl TrialStateMachine {
    pub fn new(store: Arc<dyn TrialStore>, accumulator: Arc<TrialAccumulator>) -> Self {
        Self {
            finalizer: Arc::new(TrialFinalizer::new(
                Arc::clone(&store),
                Arc::clone(&accumulator),
            )),
            store,
            accumulator,
            slots: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, patient_id: PatientId) -> Arc<PatientSlot> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&patient_id)
        {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(patient_id).or_default())
    }

    fn existing_slot(&self, patient_id: PatientId) -> Option<Arc<PatientSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&patient_id)
            .cloned()
    }

    /// Start a trial, or return the one already active for this patient.
    pub async fn start_trial(
        &self,
        patient_id: PatientId,
        device_id: Option<String>,
    ) -> Result<StartOutcome, TrialError> {
        if patient_id <= 0 {
            return Err(TrialError::InvalidPatient(patient_id));
        }

        let slot = self.slot(patient_id);
        let _control = slot.control.lock().await;

        if let Phase::Active(trial) | Phase::Finalizing(trial) = &*slot.phase() {
            tracing::warn!(
                patient_id,
                trial_id = trial.trial_id,
                "Start requested while a trial is active, returning existing trial"
            );
            return Ok(StartOutcome {
                trial_id: trial.trial_id,
                already_active: true,
            });
        }

        let store = Arc::clone(&self.store);
        let trial = on_blocking_pool(move || {
            let trial = Trial::start(store.next_trial_id()?, patient_id, device_id);
            store.put_trial(&trial)?;
            Ok(trial)
        })
        .await?;
        let trial_id = trial.trial_id;
        self.accumulator.open(trial_id, patient_id);

        tracing::info!(
            patient_id,
            trial_id,
            device_id = trial.device_id.as_deref().unwrap_or("-"),
            "Trial started"
        );
        *slot.phase() = Phase::Active(trial);

        Ok(StartOutcome {
            trial_id,
            already_active: false,
        })
    }

    /// End the active trial and finalize it into a record.
    ///
    /// On any finalization error the trial returns to `Active` with its log
    /// intact, so the call can be retried.
    pub async fn end_trial(&self, patient_id: PatientId) -> Result<EndOutcome, TrialError> {
        let Some(slot) = self.existing_slot(patient_id) else {
            return Err(TrialError::NoActiveTrial { patient_id });
        };
        let _control = slot.control.lock().await;

        let trial = {
            let mut phase = slot.phase();
            let Phase::Active(trial) = &*phase else {
                return Err(TrialError::NoActiveTrial { patient_id });
            };
            let trial = trial.clone();
            *phase = Phase::Finalizing(trial.clone());
            trial
        };
        let trial_id = trial.trial_id;

        // Barrier: after this no reading can be appended to the trial.
        self.accumulator.seal(trial_id);
        tracing::info!(patient_id, trial_id, "Trial finalizing");

        let store = Arc::clone(&self.store);
        let finalizer = Arc::clone(&self.finalizer);
        let job = trial.clone();
        let result = on_blocking_pool(move || {
            store
                .put_trial(&job.clone().with_status(TrialStatus::Finalizing))
                .map_err(TrialError::persistence(trial_id))?;
            finalizer.finalize(&job)
        })
        .await;

        match result {
            Ok(FinalizeOutcome {
                record,
                record_ref,
                readings,
                recovered,
            }) => {
                *slot.phase() = Phase::Inactive;
                self.accumulator.forget(trial_id);
                tracing::info!(patient_id, trial_id, readings, recovered, "Trial closed");
                Ok(EndOutcome {
                    trial_id,
                    readings,
                    record_ref,
                    record,
                })
            }
            Err(e) => {
                tracing::warn!(patient_id, trial_id, error = %e, "Finalization failed, trial reverted to active");
                self.revert(&slot, trial).await;
                Err(e)
            }
        }
    }

    async fn revert(&self, slot: &PatientSlot, trial: Trial) {
        let trial = trial.with_status(TrialStatus::Active);
        let store = Arc::clone(&self.store);
        let row = trial.clone();
        if let Err(e) = on_blocking_pool(move || Ok(store.put_trial(&row)?)).await {
            // Recovery treats a record-less Finalizing row as Active.
            tracing::warn!(trial_id = trial.trial_id, error = %e, "Could not persist reverted trial status");
        }
        self.accumulator.reopen(trial.trial_id);
        *slot.phase() = Phase::Active(trial);
    }

    /// The trial currently accepting readings for a patient, if any.
    pub fn active_trial(&self, patient_id: PatientId) -> Option<TrialId> {
        let slot = self.existing_slot(patient_id)?;
        let phase = slot.phase();
        match &*phase {
            Phase::Active(trial) => Some(trial.trial_id),
            Phase::Inactive | Phase::Finalizing(_) => None,
        }
    }

    pub fn state(&self, patient_id: PatientId) -> TrialState {
        let Some(slot) = self.existing_slot(patient_id) else {
            return TrialState::Inactive;
        };
        let phase = slot.phase();
        match &*phase {
            Phase::Inactive => TrialState::Inactive,
            Phase::Active(trial) => TrialState::Active {
                trial: trial.clone(),
            },
            Phase::Finalizing(trial) => TrialState::Finalizing {
                trial: trial.clone(),
            },
        }
    }

    /// Number of patients with a trial in progress.
    pub fn active_count(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| !matches!(&*slot.phase(), Phase::Inactive))
            .count()
    }

    /// Rebuild in-memory state from the store after a restart.
    ///
    /// Must run before any stream or control traffic is accepted.
    pub fn recover(&self) -> Result<RecoveryReport, TrialError> {
        let mut open = self.store.open_trials()?;
        open.sort_by_key(|t| t.trial_id);

        let mut report = RecoveryReport::default();
        for trial in open {
            let trial_id = trial.trial_id;

            if let Some(stored) = self
                .store
                .get_record(trial_id)
                .map_err(TrialError::persistence(trial_id))?
            {
                self.finalizer.complete(&trial, stored.record, true);
                report.completed += 1;
                tracing::info!(trial_id, "Recovered finalized trial, closed out");
                continue;
            }

            let slot = self.slot(trial.patient_id);
            let mut phase = slot.phase();
            if let Phase::Active(previous) = &*phase {
                // Two open rows for one patient: keep the newer one active and
                // leave the older row and its log untouched for inspection.
                tracing::error!(
                    patient_id = trial.patient_id,
                    kept = trial_id,
                    left_open = previous.trial_id,
                    "Multiple open trials for patient"
                );
                self.accumulator.forget(previous.trial_id);
            }

            let entries = self.accumulator.resume(&trial)?;
            let trial = trial.with_status(TrialStatus::Active);
            self.store
                .put_trial(&trial)
                .map_err(TrialError::persistence(trial_id))?;
            tracing::info!(
                patient_id = trial.patient_id,
                trial_id,
                entries,
                "Resumed active trial"
            );
            *phase = Phase::Active(trial);
            report.resumed += 1;
        }

        Ok(report)
    }
}

/// Run store work off the async workers.
async fn on_blocking_pool<T, F>(work: F) -> Result<T, TrialError>
where
    F: FnOnce() -> Result<T, TrialError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.unwrap_or_else(|e| {
        Err(TrialError::Store(StoreError::Unavailable(format!(
            "store task failed: {e}"
        ))))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryTrialStore;
    use crate::types::{Reading, SensorValue};
    use std::collections::BTreeMap;

    fn machine() -> (Arc<InMemoryTrialStore>, Arc<TrialAccumulator>, TrialStateMachine) {
        let store = Arc::new(InMemoryTrialStore::new());
        let accumulator = Arc::new(TrialAccumulator::new(store.clone(), true));
        let sm = TrialStateMachine::new(store.clone(), Arc::clone(&accumulator));
        (store, accumulator, sm)
    }

    fn reading(patient_id: PatientId, hr: f64) -> Reading {
        let mut values = BTreeMap::new();
        values.insert("heart_rate".to_string(), SensorValue::Number(hr));
        Reading::new(patient_id, "dev1", values)
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_active() {
        let (_, _, sm) = machine();
        let first = sm.start_trial(42, None).await.unwrap();
        let second = sm.start_trial(42, Some("other".into())).await.unwrap();

        assert!(!first.already_active);
        assert!(second.already_active);
        assert_eq!(first.trial_id, second.trial_id);
        assert_eq!(sm.active_trial(42), Some(first.trial_id));
    }

    #[tokio::test]
    async fn test_invalid_patient_rejected() {
        let (_, _, sm) = machine();
        assert!(matches!(
            sm.start_trial(0, None).await,
            Err(TrialError::InvalidPatient(0))
        ));
    }

    #[tokio::test]
    async fn test_end_without_trial() {
        let (_, _, sm) = machine();
        assert!(matches!(
            sm.end_trial(42).await,
            Err(TrialError::NoActiveTrial { patient_id: 42 })
        ));
    }

    #[tokio::test]
    async fn test_empty_trial_reverts_to_active() {
        let (_, acc, sm) = machine();
        let start = sm.start_trial(42, None).await.unwrap();

        let err = sm.end_trial(42).await.unwrap_err();
        assert!(matches!(err, TrialError::EmptyTrial { .. }));
        assert_eq!(sm.active_trial(42), Some(start.trial_id));
        assert!(acc.is_open(start.trial_id));

        acc.append(start.trial_id, reading(42, 70.0)).unwrap();
        let end = sm.end_trial(42).await.unwrap();
        assert_eq!(end.readings, 1);
        assert_eq!(sm.state(42), TrialState::Inactive);
    }

    #[tokio::test]
    async fn test_end_closes_trial_and_purges_log() {
        let (store, acc, sm) = machine();
        let start = sm.start_trial(42, Some("dev1".into())).await.unwrap();
        for hr in [70.0, 72.0, 75.0] {
            acc.append(start.trial_id, reading(42, hr)).unwrap();
        }

        let end = sm.end_trial(42).await.unwrap();
        assert_eq!(end.readings, 3);
        assert_eq!(end.record_ref, format!("trial_records/{}", start.trial_id));

        let row = store.get_trial(start.trial_id).unwrap().unwrap();
        assert_eq!(row.status, TrialStatus::Closed);
        assert!(row.end_time.is_some());
        assert!(store.read_log(start.trial_id).unwrap().is_empty());
        assert!(store.get_record(start.trial_id).unwrap().is_some());
        assert!(!acc.is_open(start.trial_id));

        let next = sm.start_trial(42, None).await.unwrap();
        assert!(next.trial_id > start.trial_id);
    }

    #[tokio::test]
    async fn test_recover_resumes_open_trial() {
        let store = Arc::new(InMemoryTrialStore::new());
        let trial_id = {
            let acc = Arc::new(TrialAccumulator::new(store.clone(), true));
            let sm = TrialStateMachine::new(store.clone(), Arc::clone(&acc));
            let id = sm.start_trial(7, None).await.unwrap().trial_id;
            acc.append(id, reading(7, 60.0)).unwrap();
            id
        };

        let acc = Arc::new(TrialAccumulator::new(store.clone(), true));
        let sm = TrialStateMachine::new(store, Arc::clone(&acc));
        let report = sm.recover().unwrap();

        assert_eq!(report, RecoveryReport { resumed: 1, completed: 0 });
        assert_eq!(sm.active_trial(7), Some(trial_id));
        assert_eq!(acc.appended_count(trial_id), Some(1));
        assert_eq!(sm.end_trial(7).await.unwrap().readings, 1);
    }
}
