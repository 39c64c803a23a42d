//! Trial lifecycle errors

use crate::storage::StoreError;
use crate::types::{PatientId, TrialId};

/// Errors surfaced by trial start/end, accumulation and finalization.
#[derive(Debug, thiserror::Error)]
pub enum TrialError {
    #[error("invalid patient id {0}")]
    InvalidPatient(PatientId),

    #[error("patient {patient_id} has no active trial")]
    NoActiveTrial { patient_id: PatientId },

    #[error("trial {trial_id} is not accepting readings")]
    TrialNotActive { trial_id: TrialId },

    #[error("reading for patient {patient_id} does not belong to trial {trial_id}")]
    PatientMismatch {
        trial_id: TrialId,
        patient_id: PatientId,
    },

    #[error("trial {trial_id} has no accumulated readings")]
    EmptyTrial { trial_id: TrialId },

    #[error("persistence failure for trial {trial_id}: {source}")]
    PersistenceFailure {
        trial_id: TrialId,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TrialError {
    /// Trial the error refers to, when there is one.
    pub fn trial_id(&self) -> Option<TrialId> {
        match self {
            TrialError::TrialNotActive { trial_id }
            | TrialError::PatientMismatch { trial_id, .. }
            | TrialError::EmptyTrial { trial_id }
            | TrialError::PersistenceFailure { trial_id, .. } => Some(*trial_id),
            TrialError::InvalidPatient(_)
            | TrialError::NoActiveTrial { .. }
            | TrialError::Store(_) => None,
        }
    }

    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            TrialError::InvalidPatient(_) => "INVALID_PATIENT",
            TrialError::NoActiveTrial { .. } => "NO_ACTIVE_TRIAL",
            TrialError::TrialNotActive { .. } => "TRIAL_NOT_ACTIVE",
            TrialError::PatientMismatch { .. } => "PATIENT_MISMATCH",
            TrialError::EmptyTrial { .. } => "EMPTY_TRIAL",
            TrialError::PersistenceFailure { .. } | TrialError::Store(_) => "PERSISTENCE_FAILURE",
        }
    }

    pub(crate) fn persistence(trial_id: TrialId) -> impl FnOnce(StoreError) -> Self {
        move |source| TrialError::PersistenceFailure { trial_id, source }
    }
}
