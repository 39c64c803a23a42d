//! API route handlers
//!
//! Request handling for trial control and the read-only views:
//! - trial start / end per patient
//! - current lifecycle state and trial history
//! - live rolling-buffer readings
//! - trial rows and finalized records
//! - service health

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::envelope::{ApiErrorResponse, ApiResponse};
use crate::config::defaults;
use crate::service::TelemetryService;
use crate::trials::{TrialError, TrialState};
use crate::types::{record_ref, PatientId, Reading, Trial, TrialId};

// ============================================================================
// API State
// ============================================================================

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<TelemetryService>,
}

impl ApiState {
    pub fn new(service: Arc<TelemetryService>) -> Self {
        Self { service }
    }
}

// ============================================================================
// Trial Control
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct StartTrialRequest {
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartTrialResponse {
    pub trial_id: TrialId,
    pub status: &'static str,
    pub already_active: bool,
}

/// POST /api/v1/patients/:patient_id/trial/start
///
/// Body is optional: `{"device_id": "..."}`.
pub async fn start_trial(
    State(state): State<ApiState>,
    Path(patient_id): Path<PatientId>,
    body: Bytes,
) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        StartTrialRequest::default()
    } else {
        match serde_json::from_slice::<StartTrialRequest>(&body) {
            Ok(r) => r,
            Err(e) => return ApiErrorResponse::bad_request(format!("Invalid request body: {e}")),
        }
    };

    match state
        .service
        .trials()
        .start_trial(patient_id, request.device_id)
        .await
    {
        Ok(outcome) => ApiResponse::ok(StartTrialResponse {
            trial_id: outcome.trial_id,
            status: "started",
            already_active: outcome.already_active,
        }),
        Err(e) => {
            tracing::warn!(patient_id, error = %e, "start_trial failed");
            ApiErrorResponse::trial(&e)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EndTrialResponse {
    pub trial_id: TrialId,
    pub status: &'static str,
    pub record_ref: String,
    pub readings: usize,
}

/// POST /api/v1/patients/:patient_id/trial/end
///
/// Runs finalization on its own task under the configured timeout. A timeout
/// means the trial may still be active and its state should be rechecked;
/// finalization keeps running regardless.
pub async fn end_trial(
    State(state): State<ApiState>,
    Path(patient_id): Path<PatientId>,
) -> Response {
    let timeout = state.service.config().trials.end_timeout();
    let trials = Arc::clone(state.service.trials());
    let task = tokio::spawn(async move { trials.end_trial(patient_id).await });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(outcome))) => ApiResponse::ok(EndTrialResponse {
            trial_id: outcome.trial_id,
            status: "completed",
            record_ref: outcome.record_ref,
            readings: outcome.readings,
        }),
        Ok(Ok(Err(e))) => {
            log_end_failure(patient_id, &e);
            ApiErrorResponse::trial(&e)
        }
        Ok(Err(join_err)) => {
            tracing::error!(patient_id, error = %join_err, "end_trial task failed");
            ApiErrorResponse::internal("end_trial task failed; recheck trial status")
        }
        Err(_) => {
            tracing::warn!(patient_id, timeout_secs = timeout.as_secs(), "end_trial timed out");
            ApiErrorResponse::gateway_timeout(
                "end_trial did not complete in time; the trial may still be active, recheck status",
            )
        }
    }
}

fn log_end_failure(patient_id: PatientId, err: &TrialError) {
    match err {
        TrialError::NoActiveTrial { .. } | TrialError::EmptyTrial { .. } => {
            tracing::info!(patient_id, error = %err, "end_trial rejected");
        }
        _ => tracing::error!(patient_id, error = %err, "end_trial failed"),
    }
}

/// GET /api/v1/patients/:patient_id/trial
pub async fn get_trial_state(
    State(state): State<ApiState>,
    Path(patient_id): Path<PatientId>,
) -> Response {
    let trial_state: TrialState = state.service.trials().state(patient_id);
    ApiResponse::ok(trial_state)
}

/// GET /api/v1/patients/:patient_id/trials
pub async fn list_patient_trials(
    State(state): State<ApiState>,
    Path(patient_id): Path<PatientId>,
) -> Response {
    match state.service.store().list_trials(patient_id) {
        Ok(trials) => ApiResponse::ok(trials),
        Err(e) => {
            tracing::error!(patient_id, error = %e, "Failed to list trials");
            ApiErrorResponse::internal(format!("Failed to list trials: {e}"))
        }
    }
}

// ============================================================================
// Live Readings
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LiveResponse {
    pub patient_id: PatientId,
    pub count: usize,
    /// Oldest first.
    pub readings: Vec<Reading>,
}

/// GET /api/v1/patients/:patient_id/live?limit=N
pub async fn get_live_readings(
    State(state): State<ApiState>,
    Path(patient_id): Path<PatientId>,
    Query(q): Query<LimitQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(defaults::LIVE_QUERY_DEFAULT_LIMIT);
    let readings = state.service.buffer().query(patient_id, limit);
    ApiResponse::ok(LiveResponse {
        patient_id,
        count: readings.len(),
        readings,
    })
}

// ============================================================================
// Trials & Records
// ============================================================================

/// GET /api/v1/trials/:trial_id
pub async fn get_trial(State(state): State<ApiState>, Path(trial_id): Path<TrialId>) -> Response {
    match state.service.store().get_trial(trial_id) {
        Ok(Some(trial)) => ApiResponse::<Trial>::ok(trial),
        Ok(None) => ApiErrorResponse::not_found(format!("Trial {trial_id} not found")),
        Err(e) => ApiErrorResponse::internal(format!("Failed to read trial: {e}")),
    }
}

#[derive(Debug, Serialize)]
pub struct RecordResponse {
    pub record_ref: String,
    pub record: crate::types::FinalizedTrialRecord,
    pub metadata: String,
}

/// GET /api/v1/trials/:trial_id/record
pub async fn get_trial_record(
    State(state): State<ApiState>,
    Path(trial_id): Path<TrialId>,
) -> Response {
    match state.service.store().get_record(trial_id) {
        Ok(Some(stored)) => ApiResponse::ok(RecordResponse {
            record_ref: record_ref(trial_id),
            record: stored.record,
            metadata: stored.metadata,
        }),
        Ok(None) => ApiErrorResponse::not_found(format!("No finalized record for trial {trial_id}")),
        Err(e) => ApiErrorResponse::internal(format!("Failed to read record: {e}")),
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub snapshot: crate::service::HealthSnapshot,
}

/// GET /health
pub async fn health_check(State(state): State<ApiState>) -> Response {
    let snapshot = state.service.health().await;
    if snapshot.store_ok {
        ApiResponse::ok(HealthResponse {
            status: "healthy",
            snapshot,
        })
    } else {
        ApiResponse::with_status(
            StatusCode::SERVICE_UNAVAILABLE,
            HealthResponse {
                status: "degraded",
                snapshot,
            },
        )
    }
}
