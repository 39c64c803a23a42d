//! API route definitions
//!
//! - /api/v1/patients/:patient_id/trial/start - start (or return) a trial
//! - /api/v1/patients/:patient_id/trial/end   - finalize the active trial
//! - /api/v1/patients/:patient_id/trial       - current lifecycle state
//! - /api/v1/patients/:patient_id/trials      - trial history
//! - /api/v1/patients/:patient_id/live        - rolling buffer readings
//! - /api/v1/trials/:trial_id[/record]        - trial row / finalized record
//! - /health, /ws/stream/:patient_id          - root-level endpoints

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{self, ApiState};
use super::ws;

/// Versioned REST routes, nested under `/api/v1`.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/patients/:patient_id/trial/start", post(handlers::start_trial))
        .route("/patients/:patient_id/trial/end", post(handlers::end_trial))
        .route("/patients/:patient_id/trial", get(handlers::get_trial_state))
        .route("/patients/:patient_id/trials", get(handlers::list_patient_trials))
        .route("/patients/:patient_id/live", get(handlers::get_live_readings))
        .route("/trials/:trial_id", get(handlers::get_trial))
        .route("/trials/:trial_id/record", get(handlers::get_trial_record))
        .with_state(state)
}

/// Health check and the device stream endpoint.
pub fn root_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ws/stream/:patient_id", get(ws::stream_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::service::TelemetryService;
    use crate::storage::InMemoryTrialStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn create_test_state() -> ApiState {
        let service =
            TelemetryService::new(ServiceConfig::default(), Arc::new(InMemoryTrialStore::new()))
                .unwrap();
        ApiState::new(Arc::new(service))
    }

    #[tokio::test]
    async fn test_api_routes_trial_state() {
        let app = api_routes(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/patients/1/trial")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_root_routes_health() {
        let app = root_routes(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stream_requires_upgrade() {
        let app = root_routes(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ws/stream/1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_trial_is_404() {
        let app = api_routes(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/trials/999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
