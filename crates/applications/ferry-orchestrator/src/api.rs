//! HTTP control API
//!
//! ```text
//! POST /migrate            {source_identity, target_host, new_identity?} -> {job_id}
//! POST /reattach           {identity, new_egress, hw_identity?, host?}  -> {status, changed}
//! GET  /jobs               -> [JobReport]
//! GET  /jobs/:id           -> JobReport
//! POST /jobs/:id/cancel    -> JobReport
//! POST /cleanup            -> {status, removed}
//! GET  /health             -> {status, endpoints, running_jobs}
//! ```
//!
//! Errors are returned as `{error, kind}` with 404 for unknown objects, 409 for conflicts,
//! 400 for malformed requests and 500 for everything else.

use crate::error::{ErrorKind, OrchestratorError};
use crate::job::JobReport;
use crate::orchestrator::{MigrationOrchestrator, MigrationRequest};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ferry_core::{EgressPort, HostId, MacAddr, NetworkIdentity};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<MigrationOrchestrator>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateRequest {
    pub source_identity: Ipv4Addr,
    pub target_host: HostId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_identity: Option<NetworkIdentity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateResponse {
    pub job_id: Uuid,
}

/// Direct forwarding update for an endpoint already running at its new attachment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReattachRequest {
    pub identity: Ipv4Addr,
    pub new_egress: EgressPort,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_identity: Option<MacAddr>,
    /// Host the endpoint now runs on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReattachResponse {
    pub status: String,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub status: String,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub endpoints: usize,
    pub running_jobs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: ErrorKind,
}

/// Orchestrator error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(OrchestratorError::invalid(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict | ErrorKind::ReferentialIntegrity => StatusCode::CONFLICT,
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            kind,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Build the control API router
pub fn router(orchestrator: Arc<MigrationOrchestrator>) -> Router {
    Router::new()
        .route("/migrate", post(migrate))
        .route("/reattach", post(reattach))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(job_status))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/cleanup", post(cleanup))
        .route("/health", get(health))
        .with_state(AppState { orchestrator })
}

async fn migrate(
    State(state): State<AppState>,
    payload: Result<Json<MigrateRequest>, JsonRejection>,
) -> ApiResult<MigrateResponse> {
    let Json(request) = payload?;
    let handle = state.orchestrator.submit(MigrationRequest {
        source: request.source_identity,
        target_host: request.target_host,
        new_identity: request.new_identity,
    })?;
    Ok(Json(MigrateResponse { job_id: handle.id }))
}

async fn reattach(
    State(state): State<AppState>,
    payload: Result<Json<ReattachRequest>, JsonRejection>,
) -> ApiResult<ReattachResponse> {
    let Json(request) = payload?;
    let store = state.orchestrator.store();
    if let Some(owner) = store.lease_holder(request.identity) {
        return Err(OrchestratorError::conflict(format!(
            "endpoint {} is being migrated by job {}",
            request.identity, owner
        ))
        .into());
    }

    let changed = store.relocate(
        request.identity,
        request.new_egress,
        request.hw_identity,
        request.host,
    )?;
    info!(
        endpoint = %request.identity,
        egress = %request.new_egress,
        changed,
        "Direct forwarding update"
    );
    Ok(Json(ReattachResponse {
        status: "success".to_string(),
        changed,
    }))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobReport>> {
    Json(
        state
            .orchestrator
            .jobs()
            .iter()
            .map(|job| job.report())
            .collect(),
    )
}

async fn job_status(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<JobReport> {
    let job = state
        .orchestrator
        .job(id)
        .ok_or_else(|| OrchestratorError::not_found(format!("job {}", id)))?;
    Ok(Json(job.report()))
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<JobReport> {
    Ok(Json(state.orchestrator.cancel(id)?))
}

async fn cleanup(State(state): State<AppState>) -> ApiResult<CleanupResponse> {
    let removed = state.orchestrator.store().teardown_all()?;
    Ok(Json(CleanupResponse {
        status: "success".to_string(),
        removed,
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        endpoints: state.orchestrator.store().snapshot().endpoints.len(),
        running_jobs: state.orchestrator.running_jobs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, Phase};
    use crate::testing::{FakeAgent, Harness};
    use axum::body::Body;
    use axum::http::Request;
    use serde::de::DeserializeOwned;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn call<T: DeserializeOwned>(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, T) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(json) => Body::from(json.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_migrate_and_poll_status() {
        let h = Harness::new();
        let app = router(h.orchestrator.clone());

        let (status, created): (_, MigrateResponse) = call(
            &app,
            "POST",
            "/migrate",
            Some(serde_json::json!({
                "source_identity": "10.0.0.12",
                "target_host": "host-b"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        tokio::time::sleep(Duration::from_secs(5)).await;

        let (status, report): (_, JobReport) =
            call(&app, "GET", &format!("/jobs/{}", created.job_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report.status, JobStatus::Succeeded);
        assert_eq!(report.phase, Phase::Done);
        assert!(report.timings_ms.time_to_ready_ms.is_some());

        let (_, jobs): (_, Vec<JobReport>) = call(&app, "GET", "/jobs", None).await;
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_migrate_errors() {
        let h = Harness::new();
        let app = router(h.orchestrator.clone());

        let (status, body): (_, ErrorBody) = call(
            &app,
            "POST",
            "/migrate",
            Some(serde_json::json!({ "source_identity": "10.0.0.99", "target_host": "host-b" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.kind, ErrorKind::NotFound);

        let (status, body): (_, ErrorBody) = call(
            &app,
            "POST",
            "/migrate",
            Some(serde_json::json!({ "source_identity": "not-an-ip" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.kind, ErrorKind::InvalidRequest);

        let (status, _): (_, ErrorBody) =
            call(&app, "GET", &format!("/jobs/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_migration_is_conflict() {
        let h = Harness::with_agent(FakeAgent::new().with_unbounded_queue());
        let app = router(h.orchestrator.clone());
        let body = serde_json::json!({ "source_identity": "10.0.0.11", "target_host": "host-b" });

        let (status, _): (_, MigrateResponse) =
            call(&app, "POST", "/migrate", Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let (status, error): (_, ErrorBody) = call(&app, "POST", "/migrate", Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error.kind, ErrorKind::Conflict);

        // Direct updates are refused while the migration holds the endpoint
        let (status, _): (_, ErrorBody) = call(
            &app,
            "POST",
            "/reattach",
            Some(serde_json::json!({ "identity": "10.0.0.11", "new_egress": 3 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_endpoint() {
        let h = Harness::with_agent(FakeAgent::new().with_unbounded_queue());
        let app = router(h.orchestrator.clone());

        let (_, created): (_, MigrateResponse) = call(
            &app,
            "POST",
            "/migrate",
            Some(serde_json::json!({ "source_identity": "10.0.0.11", "target_host": "host-b" })),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let uri = format!("/jobs/{}/cancel", created.job_id);
        let (status, report): (_, JobReport) = call(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(report.cancel_requested);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let (_, report): (_, JobReport) =
            call(&app, "GET", &format!("/jobs/{}", created.job_id), None).await;
        assert_eq!(report.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_reattach_is_idempotent() {
        let h = Harness::new();
        let app = router(h.orchestrator.clone());
        let body = serde_json::json!({
            "identity": "10.0.0.12",
            "new_egress": 3,
            "host": "host-c"
        });

        let (status, first): (_, ReattachResponse) =
            call(&app, "POST", "/reattach", Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first.status, "success");
        assert!(first.changed);

        let (_, second): (_, ReattachResponse) = call(&app, "POST", "/reattach", Some(body)).await;
        assert!(!second.changed);
        assert_eq!(
            h.store.forward(Ipv4Addr::new(10, 0, 0, 12)).unwrap().egress,
            EgressPort(3)
        );
        assert_eq!(
            h.store.endpoint(Ipv4Addr::new(10, 0, 0, 12)).unwrap().host,
            HostId::new("host-c")
        );
    }

    #[tokio::test]
    async fn test_cleanup_and_health() {
        let h = Harness::new();
        let app = router(h.orchestrator.clone());

        let (status, health): (_, HealthResponse) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health.endpoints, 5);
        assert_eq!(health.running_jobs, 0);

        let (status, cleanup): (_, CleanupResponse) = call(&app, "POST", "/cleanup", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(cleanup.removed > 0);

        let (_, health): (_, HealthResponse) = call(&app, "GET", "/health", None).await;
        assert_eq!(health.endpoints, 0);
        assert_eq!(h.store.snapshot(), Default::default());
    }
}
