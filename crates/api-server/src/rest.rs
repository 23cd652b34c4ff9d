//! REST handlers for segment and membership operations plus operational
//! endpoints. Handlers only translate JSON to service calls and the
//! error taxonomy to status codes.

use audience_core::error::ErrorKind;
use audience_core::types::AuditRecord;
use audience_core::AudienceError;
use audience_segmentation::{
    CreateSegment, MembershipService, SegmentCreated, SegmentService, SetSegments, WorkerStatus,
};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, warn};

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub membership: MembershipService,
    pub segments: SegmentService,
    pub node_id: String,
    pub start_time: Instant,
    shutdown: watch::Receiver<bool>,
    worker: Option<watch::Receiver<WorkerStatus>>,
}

impl AppState {
    pub fn new(
        membership: MembershipService,
        segments: SegmentService,
        node_id: String,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            membership,
            segments,
            node_id,
            start_time: Instant::now(),
            shutdown,
            worker: None,
        }
    }

    /// Report the expiry worker's status on `/health`.
    pub fn with_worker(mut self, status: watch::Receiver<WorkerStatus>) -> Self {
        self.worker = Some(status);
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSegmentRequest {
    pub slug: String,
    /// Basis points of existing users to enroll; 0 or absent enrolls nobody.
    #[serde(default)]
    pub percentage_users: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteSegmentRequest {
    pub slug: String,
}

#[derive(Debug, Deserialize)]
pub struct SetSegmentsRequest {
    pub user_id: String,
    #[serde(default)]
    pub segments_add: Vec<String>,
    #[serde(default)]
    pub segments_del: Vec<String>,
    /// Minutes until the added memberships expire.
    #[serde(default)]
    pub ttl: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetSegmentsResponse {
    pub user_id: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub audit_recorded: bool,
}

#[derive(Debug, Deserialize)]
pub struct ActiveSegmentsQuery {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActiveSegmentsResponse {
    pub user_id: String,
    pub segments: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryRequest {
    pub user_id: String,
    pub year: i32,
    pub month: u32,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub user_id: String,
    pub records: Vec<AuditRecord>,
}

/// POST /api/v1/segments/create
pub async fn create_segment(
    State(state): State<AppState>,
    Json(request): Json<CreateSegmentRequest>,
) -> Result<(StatusCode, Json<SegmentCreated>), ApiError> {
    let created = state
        .segments
        .create_segment(CreateSegment {
            slug: request.slug,
            percentage: request.percentage_users.filter(|p| *p != 0),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// DELETE /api/v1/segments/delete
pub async fn delete_segment(
    State(state): State<AppState>,
    Json(request): Json<DeleteSegmentRequest>,
) -> Result<StatusCode, ApiError> {
    state.segments.delete_segment(&request.slug).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/users/segments
pub async fn set_segments(
    State(state): State<AppState>,
    Json(request): Json<SetSegmentsRequest>,
) -> Result<Json<SetSegmentsResponse>, ApiError> {
    let change = state
        .membership
        .set_segments(SetSegments {
            user_id: request.user_id,
            add: request.segments_add,
            remove: request.segments_del,
            ttl_minutes: request.ttl,
        })
        .await?;

    Ok(Json(SetSegmentsResponse {
        audit_recorded: change.audit.is_recorded(),
        user_id: change.user_id,
        added: change.added,
        removed: change.removed,
        expires_at: change.expires_at,
    }))
}

/// GET /api/v1/users/active-segments?user_id=
pub async fn active_segments(
    State(state): State<AppState>,
    Query(query): Query<ActiveSegmentsQuery>,
) -> Result<Json<ActiveSegmentsResponse>, ApiError> {
    let segments = state.membership.active_segments(&query.user_id).await?;
    Ok(Json(ActiveSegmentsResponse {
        user_id: query.user_id,
        segments,
    }))
}

/// POST /api/v1/history
pub async fn history(
    State(state): State<AppState>,
    Json(request): Json<HistoryRequest>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let records = state
        .membership
        .history(&request.user_id, request.year, request.month)
        .await?;
    Ok(Json(HistoryResponse {
        user_id: request.user_id,
        records,
    }))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        worker: state.worker.as_ref().map(|rx| rx.borrow().clone()),
    })
}

/// GET /ready: 503 once shutdown has begun.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if *state.shutdown.borrow() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerStatus>,
}

/// A service error on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub AudienceError);

impl From<AudienceError> for ApiError {
    fn from(err: AudienceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, error) = match (&self.0, self.0.kind()) {
            // Naming a segment that does not exist is a missing resource
            // from the caller's side.
            (AudienceError::SegmentsNotExist(_), _) => {
                (StatusCode::NOT_FOUND, "segments_not_exist")
            }
            (_, ErrorKind::NotFound) => (StatusCode::NOT_FOUND, "not_found"),
            (_, ErrorKind::AlreadyExists) => (StatusCode::CONFLICT, "already_exists"),
            (_, ErrorKind::Validation) => (StatusCode::BAD_REQUEST, "validation_failed"),
            (_, ErrorKind::Transient) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
            metrics::counter!("api.errors").increment(1);
            "Internal processing error".to_string()
        } else {
            warn!(error = %self.0, status = status.as_u16(), "Request rejected");
            metrics::counter!("api.rejections").increment(1);
            self.0.to_string()
        };

        (
            status,
            Json(ErrorResponse {
                error: error.to_string(),
                message,
            }),
        )
            .into_response()
    }
}
