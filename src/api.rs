//! HTTP control surface.
//!
//! Job creation triggers the pipeline asynchronously; callers observe the
//! outcome through the stream endpoint or by re-reading the job record.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use crate::broker::EventBroker;
use crate::models::{GenerationOptions, Job};
use crate::pipeline::GenerationPipeline;
use crate::store::JobStore;
use crate::transport::{self, TransportConfig};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<EventBroker>,
    pub pipeline: Arc<GenerationPipeline>,
    pub transport: TransportConfig,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub outline: String,
    #[serde(default)]
    pub options: GenerationOptions,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/stream", get(transport::stream_handler))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_job(
    State(state): State<SharedState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    if request.outline.trim().is_empty() {
        return Err(ApiError::BadRequest("outline must not be empty".into()));
    }

    let job = state
        .store
        .create(&request.outline)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    tracing::info!(job_id = %job.id, "Job created, starting pipeline");
    state.pipeline.spawn_run(job.clone(), request.options);

    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn get_job(
    Path(id): Path<String>,
    State(state): State<SharedState>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .store
        .get(&id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", id)))?;
    Ok(Json(job))
}
