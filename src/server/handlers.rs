use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::error::RunpadError;
use crate::execution::RuntimeInfo;
use crate::model::{
    ErrorCategory, ExecutionOutput, ExecutionRequest, ExecutionResult, OutputKind, SafetyVerdict,
};
use crate::server::error::ApiError;
use crate::server::sse::session_stream;
use crate::server::AppState;
use crate::streaming::InputDelivery;

pub const NO_ACTIVE_INPUT_STREAM: &str = "No active input stream found for this session.";
pub const INPUT_ALREADY_WAITING: &str = "An input line is already waiting for this session.";

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub backend: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AnalyzeRequest {
    pub code: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InputRequest {
    pub input: String,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: state.orchestrator.backend().name().to_string(),
    })
}

pub async fn runtimes(State(state): State<AppState>) -> Json<Vec<RuntimeInfo>> {
    Json(state.orchestrator.runtimes().list())
}

pub async fn analyze(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> Json<SafetyVerdict> {
    Json(state.orchestrator.analyze(&request.code))
}

pub async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecutionRequest>,
) -> Json<ExecutionResult> {
    info!(runtime = %request.runtime, packages = request.packages.len(), "Batch execution");
    Json(state.orchestrator.execute(request).await)
}

pub async fn stream_execute(
    State(state): State<AppState>,
    Json(request): Json<ExecutionRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let session_id = request.session_id.clone().unwrap_or_default();
    state.orchestrator.execute_streaming(request)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "session_id": session_id, "status": "accepted" })),
    ))
}

/// Subscribe to a session's events. The channel is created on first
/// connection, so clients may connect before or after submitting.
pub async fn stream_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    session_stream(state.orchestrator.watch(&session_id), state.keep_alive)
}

pub async fn provide_input(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<InputRequest>,
) -> Response {
    match state.orchestrator.provide_input(&session_id, &request.input) {
        InputDelivery::Delivered => {
            (StatusCode::OK, Json(json!({ "status": "delivered" }))).into_response()
        }
        InputDelivery::NoActiveSession => {
            let output = ExecutionOutput::failure(
                OutputKind::RuntimeError,
                ErrorCategory::Validation,
                NO_ACTIVE_INPUT_STREAM,
            );
            (StatusCode::NOT_FOUND, Json(output)).into_response()
        }
        InputDelivery::SlotOccupied => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": INPUT_ALREADY_WAITING,
                "timestamp": chrono::Utc::now(),
            })),
        )
            .into_response(),
    }
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.orchestrator.cancel(&session_id) {
        return Err(RunpadError::SessionNotFound { id: session_id }.into());
    }
    info!(session = %session_id, "Session cancelled");
    Ok(Json(json!({ "session_id": session_id, "status": "cancelled" })))
}
