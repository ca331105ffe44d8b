use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::RunpadError;

/// A `RunpadError` rendered as a JSON error response.
#[derive(Debug)]
pub struct ApiError(pub RunpadError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            RunpadError::SessionIdMissing => StatusCode::BAD_REQUEST,
            RunpadError::SessionBusy { .. } => StatusCode::CONFLICT,
            RunpadError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            RunpadError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RunpadError> for ApiError {
    fn from(err: RunpadError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = Json(json!({
            "error": self.0.to_string(),
            "timestamp": chrono::Utc::now(),
        }));
        (status, body).into_response()
    }
}
