//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use orchestrator::{ErrorClass, OrchestratorError};

/// API-level error type that maps to HTTP responses.
///
/// The body is always `{"error": ..., "retryable": bool}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    Orchestrator(OrchestratorError),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, bool) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, false),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, false),
            ApiError::Orchestrator(err) => {
                let retryable = err.is_retryable();
                let status = match err.class() {
                    ErrorClass::Validation => StatusCode::BAD_REQUEST,
                    ErrorClass::Authenticity => StatusCode::UNAUTHORIZED,
                    ErrorClass::NotFound => StatusCode::NOT_FOUND,
                    ErrorClass::Conflict => StatusCode::CONFLICT,
                    ErrorClass::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                    ErrorClass::Provider if retryable => StatusCode::SERVICE_UNAVAILABLE,
                    ErrorClass::Provider => StatusCode::BAD_GATEWAY,
                    ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, retryable)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, retryable) = self.parts();
        let message = match self {
            ApiError::NotFound(msg) | ApiError::BadRequest(msg) => msg,
            ApiError::Orchestrator(err) => err.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "request failed");
        }

        let body = serde_json::json!({ "error": message, "retryable": retryable });
        (status, axum::Json(body)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError::Orchestrator(err)
    }
}
