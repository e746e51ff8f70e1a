//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use projections::ProjectionError;
use scheduler::SchedulerError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    Scheduler(SchedulerError),
    Projection(ProjectionError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Scheduler(err) => scheduler_error_to_response(err),
            ApiError::Projection(err) => internal(err.to_string()),
            ApiError::Internal(msg) => internal(msg),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn internal(msg: String) -> (StatusCode, String) {
    tracing::error!(error = %msg, "internal server error");
    (StatusCode::INTERNAL_SERVER_ERROR, msg)
}

fn scheduler_error_to_response(err: SchedulerError) -> (StatusCode, String) {
    match &err {
        SchedulerError::ClockNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        SchedulerError::ClockOutOfRange { .. } => (StatusCode::BAD_REQUEST, err.to_string()),
        SchedulerError::ClockAlreadyExists(_) | SchedulerError::ClockMovedBackward { .. } => {
            (StatusCode::CONFLICT, err.to_string())
        }
        e if e.is_concurrency_conflict() => (StatusCode::CONFLICT, err.to_string()),
        _ => internal(err.to_string()),
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        ApiError::Scheduler(err)
    }
}

impl From<ProjectionError> for ApiError {
    fn from(err: ProjectionError) -> Self {
        ApiError::Projection(err)
    }
}
