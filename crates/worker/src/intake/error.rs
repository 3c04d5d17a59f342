use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use editbot_core::error::CoreError;

use crate::queue::QueueError;

/// Error type for intake handlers.
///
/// Renders as `{"error": ..., "code": ...}` JSON with a matching status.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Malformed or incomplete request body.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),
}

pub type IntakeResult<T> = Result<T, IntakeError>;

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            IntakeError::Core(CoreError::Validation(msg)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            IntakeError::Queue(QueueError::QueueFull { .. }) => {
                (StatusCode::TOO_MANY_REQUESTS, "QUEUE_FULL", self.to_string())
            }
            IntakeError::Queue(err @ QueueError::InvariantViolation { .. }) => {
                tracing::error!(error = %err, "Queue invariant violated");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
            IntakeError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            IntakeError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            IntakeError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
