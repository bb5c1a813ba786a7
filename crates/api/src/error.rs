//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use resilience::BreakerError;
use saga::SagaError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Saga orchestration error.
    Saga(SagaError),
    /// Breaker store error.
    Breaker(BreakerError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Saga(err) => (saga_status(&err), err.code(), err.to_string()),
            ApiError::Breaker(err @ BreakerError::Contended { .. }) => {
                (StatusCode::CONFLICT, "CONCURRENT_MODIFICATION", err.to_string())
            }
            ApiError::Breaker(err) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", err.to_string()),
        };

        if status.is_server_error() {
            tracing::error!(error = %message, "internal server error");
        }
        let body = serde_json::json!({ "error": message, "code": code });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_status(err: &SagaError) -> StatusCode {
    match err {
        SagaError::DefinitionNotFound(_) | SagaError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
        SagaError::InvalidDefinition { .. } => StatusCode::BAD_REQUEST,
        SagaError::DefinitionAlreadyRegistered(_)
        | SagaError::InvalidTransition { .. }
        | SagaError::ConcurrentModification { .. }
        | SagaError::ConflictRetriesExhausted { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<BreakerError> for ApiError {
    fn from(err: BreakerError) -> Self {
        ApiError::Breaker(err)
    }
}
