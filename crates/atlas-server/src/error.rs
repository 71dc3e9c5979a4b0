//! API error mapping
//!
//! Core error kinds map onto the HTTP taxonomy: validation failures are 422,
//! unknown ids 404, backing-store outages 503 with Retry-After. Duplicates
//! and bounded truncation are success shapes, never errors.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use atlas_core::domain::ValidationIssue;
use atlas_core::eventstore::EventStoreError;
use atlas_core::graph::GraphError;
use atlas_core::payloads::PayloadError;

/// Seconds clients should wait before retrying a 503
const RETRY_AFTER_SECS: u32 = 5;

/// API-surface error
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation failed")]
    Validation(Vec<ValidationIssue>),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// API handler result
pub type ApiResult<T> = Result<T, ApiError>;

impl From<EventStoreError> for ApiError {
    fn from(error: EventStoreError) -> Self {
        match error {
            EventStoreError::ValidationFailed(issues) => ApiError::Validation(issues),
            EventStoreError::NotFound(id) => ApiError::NotFound(id),
            EventStoreError::Unavailable(reason) => ApiError::Unavailable(reason),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<GraphError> for ApiError {
    fn from(error: GraphError) -> Self {
        match error {
            GraphError::NotFound(id) => ApiError::NotFound(id),
            GraphError::Unavailable(reason) => ApiError::Unavailable(reason),
            GraphError::IllegalEdge { .. } | GraphError::InvalidProperty(_) => {
                ApiError::BadRequest(error.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<PayloadError> for ApiError {
    fn from(error: PayloadError) -> Self {
        match error {
            PayloadError::Unavailable(reason) => ApiError::Unavailable(reason),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(issues) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"error": "validation_failed", "issues": issues})),
            )
                .into_response(),
            ApiError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "not_found", "id": id})),
            )
                .into_response(),
            ApiError::BadRequest(reason) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "bad_request", "reason": reason})),
            )
                .into_response(),
            ApiError::Unavailable(reason) => (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, RETRY_AFTER_SECS.to_string())],
                Json(json!({"error": "unavailable", "reason": reason})),
            )
                .into_response(),
            ApiError::Internal(reason) => {
                tracing::error!(%reason, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal"})),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_the_taxonomy() {
        let error: ApiError = EventStoreError::Unavailable("down".into()).into();
        assert!(matches!(error, ApiError::Unavailable(_)));

        let error: ApiError = GraphError::NotFound("n1".into()).into();
        assert!(matches!(error, ApiError::NotFound(_)));

        let error: ApiError = EventStoreError::ValidationFailed(vec![]).into();
        assert!(matches!(error, ApiError::Validation(_)));
    }
}
