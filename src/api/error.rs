//! API error types and response formatting.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::service::ServiceError;
use crate::storage::DatabaseError;

/// API error type that converts to appropriate HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unknown access key or bad admin token. Rendered with an empty body.
    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    /// Rejected input (bad URL, bad pattern, duplicate key)
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Aggregation limit reached
    #[error("service unavailable")]
    Unavailable,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unauthorized => Self::Unauthorized,
            ServiceError::Validation(e) => Self::BadRequest(e.to_string()),
            ServiceError::NotFound(id) => Self::NotFound(format!("source {id}")),
            ServiceError::Busy => Self::Unavailable,
            ServiceError::Database(e) => Self::Database(e),
            ServiceError::Render(e) => Self::Internal(e),
        }
    }
}

/// JSON error response body.
#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            // Nothing about the subscriber or the path is revealed
            Self::Unauthorized => return StatusCode::UNAUTHORIZED.into_response(),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg.clone())),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg.clone())),
            Self::Unavailable => {
                let body = ErrorResponse {
                    error: "unavailable".to_string(),
                    message: Some("Too many feeds are being aggregated, retry shortly".to_string()),
                };
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [(header::RETRY_AFTER, "1")],
                    Json(body),
                )
                    .into_response();
            }
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    Some("An internal error occurred".to_string()),
                )
            }
            Self::Database(err) => {
                tracing::error!(error = %err, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    Some("A database error occurred".to_string()),
                )
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}
