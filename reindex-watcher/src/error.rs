//! Error types for reindex-watcher
//!
//! `ReindexError` is the domain taxonomy used by the scheduler and the
//! import engine. `ApiError` maps failures onto HTTP responses for the
//! control API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::document_store::StoreError;
use crate::services::source_client::SourceError;

/// Result type for scheduler and engine operations
pub type Result<T> = std::result::Result<T, ReindexError>;

/// Reindex error taxonomy
#[derive(Debug, Error)]
pub enum ReindexError {
    /// Malformed request (empty ids where required, bad store code, ...)
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    #[error("Unknown priority: {0}")]
    UnknownPriority(String),

    /// Entity is known but no import adapter is registered for it
    #[error("No import adapter registered for entity '{0}'")]
    UnsupportedEntity(String),

    /// Source fetch failed after all page retries
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Document store error: {0}")]
    Store(#[from] StoreError),

    /// Broker, dedup store or settings failure
    #[error(transparent)]
    Common(#[from] reindex_common::Error),
}

impl ReindexError {
    /// Request was rejected before any job was created
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ReindexError::Validation(_)
                | ReindexError::UnknownEntity(_)
                | ReindexError::UnknownPriority(_)
        )
    }

    /// Retrying the same job cannot succeed
    pub fn is_permanent(&self) -> bool {
        self.is_validation() || matches!(self, ReindexError::UnsupportedEntity(_))
    }
}

impl From<sqlx::Error> for ReindexError {
    fn from(err: sqlx::Error) -> Self {
        ReindexError::Common(reindex_common::Error::Database(err))
    }
}

impl From<serde_json::Error> for ReindexError {
    fn from(err: serde_json::Error) -> Self {
        ReindexError::Common(reindex_common::Error::Serialization(err))
    }
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Reindex(#[from] ReindexError),

    #[error("Common error: {0}")]
    Common(#[from] reindex_common::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Reindex(ref err) if err.is_validation() => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", err.to_string())
            }
            ApiError::Reindex(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "REINDEX_ERROR",
                err.to_string(),
            ),
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;
