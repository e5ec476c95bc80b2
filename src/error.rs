//! Error types shared by the storage layer and the HTTP handlers.
//!
//! Every failure a request can hit is an [`AppError`]. The variant decides
//! the HTTP status; the `Display` text becomes the `error` field of the
//! JSON body, except for database and internal errors whose details stay
//! in the logs.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::patch::PatchError;

/// Main error type for request handling.
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed or missing input.
    #[error("{0}")]
    Validation(String),

    /// Missing or invalid bearer token.
    #[error("authentication required")]
    Unauthorized,

    /// Authenticated, but the role or airport does not allow the operation.
    #[error("{0}")]
    Forbidden(String),

    /// The targeted row does not exist (or belongs to another airport).
    #[error("{0} not found")]
    NotFound(String),

    /// Query, connection or constraint failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PatchError> for AppError {
    fn from(err: PatchError) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            warn!(error = %self, "Request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::Forbidden("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::NotFound("colisao 3".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Database(sqlx::Error::RowNotFound).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_patch_errors_are_validation_errors() {
        let err: AppError = PatchError::NoFields.into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "no fields to update");
    }

    #[test]
    fn test_not_found_message() {
        assert_eq!(
            AppError::NotFound("colisao 3".into()).to_string(),
            "colisao 3 not found"
        );
    }
}
