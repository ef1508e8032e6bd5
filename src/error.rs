use axum::{Json, http::StatusCode, response::{IntoResponse, Response}};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Failures reported by a [`RemoteStore`](crate::store::RemoteStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Missing or insufficient permissions")]
    PermissionDenied,

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Stable classification code, in the vocabulary managed document stores use.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::PermissionDenied => "permission-denied",
            StoreError::NotFound(_) => "not-found",
            StoreError::Unavailable(_) => "unavailable",
            StoreError::InvalidDocument(_) => "invalid-argument",
            StoreError::Database(_) | StoreError::Migrate(_) | StoreError::Serialization(_) => {
                "internal"
            }
        }
    }
}

pub const PERMISSION_DENIED_MESSAGE: &str =
    "You do not have permission to view these tasks. Please sign in again.";
pub const SUBSCRIPTION_FAILED_MESSAGE: &str = "Could not load tasks. Please try again later.";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("No user is signed in")]
    Unauthenticated,

    #[error("Store write failed: {0}")]
    StoreWrite(#[source] StoreError),

    #[error("{message}")]
    Subscription {
        message: String,
        #[source]
        source: StoreError,
    },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error")]
    InternalServerError,
}

impl AppError {
    /// Wraps a live-query failure, mapping known cases to a readable message.
    pub fn subscription(source: StoreError) -> Self {
        let message = match source {
            StoreError::PermissionDenied => PERMISSION_DENIED_MESSAGE,
            _ => SUBSCRIPTION_FAILED_MESSAGE,
        };
        AppError::Subscription {
            message: message.to_string(),
            source,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::StoreWrite(err)
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Unauthenticated => {
                (StatusCode::UNAUTHORIZED, "No user is signed in".to_string())
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::StoreWrite(StoreError::PermissionDenied) => {
                (StatusCode::FORBIDDEN, StoreError::PermissionDenied.to_string())
            }
            AppError::StoreWrite(StoreError::NotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("Task {} not found", id))
            }
            AppError::StoreWrite(StoreError::InvalidDocument(msg)) => {
                (StatusCode::BAD_REQUEST, msg)
            }
            AppError::StoreWrite(e) => {
                error!("store write error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Store error occurred".to_string(),
                )
            }
            AppError::Subscription { message, source } => {
                error!("subscription error ({}): {}", source.code(), source);
                (StatusCode::SERVICE_UNAVAILABLE, message)
            }
            AppError::Config(msg) => {
                error!("configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::InternalServerError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: status.to_string(),
            message: error_message,
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_maps_to_readable_message() {
        let err = AppError::subscription(StoreError::PermissionDenied);
        assert_eq!(err.to_string(), PERMISSION_DENIED_MESSAGE);

        let err = AppError::subscription(StoreError::Unavailable("offline".into()));
        assert_eq!(err.to_string(), SUBSCRIPTION_FAILED_MESSAGE);
    }

    #[test]
    fn test_status_codes() {
        let status = |e: AppError| e.into_response().status();
        assert_eq!(status(AppError::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status(AppError::StoreWrite(StoreError::PermissionDenied)),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status(AppError::StoreWrite(StoreError::NotFound("a".into()))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(AppError::subscription(StoreError::PermissionDenied)),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
