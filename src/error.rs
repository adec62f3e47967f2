use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::api::responses::{ApiResponse, ErrorResponse};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// The key is claimed but its outcome has not been captured yet.
    #[error("A previous request with this idempotency key is still in progress: {key}")]
    Conflict { key: String },

    /// The key was already used for a different method or URL.
    #[error("Idempotency key {key} was reused for a different request: expected {expected}, got {actual}")]
    Misuse {
        key: String,
        expected: String,
        actual: String,
    },

    /// Raised by a store's create when the key already exists.
    #[error("Idempotency key already exists: {0}")]
    DuplicateKey(String),

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Response has already been sent")]
    ResponseAlreadySent,

    #[error("{original}; cleanup also failed: {cleanup}")]
    CleanupFailed {
        original: Box<AppError>,
        cleanup: Box<AppError>,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// HTTP status the embedding application should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Conflict { .. } | AppError::DuplicateKey(_) => StatusCode::CONFLICT,
            AppError::Misuse { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Conflict { .. } | AppError::DuplicateKey(_) => "IDEMPOTENCY_CONFLICT",
            AppError::Misuse { .. } => "IDEMPOTENCY_KEY_MISUSE",
            AppError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            _ => "INTERNAL_ERROR",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Conflict { .. })
    }

    pub fn is_misuse(&self) -> bool {
        matches!(self, AppError::Misuse { .. })
    }

    /// Pairs a failure with a follow-up cleanup result, keeping both observable.
    pub fn with_cleanup(self, cleanup: Result<()>) -> AppError {
        match cleanup {
            Ok(()) => self,
            Err(cleanup) => AppError::CleanupFailed {
                original: Box::new(self),
                cleanup: Box::new(cleanup),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(ApiResponse::<()>::error(ErrorResponse::new(
                self.error_code(),
                message,
            ))),
        )
            .into_response()
    }
}
