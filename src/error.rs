use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::ports::RepositoryError;
use crate::providers::ProviderError;
use crate::queue::QueueError;
use crate::services::wallet::WalletError;
use crate::validation::ValidationError;

/// How a caller should react to a failure. Workers use it to decide between
/// acknowledging, redelivering, dead-lettering and stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input. Rejected synchronously, never retried.
    Validation,
    /// A provider call failed.
    Provider { retryable: bool },
    /// The state already moved on. A no-op, not a user-facing error.
    Consistency,
    /// Needs an operator.
    Fatal,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(what) => AppError::NotFound(what),
            RepositoryError::Conflict(what) => AppError::Conflict(what),
            err @ RepositoryError::InsufficientBalance { .. } => {
                AppError::InsufficientBalance(err.to_string())
            }
            RepositoryError::Corrupt(what) => AppError::Internal(what),
            RepositoryError::Database(e) => AppError::Database(e.to_string()),
        }
    }
}

impl AppError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::Validation(_)
            | AppError::NotFound(_)
            | AppError::Unauthorized(_)
            | AppError::Forbidden(_)
            | AppError::InsufficientBalance(_) => ErrorClass::Validation,
            AppError::Conflict(_) => ErrorClass::Consistency,
            AppError::Provider(e) => e.class(),
            AppError::Queue(_) | AppError::Database(_) => ErrorClass::Provider { retryable: true },
            AppError::Wallet(e) => e.class(),
            AppError::Internal(_) => ErrorClass::Fatal,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::InsufficientBalance(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Provider(e) => match e.class() {
                ErrorClass::Provider { retryable: true } => StatusCode::SERVICE_UNAVAILABLE,
                ErrorClass::Provider { retryable: false } => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Wallet(e) => e.status_code(),
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
