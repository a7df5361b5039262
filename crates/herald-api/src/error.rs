//! API error type and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use herald_core::CoreError;
use herald_delivery::{CancelError, DeliveryError};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Result alias for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Errors returned by API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request or rejected input.
    #[error("{0}")]
    InvalidInput(String),

    /// Unknown event or entry.
    #[error("{0}")]
    NotFound(String),

    /// Request conflicts with the current state.
    #[error("{0}")]
    Conflict(String),

    /// Unexpected failure.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal",
        }
    }
}

/// Error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetail,
}

/// Machine-readable code and human-readable message.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable error code.
    pub code: &'static str,
    /// Description of the failure.
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let body = ErrorResponse { error: ErrorDetail { code: self.code(), message: self.to_string() } };
        (status, Json(body)).into_response()
    }
}

impl From<DeliveryError> for ApiError {
    fn from(error: DeliveryError) -> Self {
        match error {
            DeliveryError::Configuration { message } => Self::InvalidInput(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::InvalidInput(message) => Self::InvalidInput(message),
            CoreError::NotFound(message) => Self::NotFound(message),
            CoreError::Storage(message) => Self::Internal(message),
        }
    }
}

impl From<CancelError> for ApiError {
    fn from(error: CancelError) -> Self {
        match error {
            CancelError::NotFound => Self::NotFound(error.to_string()),
            CancelError::AlreadyStarted => Self::Conflict(error.to_string()),
        }
    }
}
