//! Error types for event delivery operations.
//!
//! Transport and HTTP failures carry enough context to classify an attempt
//! as retryable or permanent. Configuration, storage and broker failures are
//! reported separately and never consume retry budget.

use std::time::Duration;

use herald_core::{CoreError, ErrorCategory};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions raised while delivering events.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection-level failure: refused, reset, DNS resolution.
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request exceeded the configured timeout.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// Consumer answered with a 4xx status.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Consumer answered with a 5xx status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Consumer asked us to back off via `Retry-After`.
    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// HTTP status code (429 or 503)
        status_code: u16,
        /// Seconds the consumer asked us to wait
        retry_after_seconds: u64,
    },

    /// Invalid configuration or publish input.
    #[error("configuration error: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Dead letter storage failed.
    #[error("storage error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },

    /// Legacy broker publish failed.
    #[error("broker error: {message}")]
    Broker {
        /// Broker error message
        message: String,
    },

    /// In-flight deliveries did not finish before the shutdown deadline.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates a client error from an HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error with the consumer's retry guidance.
    pub fn rate_limited(status_code: u16, retry_after_seconds: u64) -> Self {
        Self::RateLimited { status_code, retry_after_seconds }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a broker error.
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether a delivery that failed with this error may succeed later.
    ///
    /// Transport failures, timeouts, 5xx, 408 and 429 are transient. Every
    /// other 4xx means the consumer rejected the payload and retrying cannot
    /// help.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. } => true,

            Self::ClientError { status_code, .. } => matches!(status_code, 408 | 429),

            Self::Configuration { .. }
            | Self::Storage { .. }
            | Self::Broker { .. }
            | Self::ShutdownTimeout { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// HTTP status associated with the failure, if the consumer responded.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. }
            | Self::ServerError { status_code, .. }
            | Self::RateLimited { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    /// Metrics label for the failure.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => ErrorCategory::Network,
            Self::ClientError { .. } => ErrorCategory::Client,
            Self::ServerError { .. } => ErrorCategory::Server,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Storage { .. } => ErrorCategory::Storage,
            Self::Broker { .. } => ErrorCategory::Broker,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::ShutdownTimeout { .. } | Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Delay requested by the consumer, overriding computed backoff.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_seconds, .. } => {
                Some(Duration::from_secs(*retry_after_seconds))
            },
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::Storage(message) => Self::Storage { message },
            CoreError::NotFound(message) => Self::Internal { message },
            CoreError::InvalidInput(message) => Self::Configuration { message },
        }
    }
}

impl From<sqlx::Error> for DeliveryError {
    fn from(error: sqlx::Error) -> Self {
        Self::Storage { message: error.to_string() }
    }
}
