//! Error types for admission control.
//!
//! A plain `false` from `allow` is not an error: it is the expected
//! "not admitted now" outcome. The types here cover the cases where a call
//! could not reach a decision at all, or where the request can never be met.

use std::time::Duration;
use thiserror::Error;

/// Result type for admission operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;

/// Result type for external store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Main error type for admission operations.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The caller's cancellation signal fired before admission.
    ///
    /// Nothing was consumed on behalf of the cancelled call.
    #[error("Wait cancelled before admission")]
    Cancelled,

    /// The request asks for more permits than the limiter can ever hold.
    #[error("Requested {requested} permits, but capacity is {capacity}")]
    Unsatisfiable {
        /// Number of permits requested.
        requested: u32,
        /// Maximum the limiter can grant at once.
        capacity: f64,
    },

    /// External store error (distributed limiter only).
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl AdmissionError {
    /// Check if the failed call may succeed when retried unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Store(err) => err.is_retryable(),
            Self::Unsatisfiable { .. } | Self::Config(_) => false,
        }
    }
}

/// External store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Generic store operation failed.
    #[error("{message}")]
    OperationFailed {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The round-trip did not finish within the configured timeout.
    #[error("Store round-trip timed out after {0:?}")]
    Timeout(Duration),

    /// Connection pool exhausted.
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Failed to connect.
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),
}

impl StoreError {
    /// Create a new operation failed error.
    pub fn operation_failed(message: impl Into<String>, retryable: bool) -> Self {
        Self::OperationFailed {
            message: message.into(),
            retryable,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::OperationFailed { retryable, .. } => *retryable,
            Self::Timeout(_) | Self::PoolExhausted => true,
            Self::ConnectionFailed(_) => false,
        }
    }
}

/// Configuration errors, reported when a limiter is constructed.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid quota configuration.
    #[error("Invalid quota: {0}")]
    InvalidQuota(String),

    /// Invalid token bucket parameters.
    #[error("Invalid token bucket: {0}")]
    InvalidBucket(String),

    /// Invalid eviction settings.
    #[error("Invalid eviction configuration: {0}")]
    InvalidEviction(String),

    /// Missing required configuration.
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// A background task was requested outside a Tokio runtime.
    #[error("Background sweeping requires a running Tokio runtime")]
    NoRuntime,
}
