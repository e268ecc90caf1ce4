//! Error types for the REST remote store

use bridge_traits::error::BridgeError;
use thiserror::Error;

/// REST remote store errors
#[derive(Error, Debug)]
pub enum RestStoreError {
    /// Credentials missing, expired or lacking permission
    #[error("Not authorized (status {status}): {message}")]
    Unauthorized { status: u16, message: String },

    /// Request refused as invalid
    #[error("Request rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Rate limit exceeded, retry after {retry_after_seconds:?} seconds")]
    RateLimited { retry_after_seconds: Option<u64> },

    /// Server-side failure
    #[error("Server error (status {status}): {message}")]
    Server { status: u16, message: String },

    /// Status the protocol does not define
    #[error("Unexpected response status {status}")]
    UnexpectedStatus { status: u16 },

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    BridgeError(#[from] BridgeError),
}

/// Result type for REST store operations
pub type Result<T> = std::result::Result<T, RestStoreError>;

impl RestStoreError {
    /// Classify a non-success status the protocol does not treat as a
    /// version mismatch.
    pub fn from_status(status: u16, body: &[u8], retry_after: Option<&str>) -> Self {
        let message = String::from_utf8_lossy(body).trim().to_string();
        match status {
            401 | 403 => RestStoreError::Unauthorized { status, message },
            400 | 404 | 405 | 410 | 413 | 415 | 422 => RestStoreError::Rejected { status, message },
            429 => RestStoreError::RateLimited {
                retry_after_seconds: retry_after.and_then(|v| v.trim().parse().ok()),
            },
            500..=599 => RestStoreError::Server { status, message },
            _ => RestStoreError::UnexpectedStatus { status },
        }
    }
}

impl From<RestStoreError> for BridgeError {
    fn from(error: RestStoreError) -> Self {
        match error {
            RestStoreError::Unauthorized { status, message }
            | RestStoreError::Rejected { status, message } => {
                BridgeError::Rejected { status, message }
            }
            RestStoreError::RateLimited { .. } | RestStoreError::Server { .. } => {
                BridgeError::Network(error.to_string())
            }
            RestStoreError::UnexpectedStatus { status } => BridgeError::Rejected {
                status,
                message: "unexpected response status".to_string(),
            },
            RestStoreError::ParseError(msg) => {
                BridgeError::OperationFailed(format!("Parse error: {}", msg))
            }
            RestStoreError::Config(msg) => {
                BridgeError::OperationFailed(format!("Invalid configuration: {}", msg))
            }
            RestStoreError::BridgeError(e) => e,
        }
    }
}
