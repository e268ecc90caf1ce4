use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid sequence for {entity_type}/{entity_id}: {reason}")]
    InvalidSequence {
        entity_type: String,
        entity_id: String,
        reason: String,
    },

    #[error("Pending change {0} not found")]
    ChangeNotFound(i64),

    #[error("Sync engine not started; call start_sync first")]
    NotStarted,

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Remote store error: {0}")]
    Remote(#[from] BridgeError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Remote operation timed out after {0} ms")]
    Timeout(u64),
}

impl SyncError {
    /// Whether the failed remote operation may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_transient(),
            SyncError::Timeout(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
