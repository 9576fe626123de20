use intent_core::{ResourceVersion, ValidationError};
use intent_ledger::{IntentHandle, IntentStatus, LedgerError};
use intent_persist::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict on {id}: expected version {expected}, current {actual}")]
    Conflict { id: String, expected: ResourceVersion, actual: ResourceVersion },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unknown intent {0}")]
    UnknownIntent(IntentHandle),
    #[error("intent {0} is {1} and can no longer be cancelled")]
    NotCancellable(IntentHandle, IntentStatus),
    #[error("bridge is shutting down")]
    ShuttingDown,
    /// Read-path and lifecycle store failures; intent processing retries internally.
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl From<LedgerError> for BridgeError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::UnknownIntent(h) => BridgeError::UnknownIntent(h),
            LedgerError::NotCancellable(h, s) => BridgeError::NotCancellable(h, s),
        }
    }
}
