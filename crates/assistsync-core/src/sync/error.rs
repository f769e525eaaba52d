use thiserror::Error;

use crate::api::ApiError;
use crate::cache::store::StoreError;

/// Errors as consumers see them, on the cache's error channel and from
/// `fetch` / `force_sync`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("No cached or remote entity for {0}")]
    NotFound(String),

    /// Network failure or timeout; retried internally.
    #[error("Temporary failure: {0}")]
    Transient(String),

    /// 5xx-class response; retried internally with backoff.
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// 4xx-class rejection; never retried.
    #[error("Request rejected ({status}): {message}")]
    Client { status: u16, message: String },

    /// Informational: local changes were replaced by the server version.
    #[error("Local changes to {key} were replaced by the server version")]
    ConflictResolved { key: String },

    #[error("Gave up on mutation {id} for {key} after {attempts} attempts: {last_error}")]
    QueueExhausted {
        key: String,
        id: u64,
        attempts: u32,
        last_error: String,
    },

    #[error("Local storage failure: {0}")]
    Storage(String),

    #[error("Sync engine is shutting down")]
    ShuttingDown,
}

impl SyncError {
    pub fn from_api(key: &str, err: &ApiError) -> Self {
        match err {
            ApiError::Server { status, body } => SyncError::Server {
                status: *status,
                message: body.clone(),
            },
            ApiError::Client { status, body } => SyncError::Client {
                status: *status,
                message: body.clone(),
            },
            ApiError::Conflict(_) => SyncError::ConflictResolved {
                key: key.to_string(),
            },
            ApiError::NotFound(_) => SyncError::NotFound(key.to_string()),
            ApiError::Network(_)
            | ApiError::Timeout
            | ApiError::RateLimited
            | ApiError::InvalidResponse(_) => SyncError::Transient(err.to_string()),
        }
    }

    /// Transient classes are retried internally and only reach consumers
    /// through `QueueExhausted`.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::Server { .. })
    }

    /// Terminal errors need the caller to act (fix and resubmit).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncError::Client { .. } | SyncError::QueueExhausted { .. } | SyncError::Storage(_)
        )
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Storage(err.to_string())
    }
}
