//! Error types for the sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Persistence error from the key-value store.
    #[error("persistence error: {0}")]
    Kv(#[from] driftsync_kv::KvError),

    /// Encoding or decoding of persisted state failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Another engine instance holds the single-instance lock.
    #[error("sync lock is held by another instance")]
    LockHeld,

    /// The single-instance lock was stolen from this instance.
    #[error("sync lock was lost to another instance")]
    LockLost,

    /// The engine has been disposed; no further operations are valid.
    #[error("engine is disposed")]
    Disposed,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Kv(_) => false,
            _ => false,
        }
    }
}
