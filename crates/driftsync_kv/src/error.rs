//! Error types for key-value stores.

use std::io;
use thiserror::Error;

/// Result type for key-value operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors that can occur during key-value operations.
#[derive(Debug, Error)]
pub enum KvError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The key is not usable by this store.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The store is closed.
    #[error("store is closed")]
    Closed,
}
