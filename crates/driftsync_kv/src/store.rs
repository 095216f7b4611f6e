//! Key-value store trait definition.

use crate::error::KvResult;

/// A durable key-value store for DriftSync state.
///
/// Stores are **opaque byte maps**. The engine encodes its own records
/// (outbox items, cursors, lock records) - stores never interpret values.
///
/// # Invariants
///
/// - `get` returns exactly the bytes most recently passed to `set` for
///   that key, or `None` if the key was never set or was removed
/// - `set` is durable on return: a process crash immediately after `set`
///   must not lose the write
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::MemoryKv`] - For testing
/// - [`super::FileKv`] - For persistent storage
pub trait KvStore: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    fn set(&self, key: &str, value: &[u8]) -> KvResult<()>;

    /// Removes the value stored under `key`, if any.
    ///
    /// Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn remove(&self, key: &str) -> KvResult<()>;
}
