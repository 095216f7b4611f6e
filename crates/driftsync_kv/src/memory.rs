//! In-memory key-value store for testing.

use crate::error::KvResult;
use crate::store::KvStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// An in-memory key-value store.
///
/// Suitable for unit tests, integration tests, and ephemeral engines
/// that don't need persistence.
///
/// # Thread Safety
///
/// Cloning a `MemoryKv` yields a handle to the **same** underlying map,
/// so two engine instances built on clones see each other's writes. This
/// is how tests simulate two processes sharing one persistence layer
/// (e.g. for lock exclusivity).
///
/// # Example
///
/// ```rust
/// use driftsync_kv::{KvStore, MemoryKv};
///
/// let kv = MemoryKv::new();
/// kv.set("outbox", b"[]").unwrap();
/// let other = kv.clone();
/// assert_eq!(other.get("outbox").unwrap(), Some(b"[]".to_vec()));
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemoryKv {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryKv {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of keys currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Clears all keys.
    pub fn clear(&self) {
        self.data.write().clear();
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> KvResult<()> {
        self.data.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> KvResult<()> {
        self.data.write().remove(key);
        Ok(())
    }
}
