//! Change-stream cursor persistence.

use crate::error::SyncResult;
use driftsync_kv::KvStore;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;

/// Compares two opaque cursors.
///
/// Cursors that both parse as unsigned integers compare numerically, so
/// `"9" < "10"`. Anything else falls back to lexicographic byte order,
/// which still never regresses under [`CursorStore::advance`].
pub fn compare_cursors(a: &str, b: &str) -> Ordering {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(na), Ok(nb)) => na.cmp(&nb),
        _ => a.cmp(b),
    }
}

/// Persists the last applied change-stream position.
///
/// Advancement is compare-and-set against the stored value, so the pull
/// and subscribe lanes can race freely: whichever candidate is larger
/// wins, and the cursor never moves backwards.
pub struct CursorStore {
    kv: Arc<dyn KvStore>,
    key: String,
    cached: Mutex<Option<String>>,
}

impl CursorStore {
    /// Opens the cursor store, loading any persisted position.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted value cannot be read.
    pub fn open(kv: Arc<dyn KvStore>, key: impl Into<String>) -> SyncResult<Self> {
        let key = key.into();
        let cached = kv
            .get(&key)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        Ok(Self {
            kv,
            key,
            cached: Mutex::new(cached),
        })
    }

    /// Returns the current cursor, if one has been stored.
    pub fn get(&self) -> Option<String> {
        self.cached.lock().clone()
    }

    /// Advances the cursor to `candidate` if it is strictly greater than
    /// the stored value.
    ///
    /// Returns `true` if the cursor moved. A losing compare-and-set is
    /// not an error; concurrent pull and subscribe advancement makes it
    /// routine.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the new cursor fails.
    pub fn advance(&self, candidate: &str) -> SyncResult<bool> {
        let mut cached = self.cached.lock();

        if let Some(current) = cached.as_deref() {
            if compare_cursors(candidate, current) != Ordering::Greater {
                return Ok(false);
            }
        }

        self.kv.set(&self.key, candidate.as_bytes())?;
        *cached = Some(candidate.to_string());
        Ok(true)
    }
}
