//! Cross-process single-instance lease lock.

use crate::clock::now_ms;
use crate::config::LockConfig;
use crate::error::{SyncError, SyncResult};
use driftsync_kv::KvStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// The persisted lease record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// The instance holding the lease.
    pub owner_id: String,
    /// Unix milliseconds at which the lease expires unless renewed.
    pub expires_at_ms: u64,
}

/// A time-bounded ownership record coordinating exactly one active
/// engine per logical queue.
///
/// Two engine instances (say, two open tabs over one profile directory)
/// must not both drain the same outbox - that would double-send writes.
/// The lock is a lease: acquired by writing an owner record, kept by
/// renewing it on an interval strictly shorter than the ttl, and lost
/// the moment a renewal reads back someone else's record.
pub struct InstanceLock {
    kv: Arc<dyn KvStore>,
    key: String,
    owner_id: String,
    config: LockConfig,
    held: AtomicBool,
}

impl InstanceLock {
    /// Creates a lock handle with a fresh random owner id.
    pub fn new(kv: Arc<dyn KvStore>, key: impl Into<String>, config: LockConfig) -> Self {
        Self {
            kv,
            key: key.into(),
            owner_id: uuid::Uuid::new_v4().to_string(),
            config,
            held: AtomicBool::new(false),
        }
    }

    /// Returns this instance's owner id.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Returns true if this instance currently believes it holds the
    /// lease.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    fn read_record(&self) -> SyncResult<Option<LockRecord>> {
        match self.kv.get(&self.key)? {
            Some(bytes) => ciborium::from_reader(bytes.as_slice())
                .map(Some)
                .map_err(|e| SyncError::Codec(format!("lock record: {e}"))),
            None => Ok(None),
        }
    }

    fn write_record(&self, record: &LockRecord) -> SyncResult<()> {
        let mut bytes = Vec::new();
        ciborium::into_writer(record, &mut bytes)
            .map_err(|e| SyncError::Codec(format!("lock record: {e}")))?;
        self.kv.set(&self.key, &bytes)?;
        Ok(())
    }

    /// Makes one acquisition attempt at the given time.
    ///
    /// Returns `true` if this instance now holds the lease. The write
    /// is confirmed by re-reading the record, which catches the race
    /// where a concurrent acquirer wrote between our read and write.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or a record is corrupt.
    pub fn try_acquire_at(&self, now_ms: u64) -> SyncResult<bool> {
        let takeable = match self.read_record()? {
            None => true,
            Some(record) => record.expires_at_ms <= now_ms || record.owner_id == self.owner_id,
        };
        if !takeable {
            return Ok(false);
        }

        self.write_record(&LockRecord {
            owner_id: self.owner_id.clone(),
            expires_at_ms: now_ms + self.config.ttl.as_millis() as u64,
        })?;

        // Confirm against a concurrent acquirer racing the same window.
        let confirmed = matches!(
            self.read_record()?,
            Some(record) if record.owner_id == self.owner_id
        );
        self.held.store(confirmed, Ordering::SeqCst);
        Ok(confirmed)
    }

    /// Acquires the lease, retrying with a delay up to the configured
    /// attempt cutoff.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LockHeld`] if another live instance kept
    /// the lease through every attempt.
    pub async fn acquire(&self) -> SyncResult<()> {
        let attempts = self.config.max_acquire_attempts.max(1);
        for attempt in 0..attempts {
            if self.try_acquire_at(now_ms())? {
                debug!(owner = %self.owner_id, "sync lock acquired");
                return Ok(());
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.config.acquire_retry_delay).await;
            }
        }
        Err(SyncError::LockHeld)
    }

    /// Renews the lease at the given time.
    ///
    /// A renewal that reads back a foreign owner means the lease
    /// expired (for instance because this process stalled past its ttl)
    /// and was taken: this instance is no longer authoritative.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LockLost`] when the lease is gone; the
    /// caller must stop all lanes in response.
    pub fn renew_at(&self, now_ms: u64) -> SyncResult<()> {
        if !self.is_held() {
            return Err(SyncError::LockLost);
        }

        match self.read_record()? {
            Some(record) if record.owner_id == self.owner_id => {}
            _ => {
                self.held.store(false, Ordering::SeqCst);
                warn!(owner = %self.owner_id, "sync lock was taken by another instance");
                return Err(SyncError::LockLost);
            }
        }

        self.write_record(&LockRecord {
            owner_id: self.owner_id.clone(),
            expires_at_ms: now_ms + self.config.ttl.as_millis() as u64,
        })?;

        // Confirm ownership after the write as well; a mismatch here
        // means we raced a steal mid-renewal.
        match self.read_record()? {
            Some(record) if record.owner_id == self.owner_id => Ok(()),
            _ => {
                self.held.store(false, Ordering::SeqCst);
                Err(SyncError::LockLost)
            }
        }
    }

    /// Releases the lease.
    ///
    /// Best-effort: store failures are swallowed, since the ttl will
    /// reclaim the lease anyway.
    pub fn release(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            if let Ok(Some(record)) = self.read_record() {
                if record.owner_id == self.owner_id {
                    let _ = self.kv.remove(&self.key);
                }
            }
            debug!(owner = %self.owner_id, "sync lock released");
        }
    }
}
