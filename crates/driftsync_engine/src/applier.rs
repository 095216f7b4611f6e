//! The applier seam between the engine and the local cache.

use crate::error::SyncResult;
use async_trait::async_trait;
use driftsync_protocol::{Change, ConflictStrategy, WriteAction, WriteError};
use parking_lot::Mutex;
use serde_json::Value;

/// A confirmed write, delivered once per represented idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteAck {
    /// Identity of the confirmed outbox item.
    pub idempotency_key: String,
    /// The resource written.
    pub resource: String,
    /// The action that was confirmed.
    pub action: WriteAction,
    /// The entity id (server-assigned for creates).
    pub entity_id: String,
    /// The entity's version after the write.
    pub version: u64,
    /// The written value as echoed by the server, when requested.
    pub value: Option<Value>,
}

/// A definitively refused write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReject {
    /// Identity of the refused outbox item.
    pub idempotency_key: String,
    /// The resource written.
    pub resource: String,
    /// The action that was refused.
    pub action: WriteAction,
    /// The entity id, when the write carried one.
    pub entity_id: Option<String>,
    /// The refusal, including the server's current version/value when
    /// the server supplied them.
    pub error: WriteError,
}

/// Owns materialization of sync results into the local cache.
///
/// The lanes are deliberately ignorant of storage representation: they
/// forward acks, rejects (with the configured conflict strategy) and
/// remote changes here and nothing else. Because the push path is
/// at-least-once, `apply_write_ack` must be idempotent under duplicate
/// delivery of the same idempotency key.
#[async_trait]
pub trait Applier: Send + Sync {
    /// Applies a batch of remote changes to the local cache.
    async fn apply_changes(&self, changes: &[Change]) -> SyncResult<()>;

    /// Applies a confirmed local write.
    async fn apply_write_ack(&self, ack: WriteAck) -> SyncResult<()>;

    /// Reconciles a refused local write according to `strategy`.
    async fn apply_write_reject(
        &self,
        reject: WriteReject,
        strategy: ConflictStrategy,
    ) -> SyncResult<()>;
}

#[async_trait]
impl<A: Applier + ?Sized> Applier for std::sync::Arc<A> {
    async fn apply_changes(&self, changes: &[Change]) -> SyncResult<()> {
        (**self).apply_changes(changes).await
    }

    async fn apply_write_ack(&self, ack: WriteAck) -> SyncResult<()> {
        (**self).apply_write_ack(ack).await
    }

    async fn apply_write_reject(
        &self,
        reject: WriteReject,
        strategy: ConflictStrategy,
    ) -> SyncResult<()> {
        (**self).apply_write_reject(reject, strategy).await
    }
}

/// An in-memory applier for testing.
///
/// Records everything it is handed; duplicate acks are recorded twice,
/// which lets tests assert at-least-once delivery explicitly.
#[derive(Default)]
pub struct MemoryApplier {
    changes: Mutex<Vec<Change>>,
    acks: Mutex<Vec<WriteAck>>,
    rejects: Mutex<Vec<(WriteReject, ConflictStrategy)>>,
}

impl MemoryApplier {
    /// Creates a new empty applier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every applied change.
    pub fn changes(&self) -> Vec<Change> {
        self.changes.lock().clone()
    }

    /// Returns every delivered ack.
    pub fn acks(&self) -> Vec<WriteAck> {
        self.acks.lock().clone()
    }

    /// Returns every delivered reject with its strategy.
    pub fn rejects(&self) -> Vec<(WriteReject, ConflictStrategy)> {
        self.rejects.lock().clone()
    }
}

#[async_trait]
impl Applier for MemoryApplier {
    async fn apply_changes(&self, changes: &[Change]) -> SyncResult<()> {
        self.changes.lock().extend_from_slice(changes);
        Ok(())
    }

    async fn apply_write_ack(&self, ack: WriteAck) -> SyncResult<()> {
        self.acks.lock().push(ack);
        Ok(())
    }

    async fn apply_write_reject(
        &self,
        reject: WriteReject,
        strategy: ConflictStrategy,
    ) -> SyncResult<()> {
        self.rejects.lock().push((reject, strategy));
        Ok(())
    }
}
