//! Durable outbox of pending writes.

use crate::error::{SyncError, SyncResult};
use driftsync_kv::KvStore;
use driftsync_protocol::{WriteMeta, WriteOp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One pending write intent in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    /// Unique identity for dedup and ack/reject addressing.
    pub idempotency_key: String,
    /// The resource being written.
    pub resource: String,
    /// The write itself.
    pub op: WriteOp,
    /// Write options, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<WriteMeta>,
    /// Wall-clock enqueue time, for observability and in-flight
    /// timeouts.
    pub enqueued_at_ms: u64,
    /// Monotonic logical sequence assigned at enqueue. Causal order of
    /// same-entity edits is `seq` order, never wall-clock order.
    pub seq: u64,
    /// Set while a reservation covering this item is outstanding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight_at_ms: Option<u64>,
}

impl OutboxItem {
    /// Returns true if the item is currently reserved for sending.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight_at_ms.is_some()
    }
}

/// A write intent to enqueue, before the store stamps its sequence.
#[derive(Debug, Clone)]
pub struct NewWrite {
    /// Unique identity for dedup; stamped by the engine when absent at
    /// the API surface.
    pub idempotency_key: String,
    /// The resource being written.
    pub resource: String,
    /// The write itself.
    pub op: WriteOp,
    /// Write options, if any.
    pub meta: Option<WriteMeta>,
}

/// Outcome of an enqueue call.
#[derive(Debug, Default)]
pub struct EnqueueReport {
    /// Keys actually inserted.
    pub enqueued: Vec<String>,
    /// Keys skipped because they already exist.
    pub deduped: Vec<String>,
    /// Items evicted to respect the queue bound, oldest first.
    pub evicted: Vec<OutboxItem>,
}

/// A rebase instruction: raise the base version of queued writes on one
/// entity that were enqueued after an acknowledged sibling.
#[derive(Debug, Clone, PartialEq)]
pub struct RebaseInstruction {
    /// The resource of the acknowledged write.
    pub resource: String,
    /// The entity of the acknowledged write.
    pub entity_id: String,
    /// The version the server assigned.
    pub base_version: u64,
    /// Only items with `seq` strictly greater are rebased.
    pub after_seq: u64,
}

/// The result of a push batch, committed to the outbox in one call.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    /// Keys acknowledged by the server; removed permanently.
    pub ack: Vec<String>,
    /// Keys definitively refused; removed permanently.
    pub reject: Vec<String>,
    /// Keys to return to pending for a later attempt.
    pub retry: Vec<String>,
    /// Version rewrites for still-queued sibling edits.
    pub rebase: Vec<RebaseInstruction>,
}

/// Outbox counts for backpressure and observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxStats {
    /// Items available for the next drain pass.
    pub pending: usize,
    /// Items currently reserved.
    pub in_flight: usize,
    /// All items.
    pub total: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OutboxRecord {
    items: Vec<OutboxItem>,
    next_seq: u64,
}

/// Durable queue of not-yet-confirmed writes.
///
/// The store owns its persisted state exclusively: lanes mutate it only
/// through the commit API, never by reaching into raw collections. Every
/// mutation persists the whole queue before returning, so a crash at any
/// point leaves a consistent queue to recover.
///
/// # Invariants
///
/// - At most one not-in-flight item exists per idempotency key
/// - Items are held in `seq` order; same-entity items form a causal
///   chain in that order
/// - `commit` applies acks/rejects/retries/rebases atomically
pub struct OutboxStore {
    kv: Arc<dyn KvStore>,
    key: String,
    max_queue_size: usize,
    inner: Mutex<OutboxRecord>,
}

impl OutboxStore {
    /// Opens the outbox, loading any persisted queue.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be read or decoded.
    pub fn open(
        kv: Arc<dyn KvStore>,
        key: impl Into<String>,
        max_queue_size: usize,
    ) -> SyncResult<Self> {
        let key = key.into();
        let record = match kv.get(&key)? {
            Some(bytes) => ciborium::from_reader(bytes.as_slice())
                .map_err(|e| SyncError::Codec(format!("outbox record: {e}")))?,
            None => OutboxRecord::default(),
        };
        Ok(Self {
            kv,
            key,
            max_queue_size,
            inner: Mutex::new(record),
        })
    }

    fn persist(&self, record: &OutboxRecord) -> SyncResult<()> {
        let mut bytes = Vec::new();
        ciborium::into_writer(record, &mut bytes)
            .map_err(|e| SyncError::Codec(format!("outbox record: {e}")))?;
        self.kv.set(&self.key, &bytes)?;
        Ok(())
    }

    /// Enqueues write intents.
    ///
    /// Insertion is idempotent: an intent whose key already exists in
    /// the queue is skipped. If the queue would exceed its bound, the
    /// oldest *pending* item is evicted per overflowing insert and
    /// reported back so the engine can raise a queue-full signal.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the queue fails.
    pub fn enqueue(&self, writes: Vec<NewWrite>, now_ms: u64) -> SyncResult<EnqueueReport> {
        let mut record = self.inner.lock();
        let mut report = EnqueueReport::default();

        for write in writes {
            if record
                .items
                .iter()
                .any(|item| item.idempotency_key == write.idempotency_key)
            {
                report.deduped.push(write.idempotency_key);
                continue;
            }

            if record.items.len() >= self.max_queue_size {
                if let Some(pos) = record.items.iter().position(|item| !item.is_in_flight()) {
                    report.evicted.push(record.items.remove(pos));
                }
            }

            record.next_seq += 1;
            let seq = record.next_seq;
            report.enqueued.push(write.idempotency_key.clone());
            record.items.push(OutboxItem {
                idempotency_key: write.idempotency_key,
                resource: write.resource,
                op: write.op,
                meta: write.meta,
                enqueued_at_ms: now_ms,
                seq,
                in_flight_at_ms: None,
            });
        }

        self.persist(&record)?;
        Ok(report)
    }

    /// Returns up to `limit` not-in-flight items in enqueue order.
    ///
    /// Peeking does not reserve; call [`OutboxStore::mark_in_flight`]
    /// once a batch is assembled.
    pub fn peek(&self, limit: usize) -> Vec<OutboxItem> {
        self.inner
            .lock()
            .items
            .iter()
            .filter(|item| !item.is_in_flight())
            .take(limit)
            .cloned()
            .collect()
    }

    /// Marks the given keys as in-flight.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the queue fails.
    pub fn mark_in_flight(&self, keys: &[String], now_ms: u64) -> SyncResult<()> {
        let mut record = self.inner.lock();
        for item in record.items.iter_mut() {
            if keys.contains(&item.idempotency_key) {
                item.in_flight_at_ms = Some(now_ms);
            }
        }
        self.persist(&record)
    }

    /// Returns the given keys to pending without removing them.
    ///
    /// This is the retryable-failure path: the batch was not delivered,
    /// so the items go back into the next scan.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the queue fails.
    pub fn release(&self, keys: &[String]) -> SyncResult<()> {
        let mut record = self.inner.lock();
        for item in record.items.iter_mut() {
            if keys.contains(&item.idempotency_key) {
                item.in_flight_at_ms = None;
            }
        }
        self.persist(&record)
    }

    /// Applies the outcome of a push batch in one persisted mutation.
    ///
    /// Acked and rejected keys are removed permanently; retryable keys
    /// return to pending; rebase instructions rewrite the base version
    /// of still-queued sibling edits.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the queue fails.
    pub fn commit(&self, outcome: CommitOutcome) -> SyncResult<()> {
        let mut record = self.inner.lock();

        record.items.retain(|item| {
            !outcome.ack.contains(&item.idempotency_key)
                && !outcome.reject.contains(&item.idempotency_key)
        });

        for item in record.items.iter_mut() {
            if outcome.retry.contains(&item.idempotency_key) {
                item.in_flight_at_ms = None;
            }
        }

        for rebase in &outcome.rebase {
            Self::apply_rebase(&mut record.items, rebase);
        }

        self.persist(&record)
    }

    /// Rewrites the base version of queued sibling edits.
    ///
    /// For every not-in-flight item on the same `(resource, entity_id)`
    /// with `seq > after_seq` carrying a base version lower than the
    /// acknowledged one, the base version is raised. Without this, a
    /// queued edit chained on an offline sibling would be refused as a
    /// stale-version conflict that never actually happened.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the queue fails.
    pub fn rebase(&self, instruction: &RebaseInstruction) -> SyncResult<()> {
        let mut record = self.inner.lock();
        Self::apply_rebase(&mut record.items, instruction);
        self.persist(&record)
    }

    fn apply_rebase(items: &mut [OutboxItem], instruction: &RebaseInstruction) {
        for item in items.iter_mut() {
            if item.is_in_flight()
                || item.seq <= instruction.after_seq
                || item.resource != instruction.resource
                || item.op.entity_id() != Some(instruction.entity_id.as_str())
            {
                continue;
            }
            if let Some(base) = item.op.base_version() {
                if base < instruction.base_version {
                    item.op.set_base_version(instruction.base_version);
                }
            }
        }
    }

    /// Releases in-flight markers older than the timeout.
    ///
    /// This is the crash-recovery path for a process that died mid-send:
    /// the items become pending again and are resent, which is why the
    /// push path is at-least-once.
    ///
    /// Returns the number of markers released.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the queue fails.
    pub fn recover(&self, now_ms: u64, in_flight_timeout_ms: u64) -> SyncResult<usize> {
        let mut record = self.inner.lock();
        let mut released = 0;
        for item in record.items.iter_mut() {
            if let Some(at) = item.in_flight_at_ms {
                if now_ms.saturating_sub(at) >= in_flight_timeout_ms {
                    item.in_flight_at_ms = None;
                    released += 1;
                }
            }
        }
        if released > 0 {
            self.persist(&record)?;
        }
        Ok(released)
    }

    /// Returns pending/in-flight/total counts.
    pub fn stats(&self) -> OutboxStats {
        let record = self.inner.lock();
        let in_flight = record.items.iter().filter(|i| i.is_in_flight()).count();
        OutboxStats {
            pending: record.items.len() - in_flight,
            in_flight,
            total: record.items.len(),
        }
    }
}
