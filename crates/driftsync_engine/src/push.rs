//! The push lane: drains the outbox against the remote write endpoint.

use crate::applier::{Applier, WriteAck, WriteReject};
use crate::backoff::{BackoffPolicy, RetryCounter};
use crate::clock::now_ms;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::event::{EventSink, SyncEvent};
use crate::outbox::{CommitOutcome, OutboxItem, OutboxStore, RebaseInstruction};
use crate::transport::Transport;
use driftsync_protocol::{ConflictStrategy, WriteError, WriteMeta, WriteOutcome, WriteRequest};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    Idle,
    Draining,
}

/// A compacted batch: wire items plus, per wire item, every outbox item
/// it represents, so all of them can be acked or rejected together.
struct Batch {
    wire: Vec<WriteRequest>,
    represented: Vec<Vec<OutboxItem>>,
}

impl Batch {
    fn keys(&self) -> Vec<String> {
        self.represented
            .iter()
            .flatten()
            .map(|item| item.idempotency_key.clone())
            .collect()
    }
}

/// Drains the outbox to the transport, applying acks and rejects
/// through the applier.
pub struct PushLane<T, A> {
    transport: Arc<T>,
    applier: Arc<A>,
    outbox: Arc<OutboxStore>,
    events: Arc<dyn EventSink>,
    strategy: ConflictStrategy,
    max_push_items: usize,
    scan_limit: usize,
    returning: bool,
    retry_max_attempts: Option<u32>,
    backoff: BackoffPolicy,
    state: Mutex<DrainState>,
    flush_requested: AtomicBool,
    disposed: AtomicBool,
}

impl<T: Transport, A: Applier> PushLane<T, A> {
    /// Creates a push lane over the given collaborators.
    pub fn new(
        config: &SyncConfig,
        transport: Arc<T>,
        applier: Arc<A>,
        outbox: Arc<OutboxStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            transport,
            applier,
            outbox,
            events,
            strategy: config.conflict_strategy,
            max_push_items: config.max_push_items.max(1),
            scan_limit: config.scan_limit.max(config.max_push_items),
            returning: config.returning,
            retry_max_attempts: config.retry_max_attempts,
            backoff: config.backoff.clone(),
            state: Mutex::new(DrainState::Idle),
            flush_requested: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Permanently disables the lane.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    /// Drains the outbox until no eligible batch remains.
    ///
    /// Re-entrant safe: a flush arriving while a drain is running marks
    /// a follow-up pass and returns immediately, so bursts of enqueues
    /// coalesce into at most one extra pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is disposed or a persistence or
    /// applier call fails. Transport failures are absorbed into the
    /// retry/reject paths and do not surface here.
    pub async fn flush(&self) -> SyncResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SyncError::Disposed);
        }

        {
            let mut state = self.state.lock();
            if *state == DrainState::Draining {
                self.flush_requested.store(true, Ordering::SeqCst);
                return Ok(());
            }
            *state = DrainState::Draining;
        }

        let result = self.drain().await;
        *self.state.lock() = DrainState::Idle;
        result
    }

    async fn drain(&self) -> SyncResult<()> {
        let mut retry = RetryCounter::new(self.backoff.clone(), self.retry_max_attempts);

        loop {
            if self.disposed.load(Ordering::SeqCst) {
                return Ok(());
            }

            let pending = self.outbox.peek(self.scan_limit);
            let Some(batch) = compact(pending, self.max_push_items, self.returning) else {
                if self.flush_requested.swap(false, Ordering::SeqCst) {
                    continue;
                }
                return Ok(());
            };

            let keys = batch.keys();
            self.outbox.mark_in_flight(&keys, now_ms())?;

            match self.transport.push(batch.wire.clone()).await {
                Ok(results) => {
                    let (acked, rejected) = self.apply_results(&batch, results).await?;
                    retry.reset();
                    debug!(acked, rejected, "push batch committed");
                    self.events.emit(SyncEvent::PushCompleted { acked, rejected });
                }
                Err(e) if e.is_retryable() => {
                    self.outbox.release(&keys)?;
                    self.events.emit(SyncEvent::PushFailed {
                        message: e.to_string(),
                        retryable: true,
                    });
                    match retry.next_delay() {
                        Some(delay) => {
                            warn!(error = %e, ?delay, "push failed, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!(error = %e, "push retries exhausted, waiting for next trigger");
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    // A definitive transport refusal rejects every
                    // represented item; the drain itself keeps going.
                    let mut outcome = CommitOutcome::default();
                    for represented in &batch.represented {
                        for item in represented {
                            self.reject_item(item, WriteError::internal(e.to_string()))
                                .await?;
                            outcome.reject.push(item.idempotency_key.clone());
                        }
                    }
                    self.outbox.commit(outcome)?;
                    self.events.emit(SyncEvent::PushFailed {
                        message: e.to_string(),
                        retryable: false,
                    });
                }
            }
        }
    }

    /// Maps per-item results back by wire-item index and commits the
    /// outcome in one call. Acks reach the applier before the items are
    /// removed, so a crash in between leaves them pending and resent.
    async fn apply_results(
        &self,
        batch: &Batch,
        results: Vec<WriteOutcome>,
    ) -> SyncResult<(usize, usize)> {
        let mut outcome = CommitOutcome::default();
        let mut acked = 0usize;
        let mut rejected = 0usize;

        for (index, represented) in batch.represented.iter().enumerate() {
            match results.get(index) {
                Some(WriteOutcome::Ok {
                    entity_id,
                    version,
                    value,
                }) => {
                    for item in represented {
                        self.applier
                            .apply_write_ack(WriteAck {
                                idempotency_key: item.idempotency_key.clone(),
                                resource: item.resource.clone(),
                                action: item.op.action(),
                                entity_id: entity_id.clone(),
                                version: *version,
                                value: value.clone(),
                            })
                            .await?;
                        outcome.ack.push(item.idempotency_key.clone());
                        acked += 1;
                    }
                    // Chain still-queued sibling edits onto the new
                    // version so they are not spuriously refused.
                    if let Some(after_seq) = represented.iter().map(|i| i.seq).max() {
                        outcome.rebase.push(RebaseInstruction {
                            resource: batch.wire[index].resource.clone(),
                            entity_id: entity_id.clone(),
                            base_version: *version,
                            after_seq,
                        });
                    }
                }
                Some(WriteOutcome::Err { error }) => {
                    for item in represented {
                        self.reject_item(item, error.clone()).await?;
                        outcome.reject.push(item.idempotency_key.clone());
                        rejected += 1;
                    }
                }
                None => {
                    // The transport returned fewer results than items
                    // sent; synthesize a failure so nothing is stranded.
                    for item in represented {
                        self.reject_item(
                            item,
                            WriteError::internal("write result missing from push response"),
                        )
                        .await?;
                        outcome.reject.push(item.idempotency_key.clone());
                        rejected += 1;
                    }
                }
            }
        }

        self.outbox.commit(outcome)?;
        Ok((acked, rejected))
    }

    async fn reject_item(&self, item: &OutboxItem, error: WriteError) -> SyncResult<()> {
        self.applier
            .apply_write_reject(
                WriteReject {
                    idempotency_key: item.idempotency_key.clone(),
                    resource: item.resource.clone(),
                    action: item.op.action(),
                    entity_id: item.op.entity_id().map(str::to_string),
                    error,
                },
                self.strategy,
            )
            .await
    }
}

fn options_key(meta: &Option<WriteMeta>) -> String {
    match meta {
        None => String::new(),
        // BTreeMap keys are ordered, so equal options serialize equally.
        Some(m) => serde_json::to_string(m).unwrap_or_default(),
    }
}

/// Compacts pending items into one wire batch.
///
/// Takes the maximal leading run sharing `(resource, action, options)`,
/// collapses same-entity items within the run into a single wire item
/// carrying the latest op, and caps the batch at `max_push_items`
/// distinct wire items. Every collapsed item stays addressable through
/// the batch's represented lists.
fn compact(items: Vec<OutboxItem>, max_push_items: usize, returning: bool) -> Option<Batch> {
    let first = items.first()?;
    let run = (
        first.resource.clone(),
        first.op.action(),
        options_key(&first.meta),
    );

    let mut wire: Vec<WriteRequest> = Vec::new();
    let mut represented: Vec<Vec<OutboxItem>> = Vec::new();
    let mut index_by_entity: HashMap<String, usize> = HashMap::new();

    for item in items {
        let item_run = (
            item.resource.clone(),
            item.op.action(),
            options_key(&item.meta),
        );
        if item_run != run {
            break;
        }

        let existing = item
            .op
            .entity_id()
            .and_then(|eid| index_by_entity.get(eid).copied());

        match existing {
            Some(index) => {
                wire[index].op = item.op.clone();
                wire[index].idempotency_key = Some(item.idempotency_key.clone());
                represented[index].push(item);
            }
            None => {
                if wire.len() >= max_push_items {
                    break;
                }
                if let Some(eid) = item.op.entity_id() {
                    index_by_entity.insert(eid.to_string(), wire.len());
                }
                wire.push(
                    WriteRequest::new(item.resource.clone(), item.op.clone())
                        .with_idempotency_key(item.idempotency_key.clone())
                        .with_returning(returning),
                );
                if let Some(meta) = item.meta.clone() {
                    let index = wire.len() - 1;
                    wire[index].meta = Some(meta);
                }
                represented.push(vec![item]);
            }
        }
    }

    Some(Batch { wire, represented })
}
