//! The sync engine facade: lifecycle, lanes, and the instance lock.

use crate::applier::Applier;
use crate::backoff::RetryCounter;
use crate::clock::now_ms;
use crate::config::SyncConfig;
use crate::cursor::CursorStore;
use crate::error::{SyncError, SyncResult};
use crate::event::{EventSink, NullSink, SyncEvent};
use crate::lock::InstanceLock;
use crate::opid::OpIdGenerator;
use crate::outbox::{NewWrite, OutboxStats, OutboxStore};
use crate::pull::PullLane;
use crate::push::PushLane;
use crate::subscribe::SubscribeLane;
use crate::transport::Transport;
use driftsync_kv::KvStore;
use driftsync_protocol::{WriteMeta, WriteOp};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Engine lifecycle states. `Disposed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, never started.
    Created,
    /// A start is in flight.
    Starting,
    /// Lanes are running.
    Started,
    /// Stopped; the outbox is intact and the engine can start again.
    Stopped,
    /// Permanently shut down.
    Disposed,
}

/// A write handed to [`SyncEngine::enqueue_write`].
#[derive(Debug, Clone)]
pub struct WriteIntent {
    /// The resource being written.
    pub resource: String,
    /// The write itself.
    pub op: WriteOp,
    /// Write options, if any.
    pub meta: Option<WriteMeta>,
    /// Explicit idempotency key; a fresh one is stamped when absent.
    pub idempotency_key: Option<String>,
}

impl WriteIntent {
    /// Creates an intent without options or an explicit key.
    pub fn new(resource: impl Into<String>, op: WriteOp) -> Self {
        Self {
            resource: resource.into(),
            op,
            meta: None,
            idempotency_key: None,
        }
    }

    /// Attaches options.
    #[must_use]
    pub fn with_meta(mut self, meta: WriteMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Pins the idempotency key instead of stamping a fresh one.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

struct EngineShared<T, A> {
    config: SyncConfig,
    outbox: Arc<OutboxStore>,
    lock: Arc<InstanceLock>,
    push: Arc<PushLane<T, A>>,
    pull: Arc<PullLane<T, A>>,
    subscribe: Arc<SubscribeLane<T, A>>,
    events: Arc<dyn EventSink>,
    state: Mutex<EngineState>,
    renew_task: Mutex<Option<JoinHandle<()>>>,
    pull_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T, A> EngineShared<T, A>
where
    T: Transport + 'static,
    A: Applier + 'static,
{
    /// Stops the subscribe lane and cancels periodic pulls. Does not
    /// touch the renew task; callers own that handle.
    fn halt_lanes(&self) {
        self.subscribe.stop();
        if let Some(handle) = self.pull_task.lock().take() {
            handle.abort();
        }
    }
}

/// Owns the sync lifecycle and wires the lanes and lock together.
///
/// The engine accumulates writes in a durable outbox, drains them to
/// the remote authority, and feeds remote changes back through the
/// applier - while a lease lock guarantees that at most one instance
/// per logical queue is doing any of this.
///
/// # Example
///
/// ```ignore
/// let kv: Arc<dyn KvStore> = Arc::new(FileKv::open(&dir)?);
/// let engine = SyncEngine::new(SyncConfig::new("app"), kv, transport, applier)?;
/// engine.start().await?;
/// engine
///     .enqueue_write(vec![WriteIntent::new("todos", op)])
///     .await?;
/// ```
pub struct SyncEngine<T, A>
where
    T: Transport + 'static,
    A: Applier + 'static,
{
    shared: Arc<EngineShared<T, A>>,
    cursor: Arc<CursorStore>,
    opids: OpIdGenerator,
    start_gate: tokio::sync::Mutex<()>,
}

impl<T, A> SyncEngine<T, A>
where
    T: Transport + 'static,
    A: Applier + 'static,
{
    /// Creates an engine over the given persistence handle, transport
    /// and applier, with events discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted outbox or cursor state cannot be
    /// loaded.
    pub fn new(
        config: SyncConfig,
        kv: Arc<dyn KvStore>,
        transport: T,
        applier: A,
    ) -> SyncResult<Self> {
        Self::with_events(config, kv, transport, applier, Arc::new(NullSink))
    }

    /// Creates an engine that reports [`SyncEvent`]s to the given sink.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted outbox or cursor state cannot be
    /// loaded.
    pub fn with_events(
        config: SyncConfig,
        kv: Arc<dyn KvStore>,
        transport: T,
        applier: A,
        events: Arc<dyn EventSink>,
    ) -> SyncResult<Self> {
        let transport = Arc::new(transport);
        let applier = Arc::new(applier);

        let outbox = Arc::new(OutboxStore::open(
            Arc::clone(&kv),
            config.outbox_key(),
            config.max_queue_size,
        )?);
        let cursor = Arc::new(CursorStore::open(Arc::clone(&kv), config.cursor_key())?);
        let lock = Arc::new(InstanceLock::new(
            Arc::clone(&kv),
            config.lock_key(),
            config.lock.clone(),
        ));

        let push = Arc::new(PushLane::new(
            &config,
            Arc::clone(&transport),
            Arc::clone(&applier),
            Arc::clone(&outbox),
            Arc::clone(&events),
        ));
        let pull = Arc::new(PullLane::new(
            &config,
            Arc::clone(&transport),
            Arc::clone(&applier),
            Arc::clone(&cursor),
            Arc::clone(&events),
        ));
        let subscribe = SubscribeLane::new(
            &config,
            Arc::clone(&transport),
            Arc::clone(&applier),
            Arc::clone(&cursor),
            Arc::clone(&events),
        );

        Ok(Self {
            shared: Arc::new(EngineShared {
                config,
                outbox,
                lock,
                push,
                pull,
                subscribe,
                events,
                state: Mutex::new(EngineState::Created),
                renew_task: Mutex::new(None),
                pull_task: Mutex::new(None),
            }),
            cursor,
            opids: OpIdGenerator::random(),
            start_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.shared.state.lock()
    }

    /// Returns outbox counts for backpressure decisions.
    pub fn outbox_stats(&self) -> OutboxStats {
        self.shared.outbox.stats()
    }

    /// Returns the last applied change-stream position, if any.
    pub fn cursor(&self) -> Option<String> {
        self.cursor.get()
    }

    /// Returns true if this instance holds the single-instance lock.
    pub fn is_lock_held(&self) -> bool {
        self.shared.lock.is_held()
    }

    /// Starts the engine: recovers the outbox, acquires the lock,
    /// starts the subscribe lane, requests a flush, and schedules
    /// periodic pulls.
    ///
    /// Idempotent and safe under concurrent calls; all callers share
    /// one in-flight start.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LockHeld`] if another live instance owns
    /// the queue, or [`SyncError::Disposed`] after disposal.
    pub async fn start(&self) -> SyncResult<()> {
        match self.state() {
            EngineState::Disposed => return Err(SyncError::Disposed),
            EngineState::Started => return Ok(()),
            _ => {}
        }

        let _gate = self.start_gate.lock().await;
        match self.state() {
            EngineState::Disposed => return Err(SyncError::Disposed),
            EngineState::Started => return Ok(()),
            _ => {}
        }
        *self.shared.state.lock() = EngineState::Starting;

        let recovered = self.shared.outbox.recover(
            now_ms(),
            self.shared.config.in_flight_timeout.as_millis() as u64,
        )?;
        if recovered > 0 {
            info!(recovered, "released stale in-flight outbox reservations");
        }

        if let Err(e) = self.shared.lock.acquire().await {
            *self.shared.state.lock() = EngineState::Stopped;
            return Err(e);
        }

        self.spawn_renew_loop();
        self.shared.subscribe.start();
        self.spawn_periodic_pulls();

        // Kick an initial drain without holding up the start.
        let push = Arc::clone(&self.shared.push);
        tokio::spawn(async move {
            if let Err(e) = push.flush().await {
                debug!(error = %e, "initial flush did not complete");
            }
        });

        *self.shared.state.lock() = EngineState::Started;
        self.shared.events.emit(SyncEvent::Started);
        Ok(())
    }

    fn spawn_renew_loop(&self) {
        let shared = Arc::clone(&self.shared);
        let interval = shared.config.lock.renew_interval;
        *self.shared.renew_task.lock() = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match shared.lock.renew_at(now_ms()) {
                    Ok(()) => {}
                    Err(e) => {
                        // No longer authoritative: every lane must stop.
                        warn!(error = %e, "sync lock lost, stopping lanes");
                        shared.events.emit(SyncEvent::LockLost);
                        shared.halt_lanes();
                        *shared.state.lock() = EngineState::Stopped;
                        shared.events.emit(SyncEvent::Stopped);
                        return;
                    }
                }
            }
        }));
    }

    fn spawn_periodic_pulls(&self) {
        let Some(interval) = self.shared.config.periodic_pull_interval else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        *self.shared.pull_task.lock() = Some(tokio::spawn(async move {
            let mut retry = RetryCounter::new(
                shared.config.backoff.clone(),
                shared.config.retry_max_attempts,
            );
            loop {
                tokio::time::sleep(interval).await;
                match shared.pull.pull_now().await {
                    Ok(_) => retry.reset(),
                    Err(e) => match retry.next_delay() {
                        Some(delay) => {
                            debug!(error = %e, ?delay, "periodic pull failed, backing off");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            // Rescheduling stops; the engine itself
                            // keeps running and pull_now still works.
                            warn!(error = %e, "periodic pull retries exhausted");
                            return;
                        }
                    },
                }
            }
        }));
    }

    /// Stops the engine, leaving outbox contents intact for a later
    /// start.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Disposed`] after disposal.
    pub async fn stop(&self) -> SyncResult<()> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                EngineState::Disposed => return Err(SyncError::Disposed),
                EngineState::Created | EngineState::Stopped => return Ok(()),
                _ => {}
            }
            *state = EngineState::Stopped;
        }

        self.shared.halt_lanes();
        if let Some(handle) = self.shared.renew_task.lock().take() {
            handle.abort();
        }
        self.shared.lock.release();
        self.shared.events.emit(SyncEvent::Stopped);
        Ok(())
    }

    /// Stops the engine and permanently disables all lanes. Terminal.
    pub async fn dispose(&self) {
        let _ = self.stop().await;
        self.shared.push.dispose();
        *self.shared.state.lock() = EngineState::Disposed;
    }

    /// Persists write intents and triggers a flush without waiting for
    /// it.
    ///
    /// Intents lacking an idempotency key are stamped with a fresh one.
    /// Returns the key of every intent, in order. Completion is
    /// observed through events or a subsequent read, not through this
    /// call.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Disposed`] after disposal, or a persistence
    /// error if the outbox write fails.
    pub async fn enqueue_write(&self, intents: Vec<WriteIntent>) -> SyncResult<Vec<String>> {
        if self.state() == EngineState::Disposed {
            return Err(SyncError::Disposed);
        }

        let writes: Vec<NewWrite> = intents
            .into_iter()
            .map(|intent| NewWrite {
                idempotency_key: intent
                    .idempotency_key
                    .unwrap_or_else(|| self.opids.next_id()),
                resource: intent.resource,
                op: intent.op,
                meta: intent.meta,
            })
            .collect();
        let keys: Vec<String> = writes.iter().map(|w| w.idempotency_key.clone()).collect();

        let report = self.shared.outbox.enqueue(writes, now_ms())?;
        for evicted in report.evicted {
            warn!(key = %evicted.idempotency_key, "outbox full, dropped oldest pending write");
            self.shared.events.emit(SyncEvent::QueueFull {
                dropped_key: evicted.idempotency_key,
            });
        }

        if self.state() == EngineState::Started {
            let push = Arc::clone(&self.shared.push);
            tokio::spawn(async move {
                let _ = push.flush().await;
            });
        }

        Ok(keys)
    }

    /// Drains the outbox now, waiting for the pass to finish.
    ///
    /// # Errors
    ///
    /// See [`PushLane::flush`].
    pub async fn flush(&self) -> SyncResult<()> {
        self.shared.push.flush().await
    }

    /// Pulls remote changes now.
    ///
    /// Returns `Ok(None)` if a pull was already in progress.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Disposed`] after disposal; transport
    /// failures propagate.
    pub async fn pull_now(&self) -> SyncResult<Option<usize>> {
        if self.state() == EngineState::Disposed {
            return Err(SyncError::Disposed);
        }
        self.shared.pull.pull_now().await
    }

    /// Suspends or resumes the live subscription without affecting the
    /// rest of the engine.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Disposed`] after disposal.
    pub fn set_subscribed(&self, subscribed: bool) -> SyncResult<()> {
        if self.state() == EngineState::Disposed {
            return Err(SyncError::Disposed);
        }
        self.shared.subscribe.set_enabled(subscribed);
        Ok(())
    }
}
