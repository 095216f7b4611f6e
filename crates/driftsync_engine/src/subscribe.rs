//! The subscribe lane: maintains a live change stream with reconnects.

use crate::applier::Applier;
use crate::backoff::{BackoffPolicy, RetryCounter};
use crate::config::SyncConfig;
use crate::cursor::CursorStore;
use crate::event::{EventSink, SyncEvent};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Maintains a live change stream, reconnecting with backoff.
///
/// The lane is gated twice: `started` tracks engine lifecycle, and
/// `enabled` lets the engine suspend and resume the live stream without
/// tearing lifecycle down. Disabling forcibly closes the stream and
/// cancels any pending reconnect; re-enabling resumes from the
/// persisted cursor with a cold retry counter.
pub struct SubscribeLane<T, A> {
    weak: Weak<Self>,
    transport: Arc<T>,
    applier: Arc<A>,
    cursor: Arc<CursorStore>,
    events: Arc<dyn EventSink>,
    reconnect: BackoffPolicy,
    resources: Option<Vec<String>>,
    initial_cursor: Option<String>,
    enabled: AtomicBool,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T, A> SubscribeLane<T, A>
where
    T: Transport + 'static,
    A: Applier + 'static,
{
    /// Creates a subscribe lane over the given collaborators.
    pub fn new(
        config: &SyncConfig,
        transport: Arc<T>,
        applier: Arc<A>,
        cursor: Arc<CursorStore>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            transport,
            applier,
            cursor,
            events,
            reconnect: BackoffPolicy {
                base_delay: config.reconnect_delay,
                max_delay: config.backoff.max_delay,
                jitter_ratio: config.backoff.jitter_ratio,
            },
            resources: config.resources.clone(),
            initial_cursor: config.initial_cursor.clone(),
            enabled: AtomicBool::new(true),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Returns true if the live stream is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Starts the lane if its `enabled` gate allows it.
    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.maybe_spawn();
    }

    /// Stops the lane and clears the started flag.
    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Suspends or resumes the live stream.
    ///
    /// Disabling closes the connection and cancels a pending reconnect
    /// but leaves the lane started, so enabling later resumes from the
    /// persisted cursor.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            self.maybe_spawn();
        } else if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    fn maybe_spawn(&self) {
        if !self.started.load(Ordering::SeqCst) || !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let Some(lane) = self.weak.upgrade() else {
            return;
        };
        let mut task = self.task.lock();
        let running = task.as_ref().is_some_and(|h| !h.is_finished());
        if running {
            return;
        }
        *task = Some(tokio::spawn(async move { lane.run().await }));
    }

    fn effective_cursor(&self) -> String {
        self.cursor
            .get()
            .or_else(|| self.initial_cursor.clone())
            .unwrap_or_else(|| "0".to_string())
    }

    async fn run(self: Arc<Self>) {
        let mut retry = RetryCounter::new(self.reconnect.clone(), None);

        loop {
            if !self.started.load(Ordering::SeqCst) || !self.enabled.load(Ordering::SeqCst) {
                return;
            }

            let cursor = self.effective_cursor();
            match self
                .transport
                .subscribe(&cursor, self.resources.as_deref())
                .await
            {
                Ok(mut stream) => {
                    // The counter goes cold only once a connection is
                    // confirmed open, so repeated immediate failures
                    // keep escalating the delay.
                    retry.reset();
                    debug!(from = %cursor, "change stream connected");
                    self.events.emit(SyncEvent::StreamConnected);

                    loop {
                        match stream.next_batch().await {
                            Some(Ok(page)) => {
                                if !page.changes.is_empty() {
                                    if let Err(e) = self.applier.apply_changes(&page.changes).await
                                    {
                                        warn!(error = %e, "failed to apply stream batch");
                                        self.events.emit(SyncEvent::StreamDisconnected {
                                            message: e.to_string(),
                                        });
                                        break;
                                    }
                                }
                                if let Some(next) = page.next_cursor.as_deref() {
                                    if let Err(e) = self.cursor.advance(next) {
                                        warn!(error = %e, "failed to persist stream cursor");
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                self.events.emit(SyncEvent::StreamDisconnected {
                                    message: e.to_string(),
                                });
                                break;
                            }
                            None => {
                                self.events.emit(SyncEvent::StreamDisconnected {
                                    message: "stream ended".to_string(),
                                });
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    self.events.emit(SyncEvent::StreamDisconnected {
                        message: e.to_string(),
                    });
                }
            }

            if !self.enabled.load(Ordering::SeqCst) {
                return;
            }
            if let Some(delay) = retry.next_delay() {
                debug!(?delay, "change stream reconnecting");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
