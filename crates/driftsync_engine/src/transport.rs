//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use driftsync_protocol::{ChangePage, WriteOutcome, WriteRequest};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};

/// A sync transport handles communication with the remote authority.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, WebSocket, in-process for testing, etc.). The
/// engine never sees framing, signing, or encoding.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a batch of writes.
    ///
    /// The returned outcomes are indexed positionally to the sent
    /// items. A response shorter than the batch is handled by the push
    /// lane as synthetic per-item failures, never ignored.
    async fn push(&self, batch: Vec<WriteRequest>) -> SyncResult<Vec<WriteOutcome>>;

    /// Requests a bounded page of changes after `cursor`.
    async fn pull(
        &self,
        cursor: &str,
        limit: usize,
        resources: Option<&[String]>,
    ) -> SyncResult<ChangePage>;

    /// Opens a live change stream from `cursor`.
    async fn subscribe(
        &self,
        cursor: &str,
        resources: Option<&[String]>,
    ) -> SyncResult<ChangeStream>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn push(&self, batch: Vec<WriteRequest>) -> SyncResult<Vec<WriteOutcome>> {
        (**self).push(batch).await
    }

    async fn pull(
        &self,
        cursor: &str,
        limit: usize,
        resources: Option<&[String]>,
    ) -> SyncResult<ChangePage> {
        (**self).pull(cursor, limit, resources).await
    }

    async fn subscribe(
        &self,
        cursor: &str,
        resources: Option<&[String]>,
    ) -> SyncResult<ChangeStream> {
        (**self).subscribe(cursor, resources).await
    }
}

/// A live change stream handed out by [`Transport::subscribe`].
///
/// Batches arrive as [`ChangePage`]s; a stream-level error is delivered
/// in-band and terminates the stream. Dropping or closing the stream
/// signals the transport to tear the connection down.
pub struct ChangeStream {
    rx: mpsc::Receiver<SyncResult<ChangePage>>,
    close_tx: Option<oneshot::Sender<()>>,
}

/// The transport-side handle feeding a [`ChangeStream`].
pub struct StreamFeeder {
    /// Sends batches (or one terminal error) to the consumer.
    pub tx: mpsc::Sender<SyncResult<ChangePage>>,
    /// Resolves when the consumer closes the stream.
    pub closed: oneshot::Receiver<()>,
}

impl ChangeStream {
    /// Creates a connected feeder/stream pair.
    pub fn pair(buffer: usize) -> (StreamFeeder, ChangeStream) {
        let (tx, rx) = mpsc::channel(buffer);
        let (close_tx, closed) = oneshot::channel();
        (
            StreamFeeder { tx, closed },
            ChangeStream {
                rx,
                close_tx: Some(close_tx),
            },
        )
    }

    /// Awaits the next batch. `None` means the stream ended.
    pub async fn next_batch(&mut self) -> Option<SyncResult<ChangePage>> {
        self.rx.recv().await
    }

    /// Closes the stream, signalling the transport side.
    pub fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
        self.rx.close();
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// A scripted transport for testing.
///
/// Responses are queued per operation and consumed FIFO; calling an
/// operation with nothing scripted is an error, so a test never
/// silently passes on an unplanned interaction. Sent batches and pull
/// cursors are recorded for assertion.
#[derive(Default)]
pub struct MockTransport {
    push_results: Mutex<VecDeque<SyncResult<Vec<WriteOutcome>>>>,
    pull_results: Mutex<VecDeque<SyncResult<ChangePage>>>,
    subscribe_results: Mutex<VecDeque<SyncResult<ChangeStream>>>,
    pushed: Mutex<Vec<Vec<WriteRequest>>>,
    pull_cursors: Mutex<Vec<String>>,
    subscribe_cursors: Mutex<Vec<String>>,
}

impl MockTransport {
    /// Creates an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a push response.
    pub fn script_push(&self, result: SyncResult<Vec<WriteOutcome>>) {
        self.push_results.lock().push_back(result);
    }

    /// Queues a pull response.
    pub fn script_pull(&self, result: SyncResult<ChangePage>) {
        self.pull_results.lock().push_back(result);
    }

    /// Queues a subscribe response.
    pub fn script_subscribe(&self, result: SyncResult<ChangeStream>) {
        self.subscribe_results.lock().push_back(result);
    }

    /// Returns every batch sent so far.
    pub fn pushed_batches(&self) -> Vec<Vec<WriteRequest>> {
        self.pushed.lock().clone()
    }

    /// Returns the cursor of every pull so far.
    pub fn pull_cursors(&self) -> Vec<String> {
        self.pull_cursors.lock().clone()
    }

    /// Returns the cursor of every subscribe so far.
    pub fn subscribe_cursors(&self) -> Vec<String> {
        self.subscribe_cursors.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn push(&self, batch: Vec<WriteRequest>) -> SyncResult<Vec<WriteOutcome>> {
        self.pushed.lock().push(batch);
        self.push_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::transport_fatal("no scripted push response")))
    }

    async fn pull(
        &self,
        cursor: &str,
        _limit: usize,
        _resources: Option<&[String]>,
    ) -> SyncResult<ChangePage> {
        self.pull_cursors.lock().push(cursor.to_string());
        self.pull_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::transport_fatal("no scripted pull response")))
    }

    async fn subscribe(
        &self,
        cursor: &str,
        _resources: Option<&[String]>,
    ) -> SyncResult<ChangeStream> {
        self.subscribe_cursors.lock().push(cursor.to_string());
        self.subscribe_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::transport_fatal("no scripted subscribe response")))
    }
}
