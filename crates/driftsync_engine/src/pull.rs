//! The pull lane: polls the remote change endpoint.

use crate::applier::Applier;
use crate::config::SyncConfig;
use crate::cursor::CursorStore;
use crate::error::SyncResult;
use crate::event::{EventSink, SyncEvent};
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Polls the remote change endpoint from the persisted cursor.
///
/// Single-flight: a pull requested while one is in progress returns
/// immediately without starting a second. Callers that need a
/// guaranteed pull after the current one simply call again. Backoff and
/// rescheduling of periodic pulls belong to the engine's scheduler, not
/// to this lane.
pub struct PullLane<T, A> {
    transport: Arc<T>,
    applier: Arc<A>,
    cursor: Arc<CursorStore>,
    events: Arc<dyn EventSink>,
    pull_limit: usize,
    resources: Option<Vec<String>>,
    initial_cursor: Option<String>,
    in_flight: AtomicBool,
}

impl<T: Transport, A: Applier> PullLane<T, A> {
    /// Creates a pull lane over the given collaborators.
    pub fn new(
        config: &SyncConfig,
        transport: Arc<T>,
        applier: Arc<A>,
        cursor: Arc<CursorStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            transport,
            applier,
            cursor,
            events,
            pull_limit: config.pull_limit,
            resources: config.resources.clone(),
            initial_cursor: config.initial_cursor.clone(),
            in_flight: AtomicBool::new(false),
        }
    }

    /// The cursor the next pull starts from: stored, else configured
    /// initial, else the root position.
    pub fn effective_cursor(&self) -> String {
        self.cursor
            .get()
            .or_else(|| self.initial_cursor.clone())
            .unwrap_or_else(|| "0".to_string())
    }

    /// Runs one pull.
    ///
    /// Returns `Ok(None)` when a pull was already in progress, and
    /// `Ok(Some(n))` with the number of changes applied otherwise.
    ///
    /// # Errors
    ///
    /// Transport failures propagate to the caller after being reported
    /// to the event sink.
    pub async fn pull_now(&self) -> SyncResult<Option<usize>> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        let result = self.run().await;
        self.in_flight.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    async fn run(&self) -> SyncResult<usize> {
        let cursor = self.effective_cursor();

        let page = match self
            .transport
            .pull(&cursor, self.pull_limit, self.resources.as_deref())
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.events.emit(SyncEvent::PullFailed {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        if !page.changes.is_empty() {
            self.applier.apply_changes(&page.changes).await?;
        }

        if let Some(next) = page.next_cursor.as_deref() {
            // A losing compare-and-set just means the subscribe lane
            // got there first.
            self.cursor.advance(next)?;
        }

        debug!(from = %cursor, changes = page.changes.len(), "pull applied");
        self.events.emit(SyncEvent::PullCompleted {
            changes: page.changes.len(),
        });
        Ok(page.changes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::MemoryApplier;
    use crate::event::NullSink;
    use crate::transport::MockTransport;
    use driftsync_kv::MemoryKv;
    use driftsync_protocol::{Change, ChangePage};
    use serde_json::json;

    fn lane(
        config: &SyncConfig,
    ) -> (
        Arc<MockTransport>,
        Arc<MemoryApplier>,
        Arc<CursorStore>,
        PullLane<MockTransport, MemoryApplier>,
    ) {
        let kv = MemoryKv::new();
        let transport = Arc::new(MockTransport::new());
        let applier = Arc::new(MemoryApplier::new());
        let cursor = Arc::new(CursorStore::open(Arc::new(kv), "cursor").unwrap());
        let lane = PullLane::new(
            config,
            Arc::clone(&transport),
            Arc::clone(&applier),
            Arc::clone(&cursor),
            Arc::new(NullSink),
        );
        (transport, applier, cursor, lane)
    }

    #[tokio::test]
    async fn applies_changes_and_advances_cursor() {
        let config = SyncConfig::new("test");
        let (transport, applier, cursor, lane) = lane(&config);

        transport.script_pull(Ok(ChangePage::new(
            vec![Change::put("todos", "e1", 1, json!({}))],
            Some("7".into()),
        )));

        let applied = lane.pull_now().await.unwrap();
        assert_eq!(applied, Some(1));
        assert_eq!(applier.changes().len(), 1);
        assert_eq!(cursor.get().as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn empty_page_skips_applier() {
        let config = SyncConfig::new("test");
        let (transport, applier, cursor, lane) = lane(&config);

        transport.script_pull(Ok(ChangePage::new(vec![], Some("3".into()))));

        let applied = lane.pull_now().await.unwrap();
        assert_eq!(applied, Some(0));
        assert!(applier.changes().is_empty());
        // The cursor still advances on an empty page.
        assert_eq!(cursor.get().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn cursor_fallback_order() {
        let config = SyncConfig::new("test").with_initial_cursor("100");
        let (transport, _applier, cursor, lane) = lane(&config);

        assert_eq!(lane.effective_cursor(), "100");

        transport.script_pull(Ok(ChangePage::new(vec![], Some("150".into()))));
        lane.pull_now().await.unwrap();
        assert_eq!(transport.pull_cursors(), vec!["100".to_string()]);

        // Once a cursor is persisted, it wins over the configured one.
        assert_eq!(cursor.get().as_deref(), Some("150"));
        assert_eq!(lane.effective_cursor(), "150");
    }

    #[tokio::test]
    async fn root_cursor_when_nothing_configured() {
        let config = SyncConfig::new("test");
        let (_transport, _applier, _cursor, lane) = lane(&config);
        assert_eq!(lane.effective_cursor(), "0");
    }

    #[tokio::test]
    async fn stale_next_cursor_is_not_an_error() {
        let config = SyncConfig::new("test");
        let (transport, _applier, cursor, lane) = lane(&config);

        cursor.advance("10").unwrap();
        transport.script_pull(Ok(ChangePage::new(vec![], Some("5".into()))));

        lane.pull_now().await.unwrap();
        assert_eq!(cursor.get().as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn transport_failure_propagates() {
        let config = SyncConfig::new("test");
        let (transport, _applier, _cursor, lane) = lane(&config);

        transport.script_pull(Err(crate::error::SyncError::transport_retryable(
            "offline",
        )));

        assert!(lane.pull_now().await.is_err());
        // The single-flight guard is released after a failure.
        transport.script_pull(Ok(ChangePage::empty()));
        assert!(lane.pull_now().await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_pull_is_skipped() {
        let config = SyncConfig::new("test");
        let (transport, _applier, _cursor, lane) = lane(&config);
        let lane = Arc::new(lane);

        // Simulate an in-progress pull by holding the guard.
        lane.in_flight.store(true, Ordering::SeqCst);
        assert_eq!(lane.pull_now().await.unwrap(), None);

        lane.in_flight.store(false, Ordering::SeqCst);
        transport.script_pull(Ok(ChangePage::empty()));
        assert_eq!(lane.pull_now().await.unwrap(), Some(0));
    }
}
