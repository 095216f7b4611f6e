//! Engine events for observability.
//!
//! Events are best-effort: a sink may drop or ignore them freely, and
//! nothing in the engine waits on delivery.

/// An observable engine transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The engine finished starting.
    Started,
    /// The engine stopped.
    Stopped,
    /// The single-instance lock was stolen by another instance.
    LockLost,
    /// The outbox was full and the oldest pending item was dropped.
    QueueFull {
        /// Idempotency key of the dropped item.
        dropped_key: String,
    },
    /// A push batch completed.
    PushCompleted {
        /// Items acknowledged by the server.
        acked: usize,
        /// Items rejected by the server.
        rejected: usize,
    },
    /// A push batch failed at the transport level.
    PushFailed {
        /// Error detail.
        message: String,
        /// Whether the batch will be retried.
        retryable: bool,
    },
    /// A pull completed.
    PullCompleted {
        /// Number of changes applied.
        changes: usize,
    },
    /// A pull failed.
    PullFailed {
        /// Error detail.
        message: String,
    },
    /// The live change stream connected.
    StreamConnected,
    /// The live change stream disconnected.
    StreamDisconnected {
        /// Error detail.
        message: String,
    },
}

/// A sink for engine events.
///
/// Implementations must not block; the engine emits events inline from
/// its lanes. Event delivery never gates correctness.
pub trait EventSink: Send + Sync {
    /// Receives one event.
    fn emit(&self, event: SyncEvent);
}

/// A sink that discards all events.
///
/// Used when no observer is configured, so emitting compiles to a
/// no-op instead of an optional callback check at every site.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SyncEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_accepts_everything() {
        let sink = NullSink;
        sink.emit(SyncEvent::Started);
        sink.emit(SyncEvent::QueueFull {
            dropped_key: "k".into(),
        });
    }
}
