//! # DriftSync Engine
//!
//! Local-first synchronization engine for DriftSync.
//!
//! This crate provides:
//! - Durable outbox with dedup, compaction, and crash recovery
//! - Push, pull, and subscribe lanes over an abstract transport
//! - Virtual version chaining (rebasing) for offline edit chains
//! - Retry with jittered exponential backoff
//! - Cross-process single-instance lease lock
//! - Monotonic change-stream cursor persistence
//!
//! ## Architecture
//!
//! Application code enqueues writes; the **push lane** drains them in
//! compacted batches to the remote write endpoint and routes acks and
//! rejects through an injected [`Applier`]. Independently, the **pull
//! lane** polls and the **subscribe lane** streams remote changes into
//! the same applier, advancing a compare-and-set cursor. A lease lock
//! keeps a second engine instance (say, another open tab) from draining
//! the same outbox.
//!
//! ## Key Invariants
//!
//! - Push is at-least-once: acks reach the applier before items leave
//!   the outbox, so the applier must tolerate duplicate acks
//! - The cursor never regresses, even with pull and subscribe racing
//! - A write the server has definitively refused is surfaced exactly
//!   once and never silently retried
//! - At most one instance per logical queue holds the lock at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod backoff;
mod clock;
mod config;
mod cursor;
mod engine;
mod error;
mod event;
mod lock;
mod opid;
mod outbox;
mod pull;
mod push;
mod subscribe;
mod transport;

pub use applier::{Applier, MemoryApplier, WriteAck, WriteReject};
pub use backoff::{BackoffPolicy, RetryCounter};
pub use config::{LockConfig, SyncConfig};
pub use cursor::{compare_cursors, CursorStore};
pub use engine::{EngineState, SyncEngine, WriteIntent};
pub use error::{SyncError, SyncResult};
pub use event::{EventSink, NullSink, SyncEvent};
pub use lock::{InstanceLock, LockRecord};
pub use opid::OpIdGenerator;
pub use outbox::{
    CommitOutcome, EnqueueReport, NewWrite, OutboxItem, OutboxStats, OutboxStore,
    RebaseInstruction,
};
pub use pull::PullLane;
pub use push::PushLane;
pub use subscribe::SubscribeLane;
pub use transport::{ChangeStream, MockTransport, StreamFeeder, Transport};
