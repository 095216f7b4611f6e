//! # DriftSync Protocol
//!
//! Shared data model and wire-shape types for DriftSync.
//!
//! This crate provides:
//! - `WriteOp` for pending local writes (create/update/delete/upsert)
//! - `WriteRequest` / `WriteOutcome` for push batches and their
//!   positionally-indexed per-item results
//! - `Change` / `ChangePage` for pull responses and live stream batches
//! - `ConflictStrategy` for rejected-write handling
//!
//! This is a pure data crate with no I/O operations. Types are
//! serde-derived so the transport layer can pick its own encoding.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod conflict;
mod write;

pub use change::{Change, ChangePage};
pub use conflict::ConflictStrategy;
pub use write::{
    WriteAction, WriteError, WriteErrorKind, WriteMeta, WriteOp, WriteOutcome, WriteRequest,
};
