//! # DriftSync KV
//!
//! Key-value persistence abstraction for DriftSync.
//!
//! The sync engine persists three kinds of state: the outbox (pending
//! writes), the change-stream cursor, and the single-instance lock record.
//! All three go through the [`KvStore`] trait defined here, so the engine
//! never owns a storage format of its own.
//!
//! ## Design Principles
//!
//! - Stores are **opaque byte maps** - they do not interpret values
//! - `set` must be durable before it returns for crash recovery to be
//!   meaningful
//! - Stores must be `Send + Sync` for concurrent access
//!
//! ## Available Stores
//!
//! - [`MemoryKv`] - For testing and ephemeral engines
//! - [`FileKv`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use driftsync_kv::{KvStore, MemoryKv};
//!
//! let kv = MemoryKv::new();
//! kv.set("cursor", b"42").unwrap();
//! assert_eq!(kv.get("cursor").unwrap(), Some(b"42".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod store;

pub use error::{KvError, KvResult};
pub use file::FileKv;
pub use memory::MemoryKv;
pub use store::KvStore;
