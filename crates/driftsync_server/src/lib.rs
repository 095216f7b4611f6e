//! # DriftSync Server
//!
//! In-process reference sync authority for DriftSync.
//!
//! This crate provides:
//! - Versioned entity storage with compare-and-set writes
//! - Idempotency replay for at-least-once clients
//! - An ordered change log with numeric cursors
//! - Live change broadcast for subscriptions
//!
//! # Architecture
//!
//! The server is deliberately transport-free: a real deployment wraps
//! [`SyncServer::handle_push`] and [`SyncServer::handle_pull`] in HTTP
//! endpoints and bridges [`SyncServer::watch`] into a streaming
//! response. Engine integration tests call the handlers directly
//! through an in-process transport.
//!
//! # Protocol
//!
//! - Push: per-item compare-and-set against the entity's version;
//!   stale base versions are refused with the server's current state
//! - Pull: pages the change log from a numeric cursor
//! - Watch: a broadcast of every committed change page

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod server;
mod store;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::SyncServer;
pub use store::EntityRecord;
