//! Conflict-resolution strategies for rejected writes.

use serde::{Deserialize, Serialize};

/// How the local cache should reconcile a write the server refused with
/// a version conflict.
///
/// The strategy is decided by configuration and *forwarded* to the
/// applier together with the reject payload; the sync lanes themselves
/// never reconcile state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Adopt the server's version and value.
    #[default]
    ServerWins,
    /// Re-issue the local write on top of the server's version.
    ClientWins,
    /// Drop the local write and surface the rejection.
    Reject,
    /// Hand both sides to the application for manual resolution.
    Manual,
}

impl ConflictStrategy {
    /// Returns true if this strategy resolves conflicts without
    /// application involvement.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictStrategy::Manual)
    }

    /// Returns the kebab-case wire name of this strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ServerWins => "server-wins",
            ConflictStrategy::ClientWins => "client-wins",
            ConflictStrategy::Reject => "reject",
            ConflictStrategy::Manual => "manual",
        }
    }
}
