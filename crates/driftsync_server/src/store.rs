//! Server-side entity table and change log.

use driftsync_protocol::{Change, WriteOutcome};
use std::collections::HashMap;

/// The server's view of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    /// Current version; bumped on every applied write.
    pub version: u64,
    /// Current value. Retained for conflict payloads even after a
    /// delete.
    pub value: serde_json::Value,
    /// True if the latest write was a delete.
    pub deleted: bool,
}

/// Entity table plus ordered change log.
///
/// The change log index doubles as the cursor: the cursor `n` names the
/// position after the first `n` changes, so a client at cursor `n`
/// pulls `log[n..]`.
#[derive(Debug, Default)]
pub struct ChangeLog {
    entities: HashMap<(String, String), EntityRecord>,
    log: Vec<Change>,
    outcomes: HashMap<String, WriteOutcome>,
}

impl ChangeLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current cursor.
    pub fn cursor(&self) -> u64 {
        self.log.len() as u64
    }

    /// Returns the number of committed changes.
    pub fn len(&self) -> usize {
        self.log.len()
    }

    /// Returns true if nothing has been committed.
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Looks up an entity.
    pub fn entity(&self, resource: &str, entity_id: &str) -> Option<&EntityRecord> {
        self.entities
            .get(&(resource.to_string(), entity_id.to_string()))
    }

    /// Records an applied write: updates the entity table and appends
    /// to the change log.
    pub fn commit(&mut self, change: Change) {
        self.entities.insert(
            (change.resource.clone(), change.entity_id.clone()),
            EntityRecord {
                version: change.version,
                value: change.value.clone().unwrap_or(serde_json::Value::Null),
                deleted: change.deleted,
            },
        );
        self.log.push(change);
    }

    /// Returns a page of changes after `cursor`, filtered by resources.
    pub fn changes_since(
        &self,
        cursor: u64,
        limit: usize,
        resources: Option<&[String]>,
    ) -> (Vec<Change>, u64) {
        let start = (cursor as usize).min(self.log.len());
        let mut changes = Vec::new();
        let mut next = cursor;

        for (offset, change) in self.log[start..].iter().enumerate() {
            if changes.len() >= limit {
                break;
            }
            next = (start + offset + 1) as u64;
            let wanted = resources.map_or(true, |rs| rs.iter().any(|r| r == &change.resource));
            if wanted {
                changes.push(change.clone());
            }
        }

        (changes, next)
    }

    /// Returns the recorded outcome for an idempotency key, if this
    /// write was already applied.
    pub fn replay(&self, idempotency_key: &str) -> Option<&WriteOutcome> {
        self.outcomes.get(idempotency_key)
    }

    /// Records the outcome of a keyed write for future replay.
    pub fn remember(&mut self, idempotency_key: String, outcome: WriteOutcome) {
        self.outcomes.insert(idempotency_key, outcome);
    }
}
