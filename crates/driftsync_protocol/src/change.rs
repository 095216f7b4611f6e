//! Remote change-stream types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One remote change, as delivered by pulls and live streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// The resource (logical collection) the change belongs to.
    pub resource: String,
    /// The changed entity.
    pub entity_id: String,
    /// The entity's version after the change.
    pub version: u64,
    /// The entity's value after the change; absent for deletions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// True if the entity was deleted.
    #[serde(default)]
    pub deleted: bool,
}

impl Change {
    /// Creates an upsert-style change.
    pub fn put(
        resource: impl Into<String>,
        entity_id: impl Into<String>,
        version: u64,
        value: Value,
    ) -> Self {
        Self {
            resource: resource.into(),
            entity_id: entity_id.into(),
            version,
            value: Some(value),
            deleted: false,
        }
    }

    /// Creates a deletion change.
    pub fn delete(resource: impl Into<String>, entity_id: impl Into<String>, version: u64) -> Self {
        Self {
            resource: resource.into(),
            entity_id: entity_id.into(),
            version,
            value: None,
            deleted: true,
        }
    }
}

/// One page of remote changes, shared by pull responses and live stream
/// batches.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangePage {
    /// Changes in stream order.
    pub changes: Vec<Change>,
    /// The cursor after these changes, if the stream advanced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl ChangePage {
    /// Creates a page.
    pub fn new(changes: Vec<Change>, next_cursor: Option<String>) -> Self {
        Self {
            changes,
            next_cursor,
        }
    }

    /// Creates an empty page that does not advance the cursor.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if the page carries no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
