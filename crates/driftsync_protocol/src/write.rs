//! Write operations and their wire shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Options attached to a write, echoed back with acks and rejects.
///
/// The map is ordered so two writes with the same options serialize to
/// the same key, which is what batch compaction groups on.
pub type WriteMeta = BTreeMap<String, Value>;

/// The kind of write a client intends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
    /// Create a new entity.
    Create,
    /// Update an existing entity at a known version.
    Update,
    /// Delete an existing entity at a known version.
    Delete,
    /// Create-or-update, optionally version-checked.
    Upsert,
}

impl WriteAction {
    /// Returns the lowercase wire name of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteAction::Create => "create",
            WriteAction::Update => "update",
            WriteAction::Delete => "delete",
            WriteAction::Upsert => "upsert",
        }
    }
}

/// A single write intent, carrying only the fields valid for its action.
///
/// `base_version` is the optimistic-concurrency token: the version the
/// write assumes the entity currently has. The server rejects the write
/// with a conflict if the stored version differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum WriteOp {
    /// Create a new entity. `entity_id` is absent when the server
    /// assigns ids.
    Create {
        /// Client-chosen entity id, if any.
        entity_id: Option<String>,
        /// The entity payload.
        value: Value,
    },
    /// Update an existing entity.
    Update {
        /// The entity to update.
        entity_id: String,
        /// The version this update was made against.
        base_version: u64,
        /// The new payload.
        value: Value,
    },
    /// Delete an existing entity.
    Delete {
        /// The entity to delete.
        entity_id: String,
        /// The version this delete was made against.
        base_version: u64,
    },
    /// Create-or-update. A present `base_version` makes the upsert
    /// strict (version-checked); absent means last-writer-wins.
    Upsert {
        /// The entity to upsert.
        entity_id: String,
        /// Optional version check.
        base_version: Option<u64>,
        /// The new payload.
        value: Value,
    },
}

impl WriteOp {
    /// Returns the action of this write.
    pub fn action(&self) -> WriteAction {
        match self {
            WriteOp::Create { .. } => WriteAction::Create,
            WriteOp::Update { .. } => WriteAction::Update,
            WriteOp::Delete { .. } => WriteAction::Delete,
            WriteOp::Upsert { .. } => WriteAction::Upsert,
        }
    }

    /// Returns the entity id this write addresses, if known.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            WriteOp::Create { entity_id, .. } => entity_id.as_deref(),
            WriteOp::Update { entity_id, .. }
            | WriteOp::Delete { entity_id, .. }
            | WriteOp::Upsert { entity_id, .. } => Some(entity_id),
        }
    }

    /// Returns the optimistic-concurrency token, if this write carries one.
    pub fn base_version(&self) -> Option<u64> {
        match self {
            WriteOp::Create { .. } => None,
            WriteOp::Update { base_version, .. } | WriteOp::Delete { base_version, .. } => {
                Some(*base_version)
            }
            WriteOp::Upsert { base_version, .. } => *base_version,
        }
    }

    /// Rewrites the base version (used when rebasing queued writes onto
    /// a freshly acknowledged sibling).
    ///
    /// Creates and unversioned upserts are unaffected.
    pub fn set_base_version(&mut self, version: u64) {
        match self {
            WriteOp::Create { .. } => {}
            WriteOp::Update { base_version, .. } | WriteOp::Delete { base_version, .. } => {
                *base_version = version;
            }
            WriteOp::Upsert { base_version, .. } => {
                if base_version.is_some() {
                    *base_version = Some(version);
                }
            }
        }
    }

    /// Returns the payload value, if this write carries one.
    pub fn value(&self) -> Option<&Value> {
        match self {
            WriteOp::Create { value, .. }
            | WriteOp::Update { value, .. }
            | WriteOp::Upsert { value, .. } => Some(value),
            WriteOp::Delete { .. } => None,
        }
    }
}

/// One wire item in a push batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// The resource (logical collection) being written.
    pub resource: String,
    /// The write itself.
    pub op: WriteOp,
    /// Client-generated token letting the server recognize and ignore
    /// duplicate delivery of the same logical write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Ask the server to echo the written value in the outcome.
    #[serde(default)]
    pub returning: bool,
    /// Write options, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<WriteMeta>,
}

impl WriteRequest {
    /// Creates a new write request without options.
    pub fn new(resource: impl Into<String>, op: WriteOp) -> Self {
        Self {
            resource: resource.into(),
            op,
            idempotency_key: None,
            returning: false,
            meta: None,
        }
    }

    /// Attaches an idempotency token to this request.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Requests server echo of the written value.
    #[must_use]
    pub fn with_returning(mut self, returning: bool) -> Self {
        self.returning = returning;
        self
    }

    /// Attaches options to this request.
    #[must_use]
    pub fn with_meta(mut self, meta: WriteMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Why a write was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteErrorKind {
    /// The base version no longer matches the stored version.
    Conflict,
    /// The payload failed server-side validation.
    Validation,
    /// The entity does not exist.
    NotFound,
    /// The server failed internally while applying the write.
    Internal,
}

/// A per-item write failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteError {
    /// The failure category.
    pub kind: WriteErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// The server's current version of the entity, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<u64>,
    /// The server's current value of the entity, when supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<Value>,
}

impl WriteError {
    /// Creates a version conflict error carrying the server's state.
    pub fn conflict(current_version: u64, current_value: Option<Value>) -> Self {
        Self {
            kind: WriteErrorKind::Conflict,
            message: format!("stale base version, server is at {current_version}"),
            current_version: Some(current_version),
            current_value,
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: WriteErrorKind::Internal,
            message: message.into(),
            current_version: None,
            current_value: None,
        }
    }

    /// Creates a not-found error.
    pub fn not_found(entity_id: &str) -> Self {
        Self {
            kind: WriteErrorKind::NotFound,
            message: format!("entity {entity_id} does not exist"),
            current_version: None,
            current_value: None,
        }
    }

    /// Returns true if retrying the same write could succeed.
    ///
    /// Only internal failures qualify; conflicts, validation failures and
    /// missing entities are definitive refusals.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, WriteErrorKind::Internal)
    }
}

/// The per-item result of a push, indexed positionally to the sent batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WriteOutcome {
    /// The write was applied.
    Ok {
        /// The entity id (server-assigned for creates).
        entity_id: String,
        /// The entity's version after the write.
        version: u64,
        /// The written value, echoed when the client asked for it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    /// The write was refused.
    Err {
        /// The refusal.
        error: WriteError,
    },
}

impl WriteOutcome {
    /// Creates a successful outcome.
    pub fn ok(entity_id: impl Into<String>, version: u64) -> Self {
        WriteOutcome::Ok {
            entity_id: entity_id.into(),
            version,
            value: None,
        }
    }

    /// Creates a successful outcome echoing the written value.
    pub fn ok_with_value(entity_id: impl Into<String>, version: u64, value: Value) -> Self {
        WriteOutcome::Ok {
            entity_id: entity_id.into(),
            version,
            value: Some(value),
        }
    }

    /// Creates a failed outcome.
    pub fn error(error: WriteError) -> Self {
        WriteOutcome::Err { error }
    }

    /// Returns true if the write was applied.
    pub fn is_ok(&self) -> bool {
        matches!(self, WriteOutcome::Ok { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_names() {
        assert_eq!(WriteAction::Create.as_str(), "create");
        assert_eq!(WriteAction::Update.as_str(), "update");
        assert_eq!(WriteAction::Delete.as_str(), "delete");
        assert_eq!(WriteAction::Upsert.as_str(), "upsert");
    }

    #[test]
    fn op_accessors() {
        let op = WriteOp::Update {
            entity_id: "e1".into(),
            base_version: 3,
            value: json!({"title": "x"}),
        };
        assert_eq!(op.action(), WriteAction::Update);
        assert_eq!(op.entity_id(), Some("e1"));
        assert_eq!(op.base_version(), Some(3));
        assert!(op.value().is_some());

        let op = WriteOp::Create {
            entity_id: None,
            value: json!({}),
        };
        assert_eq!(op.entity_id(), None);
        assert_eq!(op.base_version(), None);
    }

    #[test]
    fn rebase_rewrites_versioned_ops_only() {
        let mut update = WriteOp::Update {
            entity_id: "e1".into(),
            base_version: 1,
            value: json!(1),
        };
        update.set_base_version(2);
        assert_eq!(update.base_version(), Some(2));

        let mut loose_upsert = WriteOp::Upsert {
            entity_id: "e1".into(),
            base_version: None,
            value: json!(1),
        };
        loose_upsert.set_base_version(2);
        assert_eq!(loose_upsert.base_version(), None);

        let mut strict_upsert = WriteOp::Upsert {
            entity_id: "e1".into(),
            base_version: Some(1),
            value: json!(1),
        };
        strict_upsert.set_base_version(2);
        assert_eq!(strict_upsert.base_version(), Some(2));

        let mut create = WriteOp::Create {
            entity_id: None,
            value: json!(1),
        };
        create.set_base_version(2);
        assert_eq!(create.base_version(), None);
    }

    #[test]
    fn outcome_constructors() {
        let ok = WriteOutcome::ok("e1", 5);
        assert!(ok.is_ok());

        let err = WriteOutcome::error(WriteError::conflict(7, None));
        assert!(!err.is_ok());
        if let WriteOutcome::Err { error } = err {
            assert_eq!(error.kind, WriteErrorKind::Conflict);
            assert_eq!(error.current_version, Some(7));
        }
    }

    #[test]
    fn write_error_retryability() {
        assert!(WriteError::internal("boom").is_retryable());
        assert!(!WriteError::conflict(1, None).is_retryable());
        assert!(!WriteError::not_found("e1").is_retryable());
    }

    #[test]
    fn request_cbor_roundtrip() {
        let req = WriteRequest::new(
            "todos",
            WriteOp::Update {
                entity_id: "e1".into(),
                base_version: 2,
                value: json!({"done": true}),
            },
        );

        let mut bytes = Vec::new();
        ciborium::into_writer(&req, &mut bytes).unwrap();
        let decoded: WriteRequest = ciborium::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(decoded, req);
    }
}
