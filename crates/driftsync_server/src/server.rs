//! The reference sync authority.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::store::ChangeLog;
use driftsync_protocol::{Change, ChangePage, WriteError, WriteOp, WriteOutcome, WriteRequest};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

/// The in-process sync authority.
///
/// Applies pushed writes with compare-and-set versioning, pages the
/// change log for pulls, and broadcasts every committed page to
/// watchers.
///
/// # Example
///
/// ```
/// use driftsync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// // Wrap handle_push/handle_pull in your transport of choice.
/// assert_eq!(server.cursor(), 0);
/// ```
pub struct SyncServer {
    config: ServerConfig,
    state: RwLock<ChangeLog>,
    broadcast: broadcast::Sender<ChangePage>,
}

impl SyncServer {
    /// Creates a new server with empty state.
    pub fn new(config: ServerConfig) -> Self {
        let (broadcast, _) = broadcast::channel(256);
        Self {
            config,
            state: RwLock::new(ChangeLog::new()),
            broadcast,
        }
    }

    /// Returns the current cursor.
    pub fn cursor(&self) -> u64 {
        self.state.read().cursor()
    }

    /// Returns the number of committed changes.
    pub fn change_count(&self) -> usize {
        self.state.read().len()
    }

    /// Returns a receiver of every change page committed from now on.
    pub fn watch(&self) -> broadcast::Receiver<ChangePage> {
        self.broadcast.subscribe()
    }

    /// Applies a batch of writes, returning one outcome per item in
    /// order.
    pub fn handle_push(&self, batch: Vec<WriteRequest>) -> Vec<WriteOutcome> {
        let mut state = self.state.write();
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut committed = Vec::new();

        for request in &batch {
            // At-least-once clients resend batches; a keyed write that
            // was already applied replays its recorded outcome.
            if let Some(key) = &request.idempotency_key {
                if let Some(prior) = state.replay(key) {
                    outcomes.push(prior.clone());
                    continue;
                }
            }

            let outcome = self.apply_write(&mut state, request, &mut committed);
            if let Some(key) = &request.idempotency_key {
                state.remember(key.clone(), outcome.clone());
            }
            outcomes.push(outcome);
        }

        if !committed.is_empty() {
            let page = ChangePage::new(committed, Some(state.cursor().to_string()));
            debug!(changes = page.changes.len(), "broadcasting committed page");
            let _ = self.broadcast.send(page);
        }

        outcomes
    }

    fn apply_write(
        &self,
        state: &mut ChangeLog,
        request: &WriteRequest,
        committed: &mut Vec<Change>,
    ) -> WriteOutcome {
        let resource = &request.resource;
        let echo = self.config.returning || request.returning;
        match &request.op {
            WriteOp::Create { entity_id, value } => {
                let id = entity_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let prior = state.entity(resource, &id).cloned();
                match prior {
                    Some(record) if !record.deleted => WriteOutcome::error(WriteError {
                        kind: driftsync_protocol::WriteErrorKind::Validation,
                        message: format!("entity {id} already exists"),
                        current_version: Some(record.version),
                        current_value: self.config.conflict_values.then(|| record.value.clone()),
                    }),
                    prior => {
                        let version = prior.map_or(0, |r| r.version) + 1;
                        self.commit(
                            state,
                            committed,
                            Change::put(resource, &id, version, value.clone()),
                        );
                        self.ok(&id, version, value, echo)
                    }
                }
            }
            WriteOp::Update {
                entity_id,
                base_version,
                value,
            } => {
                let prior = state.entity(resource, entity_id).cloned();
                match prior {
                    None => WriteOutcome::error(WriteError::not_found(entity_id)),
                    Some(record) if record.deleted => {
                        WriteOutcome::error(WriteError::not_found(entity_id))
                    }
                    Some(record) if record.version != *base_version => self.conflict(&record),
                    Some(record) => {
                        let version = record.version + 1;
                        self.commit(
                            state,
                            committed,
                            Change::put(resource, entity_id, version, value.clone()),
                        );
                        self.ok(entity_id, version, value, echo)
                    }
                }
            }
            WriteOp::Delete {
                entity_id,
                base_version,
            } => {
                let prior = state.entity(resource, entity_id).cloned();
                match prior {
                    None => WriteOutcome::error(WriteError::not_found(entity_id)),
                    Some(record) if record.deleted => {
                        WriteOutcome::error(WriteError::not_found(entity_id))
                    }
                    Some(record) if record.version != *base_version => self.conflict(&record),
                    Some(record) => {
                        let version = record.version + 1;
                        self.commit(
                            state,
                            committed,
                            Change::delete(resource, entity_id, version),
                        );
                        WriteOutcome::ok(entity_id.clone(), version)
                    }
                }
            }
            WriteOp::Upsert {
                entity_id,
                base_version,
                value,
            } => {
                let prior = state.entity(resource, entity_id).cloned();
                match prior {
                    Some(record) if !record.deleted => {
                        if let Some(base) = base_version {
                            if record.version != *base {
                                return self.conflict(&record);
                            }
                        }
                        let version = record.version + 1;
                        self.commit(
                            state,
                            committed,
                            Change::put(resource, entity_id, version, value.clone()),
                        );
                        self.ok(entity_id, version, value, echo)
                    }
                    prior => {
                        let version = prior.map_or(0, |r| r.version) + 1;
                        self.commit(
                            state,
                            committed,
                            Change::put(resource, entity_id, version, value.clone()),
                        );
                        self.ok(entity_id, version, value, echo)
                    }
                }
            }
        }
    }

    fn commit(&self, state: &mut ChangeLog, committed: &mut Vec<Change>, change: Change) {
        committed.push(change.clone());
        state.commit(change);
    }

    fn ok(&self, entity_id: &str, version: u64, value: &serde_json::Value, echo: bool) -> WriteOutcome {
        if echo {
            WriteOutcome::ok_with_value(entity_id, version, value.clone())
        } else {
            WriteOutcome::ok(entity_id, version)
        }
    }

    fn conflict(&self, record: &crate::store::EntityRecord) -> WriteOutcome {
        WriteOutcome::error(WriteError::conflict(
            record.version,
            self.config.conflict_values.then(|| record.value.clone()),
        ))
    }

    /// Pages the change log from a numeric cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor was not issued by this server.
    pub fn handle_pull(
        &self,
        cursor: &str,
        limit: usize,
        resources: Option<&[String]>,
    ) -> ServerResult<ChangePage> {
        let cursor: u64 = cursor
            .parse()
            .map_err(|_| ServerError::InvalidCursor(cursor.to_string()))?;

        let state = self.state.read();
        let limit = limit.min(self.config.max_pull_batch).max(1);
        let (changes, next) = state.changes_since(cursor, limit, resources);
        Ok(ChangePage::new(changes, Some(next.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_protocol::WriteErrorKind;
    use serde_json::json;

    fn create(resource: &str, id: &str, value: serde_json::Value) -> WriteRequest {
        WriteRequest::new(
            resource,
            WriteOp::Create {
                entity_id: Some(id.into()),
                value,
            },
        )
    }

    fn update(resource: &str, id: &str, base: u64, value: serde_json::Value) -> WriteRequest {
        WriteRequest::new(
            resource,
            WriteOp::Update {
                entity_id: id.into(),
                base_version: base,
                value,
            },
        )
    }

    #[test]
    fn create_then_update() {
        let server = SyncServer::new(ServerConfig::default());

        let outcomes = server.handle_push(vec![create("todos", "e1", json!({"n": 1}))]);
        assert!(matches!(
            outcomes[0],
            WriteOutcome::Ok { version: 1, .. }
        ));

        let outcomes = server.handle_push(vec![update("todos", "e1", 1, json!({"n": 2}))]);
        assert!(matches!(
            outcomes[0],
            WriteOutcome::Ok { version: 2, .. }
        ));
        assert_eq!(server.cursor(), 2);
    }

    #[test]
    fn stale_base_version_conflicts() {
        let server = SyncServer::new(ServerConfig::default());
        server.handle_push(vec![create("todos", "e1", json!({"n": 1}))]);
        server.handle_push(vec![update("todos", "e1", 1, json!({"n": 2}))]);

        let outcomes = server.handle_push(vec![update("todos", "e1", 1, json!({"n": 3}))]);
        match &outcomes[0] {
            WriteOutcome::Err { error } => {
                assert_eq!(error.kind, WriteErrorKind::Conflict);
                assert_eq!(error.current_version, Some(2));
                assert_eq!(error.current_value, Some(json!({"n": 2})));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn update_missing_entity_is_not_found() {
        let server = SyncServer::new(ServerConfig::default());
        let outcomes = server.handle_push(vec![update("todos", "ghost", 1, json!({}))]);
        match &outcomes[0] {
            WriteOutcome::Err { error } => assert_eq!(error.kind, WriteErrorKind::NotFound),
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[test]
    fn server_assigned_create_ids() {
        let server = SyncServer::new(ServerConfig::default());
        let outcomes = server.handle_push(vec![WriteRequest::new(
            "todos",
            WriteOp::Create {
                entity_id: None,
                value: json!({}),
            },
        )]);
        match &outcomes[0] {
            WriteOutcome::Ok { entity_id, .. } => assert!(!entity_id.is_empty()),
            other => panic!("expected ok, got {other:?}"),
        }
    }

    #[test]
    fn idempotent_replay_returns_recorded_outcome() {
        let server = SyncServer::new(ServerConfig::default());

        let request = create("todos", "e1", json!({"n": 1})).with_idempotency_key("k1");
        let first = server.handle_push(vec![request.clone()]);
        let second = server.handle_push(vec![request]);

        assert_eq!(first, second);
        // The duplicate did not re-apply.
        assert_eq!(server.change_count(), 1);
    }

    #[test]
    fn delete_then_upsert_revives() {
        let server = SyncServer::new(ServerConfig::default());
        server.handle_push(vec![create("todos", "e1", json!({"n": 1}))]);
        server.handle_push(vec![WriteRequest::new(
            "todos",
            WriteOp::Delete {
                entity_id: "e1".into(),
                base_version: 1,
            },
        )]);

        let outcomes = server.handle_push(vec![WriteRequest::new(
            "todos",
            WriteOp::Upsert {
                entity_id: "e1".into(),
                base_version: None,
                value: json!({"n": 2}),
            },
        )]);
        assert!(matches!(
            outcomes[0],
            WriteOutcome::Ok { version: 3, .. }
        ));
    }

    #[test]
    fn pull_pages_from_cursor() {
        let server = SyncServer::new(ServerConfig::default());
        server.handle_push(vec![
            create("todos", "e1", json!(1)),
            create("todos", "e2", json!(2)),
        ]);

        let page = server.handle_pull("0", 10, None).unwrap();
        assert_eq!(page.changes.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("2"));

        let page = server.handle_pull("2", 10, None).unwrap();
        assert!(page.is_empty());

        assert!(server.handle_pull("nope", 10, None).is_err());
    }

    #[tokio::test]
    async fn watch_receives_committed_pages() {
        let server = SyncServer::new(ServerConfig::default());
        let mut rx = server.watch();

        server.handle_push(vec![create("todos", "e1", json!(1))]);

        let page = rx.recv().await.unwrap();
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("1"));
    }

    #[test]
    fn returning_echoes_values() {
        let server = SyncServer::new(ServerConfig::default().with_returning(true));
        let outcomes = server.handle_push(vec![create("todos", "e1", json!({"n": 1}))]);
        match &outcomes[0] {
            WriteOutcome::Ok { value, .. } => assert_eq!(value, &Some(json!({"n": 1}))),
            other => panic!("expected ok, got {other:?}"),
        }
    }
}
