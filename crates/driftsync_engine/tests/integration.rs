//! Integration tests for the engine against the reference server.

use async_trait::async_trait;
use driftsync_engine::{
    ChangeStream, MemoryApplier, StreamFeeder, SyncConfig, SyncEngine, SyncError, SyncResult,
    Transport, WriteIntent,
};
use driftsync_kv::MemoryKv;
use driftsync_protocol::{ChangePage, WriteMeta, WriteOp, WriteOutcome, WriteRequest};
use driftsync_server::{ServerConfig, SyncServer};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// A transport that talks to an in-memory server directly.
struct InProcessTransport {
    server: Arc<SyncServer>,
}

impl InProcessTransport {
    fn new(server: Arc<SyncServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn push(&self, batch: Vec<WriteRequest>) -> SyncResult<Vec<WriteOutcome>> {
        Ok(self.server.handle_push(batch))
    }

    async fn pull(
        &self,
        cursor: &str,
        limit: usize,
        resources: Option<&[String]>,
    ) -> SyncResult<ChangePage> {
        self.server
            .handle_pull(cursor, limit, resources)
            .map_err(|e| SyncError::transport_fatal(e.to_string()))
    }

    async fn subscribe(
        &self,
        cursor: &str,
        resources: Option<&[String]>,
    ) -> SyncResult<ChangeStream> {
        // Watch before catching up so no change can fall between the
        // two; the applier tolerates the duplicate delivery this can
        // cause.
        let live = self.server.watch();
        let catchup = self
            .server
            .handle_pull(cursor, 500, resources)
            .map_err(|e| SyncError::transport_fatal(e.to_string()))?;
        let resources = resources.map(<[String]>::to_vec);

        let (feeder, stream) = ChangeStream::pair(16);
        let StreamFeeder { tx, closed } = feeder;
        tokio::spawn(async move {
            let mut live = live;
            let mut closed = closed;
            if tx.send(Ok(catchup)).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = &mut closed => return,
                    page = live.recv() => match page {
                        Ok(mut page) => {
                            if let Some(rs) = &resources {
                                page.changes.retain(|c| rs.iter().any(|r| r == &c.resource));
                            }
                            if tx.send(Ok(page)).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => {
                            let _ = tx
                                .send(Err(SyncError::transport_retryable("stream lagged")))
                                .await;
                            return;
                        }
                    },
                }
            }
        });
        Ok(stream)
    }
}

struct Harness {
    server: Arc<SyncServer>,
    applier: Arc<MemoryApplier>,
    engine: SyncEngine<InProcessTransport, Arc<MemoryApplier>>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness(config: SyncConfig) -> Harness {
    init_tracing();
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    harness_with(config, server, MemoryKv::new())
}

fn harness_with(config: SyncConfig, server: Arc<SyncServer>, kv: MemoryKv) -> Harness {
    let applier = Arc::new(MemoryApplier::new());
    let engine = SyncEngine::new(
        config,
        Arc::new(kv),
        InProcessTransport::new(Arc::clone(&server)),
        Arc::clone(&applier),
    )
    .unwrap();
    Harness {
        server,
        applier,
        engine,
    }
}

fn quiet_config() -> SyncConfig {
    SyncConfig::new("app").with_periodic_pull_interval(None)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn enqueue_flush_acks_through_server() {
    let h = harness(quiet_config());
    h.engine.set_subscribed(false).unwrap();
    h.engine.start().await.unwrap();

    h.engine
        .enqueue_write(vec![WriteIntent::new(
            "todos",
            WriteOp::Create {
                entity_id: Some("e1".into()),
                value: json!({"title": "water the plants"}),
            },
        )])
        .await
        .unwrap();

    wait_until(|| h.engine.outbox_stats().total == 0).await;

    assert_eq!(h.server.change_count(), 1);
    let acks = h.applier.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].entity_id, "e1");
    assert_eq!(acks[0].version, 1);

    h.engine.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn offline_edit_chain_is_rebased_not_conflicted() {
    let h = harness(quiet_config());
    h.engine.set_subscribed(false).unwrap();

    // Seed the entity at version 1.
    h.server.handle_push(vec![WriteRequest::new(
        "todos",
        WriteOp::Create {
            entity_id: Some("e1".into()),
            value: json!({"n": 0}),
        },
    )]);

    // Two offline edits against version 1. Different options keep them
    // in separate batches, so the second must be rebased onto the
    // version the first ack returns.
    let mut urgent = WriteMeta::new();
    urgent.insert("priority".into(), json!("high"));
    h.engine
        .enqueue_write(vec![
            WriteIntent::new(
                "todos",
                WriteOp::Update {
                    entity_id: "e1".into(),
                    base_version: 1,
                    value: json!({"n": 1}),
                },
            ),
            WriteIntent::new(
                "todos",
                WriteOp::Update {
                    entity_id: "e1".into(),
                    base_version: 1,
                    value: json!({"n": 2}),
                },
            )
            .with_meta(urgent),
        ])
        .await
        .unwrap();

    h.engine.start().await.unwrap();
    wait_until(|| h.engine.outbox_stats().total == 0).await;

    // Both edits landed: no spurious stale-version rejection.
    assert!(h.applier.rejects().is_empty());
    assert_eq!(h.applier.acks().len(), 2);
    assert_eq!(h.server.cursor(), 3);

    h.engine.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn pull_now_applies_remote_changes_and_advances_cursor() {
    let h = harness(quiet_config());

    h.server.handle_push(vec![
        WriteRequest::new(
            "todos",
            WriteOp::Create {
                entity_id: Some("e1".into()),
                value: json!(1),
            },
        ),
        WriteRequest::new(
            "todos",
            WriteOp::Create {
                entity_id: Some("e2".into()),
                value: json!(2),
            },
        ),
    ]);

    let applied = h.engine.pull_now().await.unwrap();
    assert_eq!(applied, Some(2));
    assert_eq!(h.applier.changes().len(), 2);
    assert_eq!(h.engine.cursor().as_deref(), Some("2"));

    // A second pull from the stored cursor finds nothing new.
    let applied = h.engine.pull_now().await.unwrap();
    assert_eq!(applied, Some(0));
}

#[tokio::test(start_paused = true)]
async fn resend_after_crash_is_deduplicated_by_server() {
    use driftsync_engine::{NewWrite, OutboxStore};

    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let kv = MemoryKv::new();

    let op = WriteOp::Create {
        entity_id: Some("e1".into()),
        value: json!({"n": 1}),
    };

    // Simulate a crash between transport success and commit: the
    // server applied the write, but the outbox still holds the item
    // in flight.
    {
        let outbox = OutboxStore::open(Arc::new(kv.clone()), "app:outbox", 100).unwrap();
        outbox
            .enqueue(
                vec![NewWrite {
                    idempotency_key: "k1".into(),
                    resource: "todos".into(),
                    op: op.clone(),
                    meta: None,
                }],
                1,
            )
            .unwrap();
        outbox.mark_in_flight(&["k1".into()], 1).unwrap();
    }
    server.handle_push(vec![
        WriteRequest::new("todos", op).with_idempotency_key("k1")
    ]);
    assert_eq!(server.change_count(), 1);

    // Restart: recovery releases the reservation and the item is
    // resent; the server replays its recorded outcome instead of
    // applying twice.
    let mut config = quiet_config();
    config.in_flight_timeout = Duration::ZERO;
    let h = harness_with(config, Arc::clone(&server), kv);
    h.engine.set_subscribed(false).unwrap();
    h.engine.start().await.unwrap();

    wait_until(|| h.engine.outbox_stats().total == 0).await;

    assert_eq!(h.server.change_count(), 1);
    let acks = h.applier.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].idempotency_key, "k1");
    assert_eq!(acks[0].version, 1);

    h.engine.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn subscription_streams_live_changes() {
    let h = harness(quiet_config());
    h.engine.start().await.unwrap();

    // Another client commits a write; the subscription delivers it.
    h.server.handle_push(vec![WriteRequest::new(
        "todos",
        WriteOp::Create {
            entity_id: Some("e1".into()),
            value: json!({"live": true}),
        },
    )]);

    wait_until(|| h.applier.changes().len() == 1).await;
    wait_until(|| h.engine.cursor().as_deref() == Some("1")).await;

    // Suspending the subscription stops delivery; resuming catches up
    // from the persisted cursor.
    h.engine.set_subscribed(false).unwrap();
    h.server.handle_push(vec![WriteRequest::new(
        "todos",
        WriteOp::Create {
            entity_id: Some("e2".into()),
            value: json!({"live": true}),
        },
    )]);
    h.engine.set_subscribed(true).unwrap();

    wait_until(|| h.applier.changes().len() == 2).await;
    assert_eq!(h.applier.changes()[1].entity_id, "e2");

    h.engine.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn conflicting_write_is_rejected_with_server_state() {
    let h = harness(quiet_config());
    h.engine.set_subscribed(false).unwrap();

    // Seed at version 1, then bump to version 2 behind the client's
    // back.
    h.server.handle_push(vec![WriteRequest::new(
        "todos",
        WriteOp::Create {
            entity_id: Some("e1".into()),
            value: json!({"n": 0}),
        },
    )]);
    h.server.handle_push(vec![WriteRequest::new(
        "todos",
        WriteOp::Update {
            entity_id: "e1".into(),
            base_version: 1,
            value: json!({"n": 99}),
        },
    )]);

    h.engine
        .enqueue_write(vec![WriteIntent::new(
            "todos",
            WriteOp::Update {
                entity_id: "e1".into(),
                base_version: 1,
                value: json!({"n": 1}),
            },
        )])
        .await
        .unwrap();

    h.engine.start().await.unwrap();
    wait_until(|| h.engine.outbox_stats().total == 0).await;

    let rejects = h.applier.rejects();
    assert_eq!(rejects.len(), 1);
    assert_eq!(rejects[0].0.error.current_version, Some(2));
    assert_eq!(rejects[0].0.error.current_value, Some(json!({"n": 99})));
    assert!(h.applier.acks().is_empty());

    h.engine.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn outbox_survives_restart_on_disk() {
    use driftsync_kv::FileKv;

    init_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let server = Arc::new(SyncServer::new(ServerConfig::default()));

    // First process enqueues while offline and exits without syncing.
    {
        let kv = Arc::new(FileKv::open(dir.path()).unwrap());
        let applier = Arc::new(MemoryApplier::new());
        let engine = SyncEngine::new(
            quiet_config(),
            kv,
            InProcessTransport::new(Arc::clone(&server)),
            Arc::clone(&applier),
        )
        .unwrap();
        engine
            .enqueue_write(vec![WriteIntent::new(
                "todos",
                WriteOp::Create {
                    entity_id: Some("e1".into()),
                    value: json!({"offline": true}),
                },
            )])
            .await
            .unwrap();
        assert_eq!(engine.outbox_stats().pending, 1);
    }

    // A later process over the same directory drains the queue.
    let kv = Arc::new(FileKv::open(dir.path()).unwrap());
    let applier = Arc::new(MemoryApplier::new());
    let engine = SyncEngine::new(
        quiet_config(),
        kv,
        InProcessTransport::new(Arc::clone(&server)),
        Arc::clone(&applier),
    )
    .unwrap();
    assert_eq!(engine.outbox_stats().pending, 1);

    engine.set_subscribed(false).unwrap();
    engine.start().await.unwrap();
    wait_until(|| engine.outbox_stats().total == 0).await;

    assert_eq!(server.change_count(), 1);
    assert_eq!(applier.acks().len(), 1);

    engine.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn kv_is_shared_state_for_lock_exclusivity() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let kv = MemoryKv::new();
    let first = harness_with(quiet_config(), Arc::clone(&server), kv.clone());
    let second = harness_with(quiet_config(), server, kv);
    first.engine.set_subscribed(false).unwrap();
    second.engine.set_subscribed(false).unwrap();

    first.engine.start().await.unwrap();
    assert!(matches!(
        second.engine.start().await,
        Err(SyncError::LockHeld)
    ));
    assert!(first.engine.is_lock_held());
    assert!(!second.engine.is_lock_held());

    first.engine.stop().await.unwrap();
    second.engine.start().await.unwrap();
    second.engine.stop().await.unwrap();
}
