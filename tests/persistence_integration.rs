//! Integration tests for relay persistence: debounced saves, restart
//! recovery, corrupt snapshots, and degraded rooms.

use std::sync::Arc;
use std::time::Duration;

use flowcanvas_collab::client::{SyncClient, SyncEvent};
use flowcanvas_collab::document::{GraphDoc, GraphOp, NodeState};
use flowcanvas_collab::server::{RelayServer, ServerConfig};
use flowcanvas_collab::storage::{MemorySnapshotStore, SnapshotStore};
use tokio::time::timeout;
use uuid::Uuid;

async fn start_relay(server: RelayServer) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://{addr}")
}

/// Join, apply one node upsert through the relay, disconnect.
async fn edit_and_leave(url: &str, doc_id: Uuid, kind: &str) -> Uuid {
    let mut client = SyncClient::new(doc_id, url, "tok", "Writer");
    let mut events = client.take_event_rx().unwrap();
    client.connect(None).await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::JoinAccepted { .. })) => {}
        other => panic!("Expected JoinAccepted, got {other:?}"),
    }

    let mut doc = GraphDoc::new();
    let node_id = Uuid::new_v4();
    let delta = doc.apply_local(GraphOp::UpsertNode(NodeState::new(node_id, kind, 1.0, 2.0)));
    client.send_delta(&delta).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.disconnect().await;
    node_id
}

async fn join_and_take_missing(url: &str, doc_id: Uuid) -> Vec<flowcanvas_collab::Delta> {
    let mut client = SyncClient::new(doc_id, url, "tok", "Reader");
    let mut events = client.take_event_rx().unwrap();
    client.connect(None).await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::JoinAccepted { missing_deltas, .. })) => missing_deltas,
        other => panic!("Expected JoinAccepted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_snapshot_saved_when_room_goes_idle() {
    let store = Arc::new(MemorySnapshotStore::new());
    let server = RelayServer::with_store(ServerConfig::for_testing(), store.clone());
    let url = start_relay(server).await;
    let doc_id = Uuid::new_v4();

    edit_and_leave(&url, doc_id, "prompt").await;

    // Idle flush is immediate on last departure.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.exists(doc_id).unwrap());
    assert!(store.metadata(doc_id).unwrap().unwrap().save_count >= 1);
}

#[tokio::test]
async fn test_document_survives_relay_restart() {
    let store: Arc<MemorySnapshotStore> = Arc::new(MemorySnapshotStore::new());
    let doc_id = Uuid::new_v4();
    let node_id;

    {
        let server = RelayServer::with_store(ServerConfig::for_testing(), store.clone());
        let url = start_relay(server).await;
        node_id = edit_and_leave(&url, doc_id, "prompt").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Fresh relay over the same store: a cold join replays the document.
    let server = RelayServer::with_store(ServerConfig::for_testing(), store);
    let url = start_relay(server).await;
    let missing = join_and_take_missing(&url, doc_id).await;

    let mut doc = GraphDoc::new();
    for delta in missing {
        doc.apply_remote(delta).unwrap();
    }
    assert!(doc.node(&node_id).is_some());
}

#[tokio::test]
async fn test_corrupt_snapshot_serves_empty_document() {
    let store = Arc::new(MemorySnapshotStore::new());
    let doc_id = Uuid::new_v4();
    store.inject_raw(doc_id, b"\xde\xad\xbe\xef not a snapshot".to_vec());

    let server = RelayServer::with_store(ServerConfig::for_testing(), store);
    let url = start_relay(server).await;

    // Join succeeds against an empty document instead of failing.
    let missing = join_and_take_missing(&url, doc_id).await;
    assert!(missing.is_empty());
}

#[tokio::test]
async fn test_failing_store_marks_room_degraded() {
    let store = Arc::new(MemorySnapshotStore::new());
    let config = ServerConfig {
        // Keep the room resident long enough to inspect it.
        idle_grace: Duration::from_secs(30),
        ..ServerConfig::for_testing()
    };
    let server = RelayServer::with_store(config, store.clone());
    let url = start_relay(server.clone()).await;
    let doc_id = Uuid::new_v4();

    store.set_fail_saves(true);
    edit_and_leave(&url, doc_id, "prompt").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = server.room_status(doc_id).await.unwrap();
    assert!(status.degraded);
    assert!(server.stats().await.saves_failed >= 1);
    assert!(!store.exists(doc_id).unwrap());

    // The room still serves its in-memory state.
    let missing = join_and_take_missing(&url, doc_id).await;
    assert_eq!(missing.len(), 1);
}

#[tokio::test]
async fn test_recover_warms_rooms_from_store() {
    let store = Arc::new(MemorySnapshotStore::new());
    let doc_id = Uuid::new_v4();

    let mut doc = GraphDoc::new();
    doc.apply_local(GraphOp::UpsertNode(NodeState::new(
        Uuid::new_v4(),
        "prompt",
        0.0,
        0.0,
    )));
    store.save(doc_id, &doc.encode_snapshot().unwrap()).unwrap();

    let config = ServerConfig {
        idle_grace: Duration::from_secs(30),
        ..ServerConfig::for_testing()
    };
    let server = RelayServer::with_store(config, store);
    assert_eq!(server.recover().await.unwrap(), 1);
    assert_eq!(server.room_count().await, 1);
}
