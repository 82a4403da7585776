//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real relay and connect real clients, verifying
//! admission, delta fan-out, awareness, and reconnect resync.

use std::sync::Arc;
use std::time::Duration;

use flowcanvas_collab::client::{ConnectionState, SyncClient, SyncEvent};
use flowcanvas_collab::document::{Delta, GraphDoc, GraphOp, NodeState, RemoteApply};
use flowcanvas_collab::presence::AwarenessMessage;
use flowcanvas_collab::protocol::{JoinRefusal, JoinRequest, ProtocolError, SyncMessage};
use flowcanvas_collab::server::{RelayServer, ServerConfig, StaticTokenValidator};
use flowcanvas_collab::storage::MemorySnapshotStore;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Start a relay on an ephemeral port; returns its ws:// URL.
async fn start_relay(server: RelayServer) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://{addr}")
}

async fn start_default_relay() -> String {
    start_relay(RelayServer::new(ServerConfig::for_testing())).await
}

/// Connect a client and consume the JoinAccepted event.
async fn join(
    url: &str,
    doc_id: Uuid,
    name: &str,
) -> (SyncClient, mpsc::Receiver<SyncEvent>, Vec<Delta>) {
    let mut client = SyncClient::new(doc_id, url, format!("tok-{name}"), name);
    let mut events = client.take_event_rx().unwrap();
    client.connect(None).await.unwrap();

    let missing = match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::JoinAccepted { missing_deltas, .. })) => missing_deltas,
        other => panic!("Expected JoinAccepted, got {other:?}"),
    };
    (client, events, missing)
}

/// Join with a bare WebSocket, for tests that send hand-built frames.
async fn raw_join(
    url: &str,
    doc_id: Uuid,
    name: &str,
) -> (
    Uuid,
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let client_id = Uuid::new_v4();
    let request = JoinRequest {
        auth_token: format!("tok-{name}"),
        display_name: name.to_string(),
        state_vector: None,
    };
    let join = SyncMessage::join(client_id, doc_id, &request).unwrap();
    ws.send(Message::Binary(join.encode().unwrap().into()))
        .await
        .unwrap();
    match timeout(Duration::from_secs(2), ws.next()).await {
        Ok(Some(Ok(Message::Binary(_)))) => {}
        other => panic!("Expected JoinAck frame, got {other:?}"),
    }
    (client_id, ws)
}

/// Wait for the next remote delta, skipping presence noise.
async fn recv_delta(events: &mut mpsc::Receiver<SyncEvent>) -> Delta {
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(SyncEvent::RemoteDelta { delta, .. })) => return delta,
            Ok(Some(_)) => continue,
            other => panic!("Expected RemoteDelta, got {other:?}"),
        }
    }
}

fn node_op(id: Uuid, kind: &str) -> GraphOp {
    GraphOp::UpsertNode(NodeState::new(id, kind, 0.0, 0.0))
}

#[tokio::test]
async fn test_join_accepted_on_empty_document() {
    let url = start_default_relay().await;
    let (client, _events, missing) = join(&url, Uuid::new_v4(), "Alice").await;

    assert!(missing.is_empty());
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_join_rejected_with_bad_token() {
    let mut validator = StaticTokenValidator::new();
    validator.insert("good-token", "alice");
    let server = RelayServer::with_validator(
        ServerConfig::for_testing(),
        None,
        Arc::new(validator),
    );
    let url = start_relay(server).await;

    let mut client = SyncClient::new(Uuid::new_v4(), &url, "bad-token", "Mallory");
    let err = client.connect(None).await.unwrap_err();
    match err {
        ProtocolError::JoinRejected(JoinRefusal::AuthFailed) => {}
        other => panic!("Expected AuthFailed rejection, got {other:?}"),
    }
    assert_eq!(
        client.connection_state().await,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_join_rejected_when_document_missing() {
    let config = ServerConfig {
        create_missing: false,
        ..ServerConfig::for_testing()
    };
    let url = start_relay(RelayServer::new(config)).await;

    let mut client = SyncClient::new(Uuid::new_v4(), &url, "tok", "Alice");
    let err = client.connect(None).await.unwrap_err();
    match err {
        ProtocolError::JoinRejected(JoinRefusal::NotFound) => {}
        other => panic!("Expected NotFound rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delta_fans_out_to_peer() {
    let url = start_default_relay().await;
    let doc_id = Uuid::new_v4();

    let (alice_client, _alice_events, _) = join(&url, doc_id, "Alice").await;
    let (_bob_client, mut bob_events, _) = join(&url, doc_id, "Bob").await;

    let mut alice_doc = GraphDoc::new();
    let node_id = Uuid::new_v4();
    let delta = alice_doc.apply_local(node_op(node_id, "prompt"));
    alice_client.send_delta(&delta).await.unwrap();

    let received = recv_delta(&mut bob_events).await;
    assert_eq!(received, delta);

    let mut bob_doc = GraphDoc::new();
    assert_eq!(
        bob_doc.apply_remote(received).unwrap(),
        RemoteApply::Applied
    );
    assert!(bob_doc.node(&node_id).is_some());
}

#[tokio::test]
async fn test_sender_does_not_receive_own_delta() {
    let url = start_default_relay().await;
    let doc_id = Uuid::new_v4();
    let (alice_client, mut alice_events, _) = join(&url, doc_id, "Alice").await;

    let mut doc = GraphDoc::new();
    let delta = doc.apply_local(node_op(Uuid::new_v4(), "prompt"));
    alice_client.send_delta(&delta).await.unwrap();

    let echoed = timeout(Duration::from_millis(200), alice_events.recv()).await;
    assert!(echoed.is_err(), "Sender must not get its own delta back");
}

#[tokio::test]
async fn test_awareness_fans_out() {
    let url = start_default_relay().await;
    let doc_id = Uuid::new_v4();

    let (alice_client, _alice_events, _) = join(&url, doc_id, "Alice").await;
    let (_bob_client, mut bob_events, _) = join(&url, doc_id, "Bob").await;

    let hello = AwarenessMessage::Heartbeat {
        client_id: alice_client.client_id(),
    };
    alice_client.send_awareness(&hello).await.unwrap();

    match timeout(Duration::from_secs(2), bob_events.recv()).await {
        Ok(Some(SyncEvent::RemoteAwareness { client_id, message })) => {
            assert_eq!(client_id, alice_client.client_id());
            assert_eq!(message, hello);
        }
        other => panic!("Expected RemoteAwareness, got {other:?}"),
    }
}

#[tokio::test]
async fn test_peer_left_notification() {
    let url = start_default_relay().await;
    let doc_id = Uuid::new_v4();

    let (mut alice_client, _alice_events, _) = join(&url, doc_id, "Alice").await;
    let alice_id = alice_client.client_id();
    let (_bob_client, mut bob_events, _) = join(&url, doc_id, "Bob").await;

    alice_client.disconnect().await;

    match timeout(Duration::from_secs(2), bob_events.recv()).await {
        Ok(Some(SyncEvent::PeerLeft(id))) => assert_eq!(id, alice_id),
        other => panic!("Expected PeerLeft, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cold_join_receives_full_document() {
    let url = start_default_relay().await;
    let doc_id = Uuid::new_v4();

    let (alice_client, _alice_events, _) = join(&url, doc_id, "Alice").await;
    let mut alice_doc = GraphDoc::new();
    for kind in ["prompt", "model", "output"] {
        let delta = alice_doc.apply_local(node_op(Uuid::new_v4(), kind));
        alice_client.send_delta(&delta).await.unwrap();
    }
    // Let the relay apply before Bob joins.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_bob_client, _bob_events, missing) = join(&url, doc_id, "Bob").await;
    assert_eq!(missing.len(), 3);

    let mut bob_doc = GraphDoc::new();
    for delta in missing {
        bob_doc.apply_remote(delta).unwrap();
    }
    assert_eq!(bob_doc.graph(), alice_doc.graph());
}

/// Two clients edit concurrently, one drops, the document changes while it
/// is away, and the reconnect resync delivers exactly the missed operations.
#[tokio::test]
async fn test_reconnect_resyncs_missed_deltas() {
    let store = Arc::new(MemorySnapshotStore::new());
    let server = RelayServer::with_store(ServerConfig::for_testing(), store);
    let url = start_relay(server).await;
    let doc_id = Uuid::new_v4();

    let (mut alice_client, mut alice_events, _) = join(&url, doc_id, "Alice").await;
    let (bob_client, mut bob_events, _) = join(&url, doc_id, "Bob").await;

    let mut alice_doc = GraphDoc::new();
    let mut bob_doc = GraphDoc::new();

    // Concurrent adds from both sides.
    let n1 = Uuid::new_v4();
    let n2 = Uuid::new_v4();
    let d1 = alice_doc.apply_local(node_op(n1, "prompt"));
    let d2 = bob_doc.apply_local(node_op(n2, "output"));
    alice_client.send_delta(&d1).await.unwrap();
    bob_client.send_delta(&d2).await.unwrap();

    alice_doc.apply_remote(recv_delta(&mut alice_events).await).unwrap();
    bob_doc.apply_remote(recv_delta(&mut bob_events).await).unwrap();
    assert_eq!(alice_doc.graph(), bob_doc.graph());

    // Alice drops; Bob deletes n1 while she is away.
    alice_client.disconnect().await;
    let d3 = bob_doc.apply_local(GraphOp::DeleteNode(n1));
    bob_client.send_delta(&d3).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Reconnect with the state vector: only the delete should come back.
    alice_client
        .connect(Some(alice_doc.state_vector()))
        .await
        .unwrap();
    let missing = loop {
        match timeout(Duration::from_secs(2), alice_events.recv()).await {
            Ok(Some(SyncEvent::JoinAccepted { missing_deltas, .. })) => break missing_deltas,
            Ok(Some(_)) => continue,
            other => panic!("Expected JoinAccepted, got {other:?}"),
        }
    };

    assert_eq!(missing.len(), 1, "Resync must be op-exact");
    for delta in missing {
        alice_doc.apply_remote(delta).unwrap();
    }
    assert_eq!(alice_doc.graph(), bob_doc.graph());
    assert!(alice_doc.node(&n1).is_none());
    assert!(alice_doc.node(&n2).is_some());
}

#[tokio::test]
async fn test_offline_edits_replay_on_connect() {
    let url = start_default_relay().await;
    let doc_id = Uuid::new_v4();

    let (_bob_client, mut bob_events, _) = join(&url, doc_id, "Bob").await;

    // Alice queues edits before she is connected.
    let mut alice_client = SyncClient::new(doc_id, &url, "tok-Alice", "Alice");
    let mut alice_events = alice_client.take_event_rx().unwrap();
    let mut alice_doc = GraphDoc::new();
    let n1 = Uuid::new_v4();
    let n2 = Uuid::new_v4();
    alice_client
        .send_delta(&alice_doc.apply_local(node_op(n1, "prompt")))
        .await
        .unwrap();
    alice_client
        .send_delta(&alice_doc.apply_local(node_op(n2, "output")))
        .await
        .unwrap();
    assert_eq!(alice_client.offline_queue_len().await, 2);

    alice_client.connect(None).await.unwrap();
    let _ = timeout(Duration::from_secs(2), alice_events.recv()).await; // JoinAccepted
    assert_eq!(alice_client.offline_queue_len().await, 0);

    // Bob sees both replayed edits.
    let mut bob_doc = GraphDoc::new();
    bob_doc.apply_remote(recv_delta(&mut bob_events).await).unwrap();
    bob_doc.apply_remote(recv_delta(&mut bob_events).await).unwrap();
    assert!(bob_doc.node(&n1).is_some());
    assert!(bob_doc.node(&n2).is_some());
}

/// After a reconnect, the ack's state vector lets the sender verify the
/// relay holds everything it sent; anything missing gets retransmitted
/// from the local log.
#[tokio::test]
async fn test_join_ack_advertises_relay_vector() {
    let url = start_default_relay().await;
    let doc_id = Uuid::new_v4();

    let (mut alice_client, mut alice_events, _) = join(&url, doc_id, "Alice").await;
    let mut alice_doc = GraphDoc::new();
    let delta = alice_doc.apply_local(node_op(Uuid::new_v4(), "prompt"));
    alice_client.send_delta(&delta).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice_client.disconnect().await;
    alice_client
        .connect(Some(alice_doc.state_vector()))
        .await
        .unwrap();
    let relay_sv = loop {
        match timeout(Duration::from_secs(2), alice_events.recv()).await {
            Ok(Some(SyncEvent::JoinAccepted { state_vector, .. })) => break state_vector,
            Ok(Some(_)) => continue,
            other => panic!("Expected JoinAccepted, got {other:?}"),
        }
    };

    // The relay integrated her edit; the retransmit check comes back empty.
    assert_eq!(relay_sv.seen(&alice_doc.replica()), 1);
    assert!(alice_doc.deltas_missing_from(&relay_sv).is_empty());
}

#[tokio::test]
async fn test_malformed_flood_disconnects_sender_only() {
    let url = start_default_relay().await;
    let doc_id = Uuid::new_v4();

    let (_alice_client, mut alice_events, _) = join(&url, doc_id, "Alice").await;
    let (_flooder_id, mut ws) = raw_join(&url, doc_id, "Flood").await;

    // Default tolerance is eight malformed frames per connection.
    for _ in 0..8 {
        ws.send(Message::Binary(vec![0xFF; 16].into()))
            .await
            .unwrap();
    }

    let mut closed = false;
    for _ in 0..20 {
        match timeout(Duration::from_millis(500), ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => {
                closed = true;
                break;
            }
            Ok(Some(Ok(_))) => continue,
            Err(_) => break,
        }
    }
    assert!(closed, "Flooding sender must be disconnected");

    // The room keeps serving its well-behaved members.
    let (bob_client, _bob_events, _) = join(&url, doc_id, "Bob").await;
    let mut bob_doc = GraphDoc::new();
    let delta = bob_doc.apply_local(node_op(Uuid::new_v4(), "prompt"));
    bob_client.send_delta(&delta).await.unwrap();
    assert_eq!(recv_delta(&mut alice_events).await, delta);
}

#[tokio::test]
async fn test_frame_for_other_document_is_rejected() {
    let url = start_default_relay().await;
    let doc_a = Uuid::new_v4();
    let doc_b = Uuid::new_v4();

    let (_alice_client, mut alice_events, _) = join(&url, doc_a, "Alice").await;
    let (cross_id, mut ws) = raw_join(&url, doc_a, "Cross").await;

    // A delta addressed to a different document must not reach this room.
    let mut stray_doc = GraphDoc::new();
    let stray = stray_doc.apply_local(node_op(Uuid::new_v4(), "prompt"));
    let frame = SyncMessage::delta(cross_id, doc_b, &stray).unwrap();
    ws.send(Message::Binary(frame.encode().unwrap().into()))
        .await
        .unwrap();

    let mut good_doc = GraphDoc::new();
    let good = good_doc.apply_local(node_op(Uuid::new_v4(), "output"));
    let frame = SyncMessage::delta(cross_id, doc_a, &good).unwrap();
    ws.send(Message::Binary(frame.encode().unwrap().into()))
        .await
        .unwrap();

    // Fan-out is ordered per connection: Alice sees only the in-room delta.
    assert_eq!(recv_delta(&mut alice_events).await, good);

    // And the room's document holds exactly that one operation.
    let (_check_client, _check_events, missing) = join(&url, doc_a, "Check").await;
    assert_eq!(missing.len(), 1);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let url = start_default_relay().await;
    let (alice_client, _alice_events, _) = join(&url, Uuid::new_v4(), "Alice").await;
    let (_carol_client, mut carol_events, _) = join(&url, Uuid::new_v4(), "Carol").await;

    let mut doc = GraphDoc::new();
    let delta = doc.apply_local(node_op(Uuid::new_v4(), "prompt"));
    alice_client.send_delta(&delta).await.unwrap();

    let leaked = timeout(Duration::from_millis(200), carol_events.recv()).await;
    assert!(leaked.is_err(), "Deltas must not cross rooms");
}

#[tokio::test]
async fn test_ping_pong() {
    let url = start_default_relay().await;
    let (client, _events, _) = join(&url, Uuid::new_v4(), "Alice").await;
    client.send_ping().await.unwrap();
}
