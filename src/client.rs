//! WebSocket client for connecting a canvas replica to the relay.
//!
//! Provides:
//! - Connection lifecycle with the Join handshake and resync payload
//! - Delta send/receive as typed document operations
//! - Awareness (cursor/selection) fan-in
//! - Offline queue with replay, and capped-exponential reconnect backoff
//!
//! The client owns no document state; it shuttles frames between the relay
//! and whatever holds the `GraphDoc` (usually a `CanvasBinding`).
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::document::{Delta, StateVector};
use crate::presence::AwarenessMessage;
use crate::protocol::{
    JoinRequest, JoinResponse, MessageType, ProtocolError, SyncMessage, UserIdentity,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Admission accepted; carries the resync payload, the relay's state
    /// vector and the current peers. The document holder should answer the
    /// vector with any retained deltas the relay lacks (see
    /// `CanvasBinding::retransmit_missing`).
    JoinAccepted {
        missing_deltas: Vec<Delta>,
        state_vector: StateVector,
        peers: Vec<(Uuid, UserIdentity)>,
    },
    /// Received a document delta from a remote replica.
    RemoteDelta { client_id: Uuid, delta: Delta },
    /// Received a presence update from a remote client.
    RemoteAwareness {
        client_id: Uuid,
        message: AwarenessMessage,
    },
    /// A peer disconnected from the room.
    PeerLeft(Uuid),
    /// Connection lost.
    Disconnected,
}

/// Offline queue for edits made while disconnected.
///
/// Queued deltas are replayed in order on reconnection. Bounded: once full,
/// further edits are refused rather than silently dropped.
pub struct OfflineQueue {
    queue: VecDeque<Delta>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a delta for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, delta: Delta) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(delta);
        true
    }

    /// Drain all queued deltas for replay, oldest first.
    pub fn drain(&mut self) -> Vec<Delta> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Capped exponential backoff for reconnection attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Delay before the next attempt: base × 2^attempt, capped.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.attempt += 1;
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(30))
    }
}

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tokio_tungstenite::tungstenite::Message,
>;

/// The sync client.
///
/// Manages one WebSocket connection to the relay: admission handshake,
/// delta and awareness traffic, offline queueing.
pub struct SyncClient {
    client_id: Uuid,
    doc_id: Uuid,
    auth_token: String,
    display_name: String,
    server_url: String,

    state: Arc<RwLock<ConnectionState>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Bumped on every `connect`; a reader task from an older connection
    /// compares against this before touching `state`, so a slow-dying
    /// socket cannot clobber a fresh connection.
    generation: Arc<AtomicU64>,

    /// Channel to the WebSocket writer task.
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    /// Shared with the writer task; kept for the close handshake.
    writer: Option<Arc<Mutex<WsSink>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(
        doc_id: Uuid,
        server_url: impl Into<String>,
        auth_token: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            client_id: Uuid::new_v4(),
            doc_id,
            auth_token: auth_token.into(),
            display_name: display_name.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            generation: Arc::new(AtomicU64::new(0)),
            outgoing_tx: None,
            writer: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and run the Join handshake.
    ///
    /// `state_vector` is `None` for a cold join; pass the document's current
    /// state vector on reconnect so the relay replies with only the missing
    /// deltas. The resync payload arrives as `SyncEvent::JoinAccepted`.
    pub async fn connect(
        &mut self,
        state_vector: Option<StateVector>,
    ) -> Result<(), ProtocolError> {
        // Invalidate any reader task left over from a previous connection.
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(conn) => conn,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                log::debug!("Connect to {} failed: {e}", self.server_url);
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let writer = Arc::new(Mutex::new(ws_writer));
        {
            let writer = writer.clone();
            tokio::spawn(async move {
                while let Some(data) = out_rx.recv().await {
                    use futures_util::SinkExt;
                    let mut w = writer.lock().await;
                    if w.send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        // Admission: Join must be the first frame.
        let request = JoinRequest {
            auth_token: self.auth_token.clone(),
            display_name: self.display_name.clone(),
            state_vector,
        };
        let join = SyncMessage::join(self.client_id, self.doc_id, &request)?;
        if out_tx.send(join.encode()?).await.is_err() {
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(ProtocolError::ConnectionClosed);
        }

        // Wait for the JoinAck before anything else flows.
        let response = match Self::await_join_ack(&mut ws_reader).await {
            Ok(r) => r,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        let (missing_deltas, state_vector, peers) = match response {
            JoinResponse::Accepted {
                missing_deltas,
                state_vector,
                peers,
            } => (missing_deltas, state_vector, peers),
            JoinResponse::Rejected { reason } => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::JoinRejected(reason));
            }
        };

        self.outgoing_tx = Some(out_tx);
        self.writer = Some(writer);
        *self.state.write().await = ConnectionState::Connected;

        log::info!(
            "Joined doc {} ({} missing deltas, {} peers)",
            self.doc_id,
            missing_deltas.len(),
            peers.len()
        );
        let _ = self
            .event_tx
            .send(SyncEvent::JoinAccepted {
                missing_deltas,
                state_vector,
                peers,
            })
            .await;

        self.replay_offline_queue().await?;
        self.spawn_reader(ws_reader, generation);
        Ok(())
    }

    /// Connect with capped-exponential retry on transport failures.
    /// A rejection from the relay is fatal and is not retried.
    pub async fn connect_with_backoff(
        &mut self,
        state_vector: Option<StateVector>,
        backoff: &mut Backoff,
        max_attempts: u32,
    ) -> Result<(), ProtocolError> {
        loop {
            match self.connect(state_vector.clone()).await {
                Ok(()) => {
                    backoff.reset();
                    return Ok(());
                }
                Err(ProtocolError::JoinRejected(reason)) => {
                    return Err(ProtocolError::JoinRejected(reason));
                }
                Err(e) => {
                    if backoff.attempts() + 1 >= max_attempts {
                        return Err(e);
                    }
                    let delay = backoff.next_delay();
                    log::warn!(
                        "Connect to {} failed ({e}); retrying in {delay:?}",
                        self.server_url
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn await_join_ack(
        ws_reader: &mut (impl StreamExt<
            Item = Result<
                tokio_tungstenite::tungstenite::Message,
                tokio_tungstenite::tungstenite::Error,
            >,
        > + Unpin),
    ) -> Result<JoinResponse, ProtocolError> {
        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let frame = tokio::time::timeout_at(deadline, ws_reader.next())
                .await
                .map_err(|_| ProtocolError::Timeout)?;
            match frame {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    let msg = SyncMessage::decode(&bytes)?;
                    if msg.msg_type == MessageType::JoinAck {
                        return msg.join_response();
                    }
                    // Anything before the ack is out of protocol; skip it.
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Err(ProtocolError::ConnectionClosed),
            }
        }
    }

    async fn replay_offline_queue(&self) -> Result<(), ProtocolError> {
        let queued = self.offline_queue.lock().await.drain();
        if queued.is_empty() {
            return Ok(());
        }
        log::info!("Replaying {} queued deltas", queued.len());
        for delta in queued {
            let msg = SyncMessage::delta(self.client_id, self.doc_id, &delta)?;
            self.send_raw(msg.encode()?).await?;
        }
        Ok(())
    }

    fn spawn_reader(
        &self,
        mut ws_reader: impl StreamExt<
                Item = Result<
                    tokio_tungstenite::tungstenite::Message,
                    tokio_tungstenite::tungstenite::Error,
                >,
            > + Unpin
            + Send
            + 'static,
        generation: u64,
    ) {
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let current_generation = self.generation.clone();
        let own_id = self.client_id;

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Undecodable frame from relay: {e}");
                                continue;
                            }
                        };
                        if sync_msg.client_id == own_id {
                            continue;
                        }

                        let event = match sync_msg.msg_type {
                            MessageType::Delta => match sync_msg.delta_payload() {
                                Ok(delta) => Some(SyncEvent::RemoteDelta {
                                    client_id: sync_msg.client_id,
                                    delta,
                                }),
                                Err(e) => {
                                    log::warn!("Malformed remote delta: {e}");
                                    None
                                }
                            },
                            MessageType::Awareness => match sync_msg.awareness_payload() {
                                Ok(message) => Some(SyncEvent::RemoteAwareness {
                                    client_id: sync_msg.client_id,
                                    message,
                                }),
                                Err(e) => {
                                    log::warn!("Malformed remote awareness: {e}");
                                    None
                                }
                            },
                            MessageType::PeerLeft => {
                                Some(SyncEvent::PeerLeft(sync_msg.client_id))
                            }
                            MessageType::Pong => None,
                            other => {
                                log::debug!("Unexpected message type from relay: {other:?}");
                                None
                            }
                        };

                        if let Some(evt) = event {
                            let _ = event_tx.send(evt).await;
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Only the current connection's reader may report the loss;
            // a reconnect has already superseded an older generation.
            if current_generation.load(Ordering::SeqCst) == generation {
                *state.write().await = ConnectionState::Disconnected;
                let _ = event_tx.send(SyncEvent::Disconnected).await;
            }
        });
    }

    async fn send_raw(&self, encoded: Vec<u8>) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Send a document delta to the relay.
    ///
    /// While disconnected the delta is queued for replay on reconnect;
    /// errors only when the offline queue is full.
    pub async fn send_delta(&self, delta: &Delta) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(delta.clone()) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let msg = SyncMessage::delta(self.client_id, self.doc_id, delta)?;
        self.send_raw(msg.encode()?).await
    }

    /// Send a presence update. Silently dropped while offline; stale
    /// presence is worthless after a reconnect.
    pub async fn send_awareness(&self, message: &AwarenessMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let msg = SyncMessage::awareness(self.client_id, self.doc_id, message)?;
        self.send_raw(msg.encode()?).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let msg = SyncMessage::ping(self.client_id);
        self.send_raw(msg.encode()?).await
    }

    /// Close the connection cleanly. Edits made afterwards queue for the
    /// next `connect`.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        if let Some(writer) = self.writer.take() {
            use futures_util::SinkExt;
            let _ = writer.lock().await.close().await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
