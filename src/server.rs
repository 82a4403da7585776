//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── GraphDoc ── BroadcastGroup
//! Client B ──┘        │
//!                     ├── SnapshotStore (RocksDB / memory)
//!                     │
//!          ┌──────────┼───────────┐
//!          ▼          ▼           ▼
//!       Client A   Client B    Client C
//! ```
//!
//! Each room holds the authoritative replica of one document, a broadcast
//! group for fan-out, and a lifecycle phase:
//!
//! ```text
//! (absent) ──first join──► Loading ──snapshot applied──► Active
//!     ▲                                                    │
//!     │                                               last client
//!     └──────grace elapsed────── Idle ◄────────────────leaves
//! ```
//!
//! A room in `Idle` is flushed to the store immediately and unloaded after
//! a grace period; a client joining during the grace reactivates it without
//! a reload. Saves are debounced on the edit path and retried with capped
//! exponential backoff; a room whose saves keep failing keeps serving
//! clients but is flagged degraded.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 5 & 8

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::document::{GraphDoc, RemoteApply, StateVector};
use crate::protocol::{
    JoinRefusal, JoinResponse, MessageType, SyncMessage, UserIdentity,
};
use crate::storage::SnapshotStore;

/// Validates auth tokens at room admission.
///
/// Runs before the first frame is answered; a `None` result refuses the
/// connection without touching any room state.
pub trait TokenValidator: Send + Sync {
    /// Returns the authenticated user id, or `None` to refuse.
    fn validate(&self, token: &str) -> Option<String>;
}

/// Accepts any non-empty token; the token itself becomes the user id.
/// Suitable for development and tests only.
pub struct PermissiveValidator;

impl TokenValidator for PermissiveValidator {
    fn validate(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        }
    }
}

/// Fixed token → user-id table.
#[derive(Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, String>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, user_id: impl Into<String>) {
        self.tokens.insert(token.into(), user_id.into());
    }
}

impl TokenValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// How long a connection may sit without a Join frame before it is dropped
    pub auth_timeout: Duration,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Quiet window before a dirty room is flushed to the store
    pub save_debounce: Duration,
    /// How long an empty room stays resident before it is unloaded
    pub idle_grace: Duration,
    /// Save attempts before a room is marked degraded
    pub save_retry_limit: u32,
    /// First retry delay; doubles per attempt up to `save_retry_cap`
    pub save_retry_base: Duration,
    pub save_retry_cap: Duration,
    /// Malformed frames tolerated per connection before disconnect
    pub malformed_limit: u32,
    /// Create a document on first join instead of refusing with NotFound
    pub create_missing: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            auth_timeout: Duration::from_secs(10),
            broadcast_capacity: 256,
            save_debounce: Duration::from_secs(3),
            idle_grace: Duration::from_secs(60),
            save_retry_limit: 5,
            save_retry_base: Duration::from_millis(500),
            save_retry_cap: Duration::from_secs(10),
            malformed_limit: 8,
            create_missing: true,
        }
    }
}

impl ServerConfig {
    /// Millisecond-scale timings for tests.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            auth_timeout: Duration::from_millis(500),
            save_debounce: Duration::from_millis(20),
            idle_grace: Duration::from_millis(100),
            save_retry_base: Duration::from_millis(5),
            save_retry_cap: Duration::from_millis(20),
            ..Self::default()
        }
    }
}

/// Relay-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_joins: u64,
    pub malformed_frames: u64,
    pub saves_completed: u64,
    pub saves_failed: u64,
    pub active_rooms: usize,
}

/// Room lifecycle phase. The fourth state — unloaded — is the room being
/// absent from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// Snapshot load in progress; joins wait on the room lock.
    Loading,
    /// At least one client connected.
    Active,
    /// No clients; resident until the grace period elapses.
    Idle,
}

/// Point-in-time view of one room for monitoring.
#[derive(Debug, Clone)]
pub struct RoomStatus {
    pub phase: RoomPhase,
    pub client_count: usize,
    /// Persistence is failing for this room; in-memory state is still served.
    pub degraded: bool,
}

struct RoomInner {
    doc: GraphDoc,
    phase: RoomPhase,
    degraded: bool,
    /// Unsaved changes since the last successful flush.
    dirty: bool,
    /// A debounced flush task is already in flight.
    save_scheduled: bool,
    /// Bumped on every phase transition; an idle-unload task only fires if
    /// the epoch it captured is still current.
    epoch: u64,
}

/// One document room: authoritative replica + fan-out group.
struct Room {
    doc_id: Uuid,
    broadcast: BroadcastGroup,
    inner: Mutex<RoomInner>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("doc_id", &self.doc_id)
            .finish_non_exhaustive()
    }
}

impl Room {
    fn new(doc_id: Uuid, broadcast_capacity: usize) -> Self {
        Self {
            doc_id,
            broadcast: BroadcastGroup::new(broadcast_capacity),
            inner: Mutex::new(RoomInner {
                doc: GraphDoc::new(),
                phase: RoomPhase::Loading,
                degraded: false,
                dirty: false,
                save_scheduled: false,
                epoch: 0,
            }),
        }
    }
}

struct Shared {
    config: ServerConfig,
    validator: Arc<dyn TokenValidator>,
    store: Option<Arc<dyn SnapshotStore>>,
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    stats: RwLock<ServerStats>,
}

/// The relay server. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    /// Storage-less relay accepting any non-empty token.
    pub fn new(config: ServerConfig) -> Self {
        Self::build(config, None, Arc::new(PermissiveValidator))
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Relay with durable snapshots.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self::build(config, Some(store), Arc::new(PermissiveValidator))
    }

    pub fn with_validator(
        config: ServerConfig,
        store: Option<Arc<dyn SnapshotStore>>,
        validator: Arc<dyn TokenValidator>,
    ) -> Self {
        Self::build(config, store, validator)
    }

    fn build(
        config: ServerConfig,
        store: Option<Arc<dyn SnapshotStore>>,
        validator: Arc<dyn TokenValidator>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                validator,
                store,
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    /// Warm rooms from every stored snapshot. Recovered rooms start `Idle`
    /// and unload after the grace period if nobody joins.
    pub async fn recover(&self) -> Result<usize, Box<dyn std::error::Error>> {
        let store = match &self.shared.store {
            Some(s) => s.clone(),
            None => return Ok(0),
        };

        let doc_ids = store.list_documents()?;
        let mut recovered = 0;

        for doc_id in &doc_ids {
            let room = Self::room_entry(&self.shared, *doc_id).await;
            let epoch = {
                let mut inner = room.inner.lock().await;
                if inner.phase == RoomPhase::Loading {
                    Self::load_snapshot_locked(&self.shared, *doc_id, &mut inner);
                }
                inner.phase = RoomPhase::Idle;
                inner.epoch += 1;
                inner.epoch
            };
            Self::spawn_idle_unload(&self.shared, &room, epoch);
            recovered += 1;
            log::info!("Recovered document {doc_id} from storage");
        }

        log::info!(
            "Recovery complete: {recovered}/{} documents restored",
            doc_ids.len()
        );
        Ok(recovered)
    }

    /// Bind and serve. Runs the accept loop until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener. Lets tests bind
    /// to port 0 and learn the address before starting the loop.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(shared, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle one WebSocket connection: admission, then the frame loop.
    async fn handle_connection(
        shared: Arc<Shared>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::debug!("WebSocket connection established from {addr}");

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result =
            Self::admit_and_serve(&shared, addr, &mut ws_sender, &mut ws_receiver).await;

        {
            let mut s = shared.stats.write().await;
            s.active_connections -= 1;
        }

        let _ = ws_sender.close().await;
        result
    }

    async fn admit_and_serve(
        shared: &Arc<Shared>,
        addr: SocketAddr,
        ws_sender: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
        ws_receiver: &mut (impl StreamExt<
            Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
        > + Unpin),
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Admission: the first frame must be a Join, within the auth window.
        let first = match tokio::time::timeout(shared.config.auth_timeout, ws_receiver.next())
            .await
        {
            Ok(Some(Ok(Message::Binary(data)))) => data,
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Ok(()),
            Ok(Some(Ok(_))) => {
                log::warn!("Non-binary first frame from {addr}; dropping");
                return Ok(());
            }
            Ok(Some(Err(e))) => return Err(e.into()),
            Err(_) => {
                log::warn!("Admission timeout from {addr}");
                return Ok(());
            }
        };

        let bytes: Vec<u8> = first.into();
        let join_msg = match SyncMessage::decode(&bytes) {
            Ok(m) if m.msg_type == MessageType::Join => m,
            _ => {
                log::warn!("First frame from {addr} was not a Join; dropping");
                shared.stats.write().await.malformed_frames += 1;
                return Ok(());
            }
        };

        let client_id = join_msg.client_id;
        let doc_id = join_msg.doc_id;
        let request = match join_msg.join_request() {
            Ok(r) => r,
            Err(e) => {
                log::warn!("Malformed join from {addr}: {e}");
                shared.stats.write().await.malformed_frames += 1;
                return Ok(());
            }
        };

        // Auth happens before any room state is touched.
        let user_id = match shared.validator.validate(&request.auth_token) {
            Some(uid) => uid,
            None => {
                log::info!("Join refused for {addr}: authentication failed");
                shared.stats.write().await.rejected_joins += 1;
                Self::send_rejection(ws_sender, doc_id, JoinRefusal::AuthFailed).await;
                return Ok(());
            }
        };

        // Admit: compute the resync payload and register the member while
        // holding the room lock, so no concurrent delta falls in the gap
        // between the two. Membership in the registry is re-verified after
        // registration: an idle unload racing the admission leaves the
        // joiner in an orphan replica, which must be abandoned and the
        // lookup retried.
        let identity = UserIdentity {
            user_id,
            display_name: request.display_name.clone(),
        };
        let remote_sv = request.state_vector.unwrap_or_else(StateVector::new);
        let (room, missing_deltas, relay_sv, peers, mut broadcast_rx) = loop {
            let room = match Self::get_or_load_room(shared, doc_id).await {
                Ok(room) => room,
                Err(refusal) => {
                    log::info!("Join refused for {addr}: {refusal}");
                    shared.stats.write().await.rejected_joins += 1;
                    Self::send_rejection(ws_sender, doc_id, refusal).await;
                    return Ok(());
                }
            };

            let (missing, relay_sv, peers, rx) = {
                let mut inner = room.inner.lock().await;
                let missing = inner.doc.deltas_missing_from(&remote_sv);
                let relay_sv = inner.doc.state_vector();
                inner.phase = RoomPhase::Active;
                inner.epoch += 1;
                let peers = room.broadcast.members().await;
                let rx = room.broadcast.add_member(client_id, identity.clone()).await;
                (missing, relay_sv, peers, rx)
            };

            let registered = shared
                .rooms
                .read()
                .await
                .get(&doc_id)
                .map(|r| Arc::ptr_eq(r, &room))
                .unwrap_or(false);
            if registered {
                break (room, missing, relay_sv, peers, rx);
            }
            room.broadcast.remove_member(&client_id).await;
        };

        let ack = SyncMessage::join_ack(
            doc_id,
            &JoinResponse::Accepted {
                missing_deltas,
                state_vector: relay_sv,
                peers,
            },
        )?;
        ws_sender.send(Message::Binary(ack.encode()?.into())).await?;

        {
            let mut s = shared.stats.write().await;
            s.active_rooms = shared.rooms.read().await.len();
        }

        log::info!(
            "Client {} ({}) joined doc {doc_id}",
            identity.display_name,
            client_id
        );

        let serve_result =
            Self::serve_client(shared, &room, client_id, ws_sender, ws_receiver, &mut broadcast_rx)
                .await;

        // Departure: notify peers, then maybe idle the room.
        room.broadcast.remove_member(&client_id).await;
        let leave = SyncMessage::peer_left(client_id, doc_id);
        let _ = room.broadcast.broadcast(&leave);
        log::info!("Client {client_id} left doc {doc_id}");

        if room.broadcast.member_count().await == 0 {
            let epoch = {
                let mut inner = room.inner.lock().await;
                inner.phase = RoomPhase::Idle;
                inner.epoch += 1;
                inner.epoch
            };
            Self::flush_room(shared, &room).await;
            Self::spawn_idle_unload(shared, &room, epoch);
        }

        serve_result
    }

    /// The post-admission frame loop for one client.
    async fn serve_client(
        shared: &Arc<Shared>,
        room: &Arc<Room>,
        client_id: Uuid,
        ws_sender: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
        ws_receiver: &mut (impl StreamExt<
            Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
        > + Unpin),
        broadcast_rx: &mut tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut malformed = 0u32;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = shared.stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let ok = Self::handle_frame(
                                shared, room, client_id, bytes, ws_sender,
                            )
                            .await?;
                            if !ok {
                                malformed += 1;
                                shared.stats.write().await.malformed_frames += 1;
                                if malformed >= shared.config.malformed_limit {
                                    log::warn!(
                                        "Client {client_id} exceeded malformed frame limit; disconnecting"
                                    );
                                    return Ok(());
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::debug!("WebSocket error for client {client_id}: {e}");
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                msg = broadcast_rx.recv() => {
                    match msg {
                        Ok(data) => {
                            // Never echo a sender's own frame back at it.
                            if let Ok(peeked) = SyncMessage::decode(&data) {
                                if peeked.client_id == client_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Client {client_id} lagged by {n} frames");
                        }
                        Err(_) => return Ok(()),
                    }
                }
            }
        }
    }

    /// Process one inbound frame. Returns `false` for a malformed frame.
    async fn handle_frame(
        shared: &Arc<Shared>,
        room: &Arc<Room>,
        client_id: Uuid,
        bytes: Vec<u8>,
        ws_sender: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        let sync_msg = match SyncMessage::decode(&bytes) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Undecodable frame from client {client_id}: {e}");
                return Ok(false);
            }
        };

        // Frames are scoped to the admitted room; ping/pong are
        // connection-level and carry a nil doc id.
        if sync_msg.doc_id != room.doc_id
            && !matches!(sync_msg.msg_type, MessageType::Ping | MessageType::Pong)
        {
            log::warn!(
                "Frame for doc {} from client {client_id} admitted to doc {}",
                sync_msg.doc_id,
                room.doc_id
            );
            return Ok(false);
        }

        match sync_msg.msg_type {
            MessageType::Delta => {
                let delta = match sync_msg.delta_payload() {
                    Ok(d) => d,
                    Err(e) => {
                        log::warn!("Malformed delta from client {client_id}: {e}");
                        return Ok(false);
                    }
                };

                let applied = {
                    let mut inner = room.inner.lock().await;
                    match inner.doc.apply_remote(delta) {
                        Ok(RemoteApply::Applied) | Ok(RemoteApply::Buffered) => {
                            inner.dirty = true;
                            if shared.store.is_some() && !inner.save_scheduled {
                                inner.save_scheduled = true;
                                Self::spawn_debounced_save(shared, room);
                            }
                            true
                        }
                        // Already merged; no need to refan it out.
                        Ok(RemoteApply::Duplicate) => false,
                        Err(e) => {
                            log::warn!("Rejected delta from client {client_id}: {e}");
                            return Ok(false);
                        }
                    }
                };

                if applied {
                    room.broadcast.broadcast_raw(Arc::new(bytes));
                }
                Ok(true)
            }

            MessageType::Awareness => {
                // Relayed verbatim; the relay keeps no presence state.
                if sync_msg.awareness_payload().is_err() {
                    log::warn!("Malformed awareness from client {client_id}");
                    return Ok(false);
                }
                room.broadcast.broadcast_raw(Arc::new(bytes));
                Ok(true)
            }

            MessageType::Ping => {
                let pong = SyncMessage::pong(client_id);
                ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                Ok(true)
            }

            MessageType::Pong => Ok(true),

            other => {
                log::debug!("Unexpected message type {other:?} from client {client_id}");
                Ok(false)
            }
        }
    }

    async fn send_rejection(
        ws_sender: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
        doc_id: Uuid,
        reason: JoinRefusal,
    ) {
        if let Ok(ack) = SyncMessage::join_ack(doc_id, &JoinResponse::Rejected { reason }) {
            if let Ok(encoded) = ack.encode() {
                let _ = ws_sender.send(Message::Binary(encoded.into())).await;
            }
        }
    }

    async fn room_entry(shared: &Arc<Shared>, doc_id: Uuid) -> Arc<Room> {
        if let Some(room) = shared.rooms.read().await.get(&doc_id) {
            return room.clone();
        }
        let mut rooms = shared.rooms.write().await;
        rooms
            .entry(doc_id)
            .or_insert_with(|| Arc::new(Room::new(doc_id, shared.config.broadcast_capacity)))
            .clone()
    }

    /// Look up or create the room, loading its snapshot on first use.
    ///
    /// Always returns the room that is registered for `doc_id`, already
    /// marked `Active`: activation happens under the room lock and registry
    /// membership is re-checked afterwards, so a pending idle-unload can
    /// never hand a joiner an orphan replica while a second room forms for
    /// the same document.
    async fn get_or_load_room(
        shared: &Arc<Shared>,
        doc_id: Uuid,
    ) -> Result<Arc<Room>, JoinRefusal> {
        if shared.rooms.read().await.get(&doc_id).is_none() && !shared.config.create_missing {
            let stored = shared
                .store
                .as_ref()
                .map(|s| s.exists(doc_id).unwrap_or(false))
                .unwrap_or(false);
            if !stored {
                return Err(JoinRefusal::NotFound);
            }
        }

        loop {
            let room = Self::room_entry(shared, doc_id).await;
            {
                let mut inner = room.inner.lock().await;
                if inner.phase == RoomPhase::Loading {
                    Self::load_snapshot_locked(shared, doc_id, &mut inner);
                }
                inner.phase = RoomPhase::Active;
                inner.epoch += 1;
            }
            // The unload timer may have removed this room between lookup
            // and activation; if so, it is a dead replica and the lookup
            // must start over.
            if let Some(current) = shared.rooms.read().await.get(&doc_id) {
                if Arc::ptr_eq(current, &room) {
                    return Ok(room);
                }
            }
        }
    }

    /// Drop room log entries that every replica summarized by `acked` has
    /// seen. Operational hook to bound log growth; returns the number of
    /// dropped entries, or `None` when the room is not resident.
    pub async fn compact_room_log(&self, doc_id: Uuid, acked: &StateVector) -> Option<usize> {
        let room = self.shared.rooms.read().await.get(&doc_id)?.clone();
        let mut inner = room.inner.lock().await;
        let dropped = inner.doc.compact_log(acked);
        log::info!(
            "Compacted log for doc {doc_id}: {dropped} dropped, {} retained",
            inner.doc.log_len()
        );
        Some(dropped)
    }

    /// Apply the stored snapshot to a freshly created room. A corrupt
    /// snapshot is logged and the room starts empty rather than refusing
    /// service.
    fn load_snapshot_locked(shared: &Arc<Shared>, doc_id: Uuid, inner: &mut RoomInner) {
        let store = match &shared.store {
            Some(s) => s,
            None => return,
        };
        match store.load(doc_id) {
            Ok(Some(blob)) => match GraphDoc::decode_snapshot(&blob, Uuid::new_v4()) {
                Ok(doc) => {
                    log::info!(
                        "Loaded snapshot for doc {doc_id} ({} nodes, {} edges)",
                        doc.node_count(),
                        doc.edge_count()
                    );
                    inner.doc = doc;
                }
                Err(e) => {
                    log::error!("Corrupt snapshot for doc {doc_id}: {e}; starting empty");
                }
            },
            Ok(None) => {}
            Err(e) => {
                log::error!("Snapshot load failed for doc {doc_id}: {e}; starting empty");
                inner.degraded = true;
            }
        }
    }

    fn spawn_debounced_save(shared: &Arc<Shared>, room: &Arc<Room>) {
        let shared = shared.clone();
        let room = room.clone();
        tokio::spawn(async move {
            tokio::time::sleep(shared.config.save_debounce).await;
            Self::flush_room(&shared, &room).await;
        });
    }

    /// Flush the room's snapshot to the store if it is dirty. Retries with
    /// capped exponential backoff; persistent failure flags the room
    /// degraded while in-memory service continues.
    async fn flush_room(shared: &Arc<Shared>, room: &Arc<Room>) {
        let store = match &shared.store {
            Some(s) => s.clone(),
            None => return,
        };

        let blob = {
            let mut inner = room.inner.lock().await;
            inner.save_scheduled = false;
            if !inner.dirty {
                return;
            }
            inner.dirty = false;
            match inner.doc.encode_snapshot() {
                Ok(b) => b,
                Err(e) => {
                    log::error!("Snapshot encode failed for doc {}: {e}", room.doc_id);
                    inner.dirty = true;
                    return;
                }
            }
        };

        let mut delay = shared.config.save_retry_base;
        let mut saved = false;
        for attempt in 1..=shared.config.save_retry_limit {
            match store.save(room.doc_id, &blob) {
                Ok(meta) => {
                    log::debug!(
                        "Saved snapshot for doc {} ({} bytes, save #{})",
                        room.doc_id,
                        meta.stored_size,
                        meta.save_count
                    );
                    saved = true;
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "Save attempt {attempt}/{} failed for doc {}: {e}",
                        shared.config.save_retry_limit,
                        room.doc_id
                    );
                    if attempt < shared.config.save_retry_limit {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(shared.config.save_retry_cap);
                    }
                }
            }
        }

        {
            let mut inner = room.inner.lock().await;
            inner.degraded = !saved;
            if !saved {
                // Leave the changes marked unsaved so a later flush retries.
                inner.dirty = true;
            }
        }
        {
            let mut s = shared.stats.write().await;
            if saved {
                s.saves_completed += 1;
            } else {
                s.saves_failed += 1;
                log::error!(
                    "Persistence degraded for doc {}: all save attempts failed",
                    room.doc_id
                );
            }
        }
    }

    /// Unload the room after the grace period, unless it was reactivated
    /// (epoch moved) in the meantime.
    fn spawn_idle_unload(shared: &Arc<Shared>, room: &Arc<Room>, epoch: u64) {
        let shared = shared.clone();
        let room = room.clone();
        tokio::spawn(async move {
            tokio::time::sleep(shared.config.idle_grace).await;
            let mut rooms = shared.rooms.write().await;
            let inner = room.inner.lock().await;
            let still_idle = inner.phase == RoomPhase::Idle && inner.epoch == epoch;
            drop(inner);
            if still_idle && room.broadcast.member_count().await == 0 {
                rooms.remove(&room.doc_id);
                log::info!("Room {} unloaded (idle)", room.doc_id);
            }
        });
    }

    /// Monitoring view of one room, or `None` if it is not resident.
    pub async fn room_status(&self, doc_id: Uuid) -> Option<RoomStatus> {
        let room = self.shared.rooms.read().await.get(&doc_id)?.clone();
        let inner = room.inner.lock().await;
        let phase = inner.phase;
        let degraded = inner.degraded;
        drop(inner);
        Some(RoomStatus {
            phase,
            client_count: room.broadcast.member_count().await,
            degraded,
        })
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn store(&self) -> Option<&Arc<dyn SnapshotStore>> {
        self.shared.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{GraphOp, NodeState};
    use crate::storage::MemorySnapshotStore;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.create_missing);
        assert_eq!(config.malformed_limit, 8);
    }

    #[test]
    fn test_permissive_validator() {
        let v = PermissiveValidator;
        assert_eq!(v.validate("tok"), Some("tok".to_string()));
        assert!(v.validate("").is_none());
    }

    #[test]
    fn test_static_validator() {
        let mut v = StaticTokenValidator::new();
        v.insert("secret-a", "alice");
        assert_eq!(v.validate("secret-a"), Some("alice".to_string()));
        assert!(v.validate("secret-b").is_none());
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.store().is_none());
        assert_eq!(server.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_stats_initial() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.saves_failed, 0);
    }

    #[tokio::test]
    async fn test_recovery_without_store() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recovery_loads_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());
        let doc_id = Uuid::new_v4();

        let mut doc = GraphDoc::new();
        doc.apply_local(GraphOp::UpsertNode(NodeState::new(
            Uuid::new_v4(),
            "prompt",
            1.0,
            2.0,
        )));
        store.save(doc_id, &doc.encode_snapshot().unwrap()).unwrap();

        let server = RelayServer::with_store(ServerConfig::default(), store);
        assert_eq!(server.recover().await.unwrap(), 1);

        let status = server.room_status(doc_id).await.unwrap();
        assert_eq!(status.phase, RoomPhase::Idle);
        assert_eq!(status.client_count, 0);
        assert!(!status.degraded);
    }

    #[tokio::test]
    async fn test_missing_room_refused_when_creation_disabled() {
        let config = ServerConfig {
            create_missing: false,
            ..ServerConfig::default()
        };
        let server = RelayServer::new(config);

        let refusal = RelayServer::get_or_load_room(&server.shared, Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(refusal, JoinRefusal::NotFound);
    }

    #[tokio::test]
    async fn test_room_created_on_demand() {
        let server = RelayServer::with_defaults();
        let doc_id = Uuid::new_v4();

        let room = RelayServer::get_or_load_room(&server.shared, doc_id)
            .await
            .unwrap();
        assert_eq!(room.doc_id, doc_id);
        assert_eq!(server.room_count().await, 1);

        let status = server.room_status(doc_id).await.unwrap();
        assert_eq!(status.phase, RoomPhase::Active);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_starts_empty() {
        let store = Arc::new(MemorySnapshotStore::new());
        let doc_id = Uuid::new_v4();
        store.inject_raw(doc_id, b"not a snapshot".to_vec());

        let server = RelayServer::with_store(ServerConfig::default(), store);
        let room = RelayServer::get_or_load_room(&server.shared, doc_id)
            .await
            .unwrap();

        let inner = room.inner.lock().await;
        assert_eq!(inner.doc.node_count(), 0);
        assert_eq!(inner.phase, RoomPhase::Active);
        assert!(!inner.degraded);
    }

    #[tokio::test]
    async fn test_flush_marks_degraded_on_failure() {
        let store = Arc::new(MemorySnapshotStore::new());
        let config = ServerConfig::for_testing();
        let server = RelayServer::with_store(config, store.clone());
        let doc_id = Uuid::new_v4();

        let room = RelayServer::get_or_load_room(&server.shared, doc_id)
            .await
            .unwrap();
        {
            let mut inner = room.inner.lock().await;
            inner.doc.apply_local(GraphOp::UpsertNode(NodeState::new(
                Uuid::new_v4(),
                "prompt",
                0.0,
                0.0,
            )));
            inner.dirty = true;
        }

        store.set_fail_saves(true);
        RelayServer::flush_room(&server.shared, &room).await;
        assert!(server.room_status(doc_id).await.unwrap().degraded);
        assert_eq!(server.stats().await.saves_failed, 1);

        // A later successful flush clears the flag.
        store.set_fail_saves(false);
        RelayServer::flush_room(&server.shared, &room).await;
        assert!(!server.room_status(doc_id).await.unwrap().degraded);
        assert!(store.exists(doc_id).unwrap());
    }

    #[tokio::test]
    async fn test_idle_unload_after_grace() {
        let server = RelayServer::new(ServerConfig::for_testing());
        let doc_id = Uuid::new_v4();

        let room = RelayServer::get_or_load_room(&server.shared, doc_id)
            .await
            .unwrap();
        let epoch = {
            let mut inner = room.inner.lock().await;
            inner.phase = RoomPhase::Idle;
            inner.epoch += 1;
            inner.epoch
        };
        RelayServer::spawn_idle_unload(&server.shared, &room, epoch);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_idle_unload_cancelled_by_rejoin() {
        let server = RelayServer::new(ServerConfig::for_testing());
        let doc_id = Uuid::new_v4();

        let room = RelayServer::get_or_load_room(&server.shared, doc_id)
            .await
            .unwrap();
        let stale_epoch = {
            let mut inner = room.inner.lock().await;
            inner.phase = RoomPhase::Idle;
            inner.epoch += 1;
            inner.epoch
        };
        RelayServer::spawn_idle_unload(&server.shared, &room, stale_epoch);

        // Reactivation bumps the epoch before the grace elapses.
        {
            let mut inner = room.inner.lock().await;
            inner.phase = RoomPhase::Active;
            inner.epoch += 1;
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_join_during_idle_grace_keeps_room_canonical() {
        let server = RelayServer::new(ServerConfig::for_testing());
        let doc_id = Uuid::new_v4();

        let room = RelayServer::get_or_load_room(&server.shared, doc_id)
            .await
            .unwrap();
        let epoch = {
            let mut inner = room.inner.lock().await;
            inner.phase = RoomPhase::Idle;
            inner.epoch += 1;
            inner.epoch
        };
        RelayServer::spawn_idle_unload(&server.shared, &room, epoch);

        // A joiner resolving the room during the grace must get the
        // registered room back, already reactivated so the pending unload
        // becomes a no-op.
        let rejoined = RelayServer::get_or_load_room(&server.shared, doc_id)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&room, &rejoined));
        assert_eq!(
            server.room_status(doc_id).await.unwrap().phase,
            RoomPhase::Active
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.room_count().await, 1);
        let registered = server.shared.rooms.read().await.get(&doc_id).unwrap().clone();
        assert!(Arc::ptr_eq(&registered, &rejoined));
    }

    #[tokio::test]
    async fn test_join_after_unload_never_serves_orphan_room() {
        let server = RelayServer::new(ServerConfig::for_testing());
        let doc_id = Uuid::new_v4();

        let stale = RelayServer::get_or_load_room(&server.shared, doc_id)
            .await
            .unwrap();
        // The unload timer fires: the room leaves the registry while a
        // would-be joiner still holds its Arc.
        server.shared.rooms.write().await.remove(&doc_id);

        let rejoined = RelayServer::get_or_load_room(&server.shared, doc_id)
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&stale, &rejoined));

        let registered = server.shared.rooms.read().await.get(&doc_id).unwrap().clone();
        assert!(Arc::ptr_eq(&registered, &rejoined));
    }

    #[tokio::test]
    async fn test_compact_room_log() {
        let server = RelayServer::with_defaults();
        let doc_id = Uuid::new_v4();

        let room = RelayServer::get_or_load_room(&server.shared, doc_id)
            .await
            .unwrap();
        let acked = {
            let mut inner = room.inner.lock().await;
            for i in 0..3 {
                inner.doc.apply_local(GraphOp::UpsertNode(NodeState::new(
                    Uuid::new_v4(),
                    "prompt",
                    i as f64,
                    0.0,
                )));
            }
            assert_eq!(inner.doc.log_len(), 3);
            inner.doc.state_vector()
        };

        assert_eq!(server.compact_room_log(doc_id, &acked).await, Some(3));
        assert_eq!(room.inner.lock().await.doc.log_len(), 0);

        // Not resident.
        assert!(server
            .compact_room_log(Uuid::new_v4(), &acked)
            .await
            .is_none());
    }
}
