//! # flowcanvas-collab — Real-time collaborative canvas synchronization
//!
//! Multiplayer editing of node/edge canvas documents over WebSocket, with
//! conflict-free merging, presence, and durable snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌─────────────┐
//! │ CanvasBinding │                    │ RelayServer │
//! │  + SyncClient │ ◄─────────────────►│ (rooms)     │
//! └──────┬────────┘    Binary Proto    └──────┬──────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌─────────────┐
//! │ GraphDoc     │                     │ GraphDoc    │
//! │ (local)      │                     │ (authority) │
//! └──────┬───────┘                     └──────┬──────┘
//!        │                                    │
//! ┌──────┴───────┐               ┌────────────┴───────────┐
//! │ PresenceRoom │               │ BroadcastGroup         │
//! │ (awareness)  │               │ SnapshotStore (RocksDB)│
//! └──────────────┘               └────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`] — Converging node/edge replica (last-writer-wins per key)
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`presence`] — Ephemeral awareness: cursors, selections, liveness
//! - [`broadcast`] — Room-based fan-out with backpressure
//! - [`server`] — Relay with room lifecycle and debounced persistence
//! - [`client`] — WebSocket client with offline queue and backoff
//! - [`binding`] — Thin UI-facing binding over document + presence
//! - [`storage`] — Durable snapshot stores (RocksDB, in-memory)

pub mod binding;
pub mod broadcast;
pub mod client;
pub mod document;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use binding::{spawn_presence_driver, spawn_presence_driver_at, CanvasBinding, Outgoing};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{Backoff, ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use document::{
    Delta, DocError, EdgeState, GraphDoc, GraphOp, GraphView, NodeState, OpId, RemoteApply,
    StateVector,
};
pub use presence::{AwarenessEntry, AwarenessMessage, CursorColor, PresenceRoom, Vec2};
pub use protocol::{
    JoinRefusal, JoinRequest, JoinResponse, MessageType, ProtocolError, SyncMessage, UserIdentity,
};
pub use server::{
    PermissiveValidator, RelayServer, RoomPhase, RoomStatus, ServerConfig, ServerStats,
    StaticTokenValidator, TokenValidator,
};
pub use storage::{
    MemorySnapshotStore, RocksSnapshotStore, SnapshotMetadata, SnapshotStore, StoreConfig,
    StoreError,
};
