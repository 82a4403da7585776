//! Durable snapshot storage for canvas documents.
//!
//! ```text
//! ┌─────────────┐   save/load    ┌────────────────────┐
//! │ RelayServer │ ─────────────► │ SnapshotStore       │
//! │ (in-memory) │                │  ├ RocksSnapshot-   │
//! └─────────────┘                │  │   Store (LZ4)    │
//!                                │  └ MemorySnapshot-  │
//!                                │      Store (tests)  │
//!                                └────────────────────┘
//! ```
//!
//! The snapshot is an opaque blob from the store's point of view; only the
//! document layer knows how to encode/decode it. Snapshots are replaced
//! wholesale, never patched in place — the store is the single source of
//! truth across relay restarts, accessed only through `load`/`save`.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

pub use memory::MemorySnapshotStore;
pub use rocks::{RocksSnapshotStore, StoreConfig};

/// Metadata kept alongside each snapshot blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub doc_id: Uuid,
    /// Uncompressed snapshot size in bytes.
    pub snapshot_size: u64,
    /// Stored (possibly compressed) size in bytes.
    pub stored_size: u64,
    /// Number of saves performed for this document.
    pub save_count: u64,
    /// Creation timestamp (seconds since epoch).
    pub created_at: u64,
    /// Last save timestamp (seconds since epoch).
    pub updated_at: u64,
}

impl SnapshotMetadata {
    pub(crate) fn new(doc_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            doc_id,
            snapshot_size: 0,
            stored_size: 0,
            save_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn record_save(&mut self, snapshot_size: u64, stored_size: u64) {
        self.snapshot_size = snapshot_size;
        self.stored_size = stored_size;
        self.save_count += 1;
        self.updated_at = unix_now();
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure (database, I/O).
    Backend(String),
    /// Stored blob failed to decompress or decode.
    Corrupt(String),
    /// Serialization of metadata failed.
    Serialization(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Backend(e) => write!(f, "Storage backend error: {e}"),
            StoreError::Corrupt(e) => write!(f, "Corrupt snapshot: {e}"),
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Durable load/save of document snapshots, decoupled from the edit hot
/// path. The relay is the only caller; per-edit latency never waits on
/// this interface.
pub trait SnapshotStore: Send + Sync {
    /// Load the snapshot blob for a document, or `None` if absent.
    fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the stored snapshot for a document.
    fn save(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<SnapshotMetadata, StoreError>;

    fn exists(&self, doc_id: Uuid) -> Result<bool, StoreError>;

    /// Remove the snapshot and its metadata.
    fn delete(&self, doc_id: Uuid) -> Result<(), StoreError>;

    /// Every document id with a stored snapshot.
    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError>;

    fn metadata(&self, doc_id: Uuid) -> Result<Option<SnapshotMetadata>, StoreError>;
}
