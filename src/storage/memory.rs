//! In-memory snapshot store for tests and storage-less relays.
//!
//! Also supports fault injection (`set_fail_saves`) so the relay's
//! retry/degraded behavior can be exercised without a real backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::{SnapshotMetadata, SnapshotStore, StoreError};

#[derive(Default)]
pub struct MemorySnapshotStore {
    inner: Mutex<HashMap<Uuid, (Vec<u8>, SnapshotMetadata)>>,
    fail_saves: AtomicBool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail (fault injection for tests).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Overwrite a stored blob directly, bypassing `save` bookkeeping.
    /// Used to simulate on-disk corruption.
    pub fn inject_raw(&self, doc_id: Uuid, blob: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let meta = SnapshotMetadata::new(doc_id);
        inner.insert(doc_id, (blob, meta));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, (Vec<u8>, SnapshotMetadata)>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().get(&doc_id).map(|(blob, _)| blob.clone()))
    }

    fn save(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<SnapshotMetadata, StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected save failure".into()));
        }

        let mut inner = self.lock();
        let mut meta = inner
            .get(&doc_id)
            .map(|(_, m)| m.clone())
            .unwrap_or_else(|| SnapshotMetadata::new(doc_id));
        meta.record_save(snapshot.len() as u64, snapshot.len() as u64);
        inner.insert(doc_id, (snapshot.to_vec(), meta.clone()));
        Ok(meta)
    }

    fn exists(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.lock().contains_key(&doc_id))
    }

    fn delete(&self, doc_id: Uuid) -> Result<(), StoreError> {
        self.lock().remove(&doc_id);
        Ok(())
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.lock().keys().copied().collect())
    }

    fn metadata(&self, doc_id: Uuid) -> Result<Option<SnapshotMetadata>, StoreError> {
        Ok(self.lock().get(&doc_id).map(|(_, m)| m.clone()))
    }
}
