//! Fan-out of accepted frames to the other connections in a room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! connection gets an independent receiver buffering up to `capacity`
//! frames; a lagging receiver drops oldest frames (backpressure) rather
//! than stalling the room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage, UserIdentity};

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub active_members: usize,
}

/// Lock-free counters so the send path never takes a lock.
struct AtomicStats {
    frames_sent: AtomicU64,
}

/// Fan-out group for one document room.
///
/// Every connection in the room shares one broadcast channel; senders are
/// responsible for skipping their own frames on receive.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Connected members with their admitted identities.
    members: Arc<RwLock<HashMap<Uuid, UserIdentity>>>,
    capacity: usize,
    stats: Arc<AtomicStats>,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames a member can buffer before it
    /// starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stats: Arc::new(AtomicStats {
                frames_sent: AtomicU64::new(0),
            }),
        }
    }

    /// Admit a member; returns its receiver.
    pub async fn add_member(
        &self,
        client_id: Uuid,
        identity: UserIdentity,
    ) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut members = self.members.write().await;
        members.insert(client_id, identity);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, client_id: &Uuid) -> Option<UserIdentity> {
        let mut members = self.members.write().await;
        members.remove(client_id)
    }

    /// Broadcast a message to every member (including the sender, whose
    /// receive loop filters its own frames).
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes (zero-copy fast path). Fully lock-free.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<(Uuid, UserIdentity)> {
        self.members
            .read()
            .await
            .iter()
            .map(|(id, ident)| (*id, ident.clone()))
            .collect()
    }

    pub async fn has_member(&self, client_id: &Uuid) -> bool {
        self.members.read().await.contains_key(client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> UserIdentity {
        UserIdentity {
            user_id: format!("user-{name}"),
            display_name: name.into(),
        }
    }

    #[tokio::test]
    async fn test_add_remove_member() {
        let group = BroadcastGroup::new(16);
        let id = Uuid::new_v4();

        let _rx = group.add_member(id, identity("Alice")).await;
        assert_eq!(group.member_count().await, 1);
        assert!(group.has_member(&id).await);

        let removed = group.remove_member(&id).await;
        assert_eq!(removed.unwrap().display_name, "Alice");
        assert_eq!(group.member_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_all_receivers() {
        let group = BroadcastGroup::new(16);

        let mut rx1 = group.add_member(Uuid::new_v4(), identity("Alice")).await;
        let mut rx2 = group.add_member(Uuid::new_v4(), identity("Bob")).await;
        let mut rx3 = group.add_member(Uuid::new_v4(), identity("Carol")).await;

        let msg = SyncMessage::ping(Uuid::new_v4());
        let count = group.broadcast(&msg).unwrap();
        assert_eq!(count, 3);

        rx1.recv().await.unwrap();
        rx2.recv().await.unwrap();
        rx3.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_raw_zero_copy() {
        let group = BroadcastGroup::new(16);
        let mut rx = group.add_member(Uuid::new_v4(), identity("Alice")).await;

        let data = Arc::new(vec![10, 20, 30]);
        assert_eq!(group.broadcast_raw(data), 1);
        assert_eq!(*rx.recv().await.unwrap(), vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_stats_counters() {
        let group = BroadcastGroup::new(16);
        let _rx = group.add_member(Uuid::new_v4(), identity("Alice")).await;

        let msg = SyncMessage::ping(Uuid::new_v4());
        group.broadcast(&msg).unwrap();
        group.broadcast(&msg).unwrap();

        let stats = group.stats().await;
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.active_members, 1);
    }

    #[tokio::test]
    async fn test_member_list() {
        let group = BroadcastGroup::new(16);
        let _rx1 = group.add_member(Uuid::new_v4(), identity("Alice")).await;
        let _rx2 = group.add_member(Uuid::new_v4(), identity("Bob")).await;

        let members = group.members().await;
        let names: Vec<&str> = members
            .iter()
            .map(|(_, i)| i.display_name.as_str())
            .collect();
        assert_eq!(members.len(), 2);
        assert!(names.contains(&"Alice"));
        assert!(names.contains(&"Bob"));
    }
}
