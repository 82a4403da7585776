//! Thin binding between a canvas UI and the sync machinery.
//!
//! Owns the local `GraphDoc` replica and `PresenceRoom`, translating UI
//! gestures into deltas/awareness frames and remote events back into state
//! the UI re-renders. Everything outbound lands on one unbounded channel
//! so the UI thread never blocks on the network:
//!
//! ```text
//! UI edit ──► CanvasBinding ──► Outgoing channel ──► SyncClient ──► relay
//!                  ▲
//! UI render ◄── listeners ◄── apply_remote_* ◄── SyncEvent stream
//! ```
//!
//! The binding holds no connection state; reconnect policy lives in
//! `SyncClient`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::document::{
    Delta, DocError, EdgeState, GraphDoc, GraphOp, GraphView, NodeState, RemoteApply,
    StateVector, Subscription,
};
use crate::presence::{
    AwarenessEntry, AwarenessMessage, PresenceRoom, PresenceSubscription, Vec2,
    HEARTBEAT_INTERVAL,
};

/// A frame the binding wants sent to the relay.
#[derive(Debug, Clone)]
pub enum Outgoing {
    Delta(Delta),
    Awareness(AwarenessMessage),
}

/// Client-side binding: local replica + presence + outgoing frame queue.
pub struct CanvasBinding {
    doc: GraphDoc,
    presence: PresenceRoom,
    user_id: String,
    display_name: String,
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    outgoing_rx: Option<mpsc::UnboundedReceiver<Outgoing>>,
}

impl CanvasBinding {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let doc = GraphDoc::new();
        let presence = PresenceRoom::new(doc.replica());
        Self::build(doc, presence, user_id, display_name)
    }

    /// Binding with explicit presence timings (cursor throttle and peer
    /// liveness window). Mostly for tests; `new` uses the defaults.
    pub fn with_presence_timing(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        cursor_interval: Duration,
        liveness_timeout: Duration,
    ) -> Self {
        let doc = GraphDoc::new();
        let presence = PresenceRoom::with_timing(doc.replica(), cursor_interval, liveness_timeout);
        Self::build(doc, presence, user_id, display_name)
    }

    fn build(
        doc: GraphDoc,
        presence: PresenceRoom,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        Self {
            doc,
            presence,
            user_id: user_id.into(),
            display_name: display_name.into(),
            outgoing_tx,
            outgoing_rx: Some(outgoing_rx),
        }
    }

    /// Take the outgoing frame receiver (can only be called once). The
    /// transport drains this and ships each frame to the relay.
    pub fn take_outgoing(&mut self) -> Option<mpsc::UnboundedReceiver<Outgoing>> {
        self.outgoing_rx.take()
    }

    fn emit_delta(&mut self, op: GraphOp) -> Delta {
        let delta = self.doc.apply_local(op);
        let _ = self.outgoing_tx.send(Outgoing::Delta(delta.clone()));
        delta
    }

    fn emit_awareness(&self, msg: AwarenessMessage) {
        let _ = self.outgoing_tx.send(Outgoing::Awareness(msg));
    }

    // ─── Local edits ───

    /// Create or fully replace a node.
    pub fn upsert_node(&mut self, node: NodeState) -> Delta {
        self.emit_delta(GraphOp::UpsertNode(node))
    }

    /// Move an existing node. Returns `None` if the node is unknown locally.
    pub fn move_node(&mut self, id: Uuid, x: f64, y: f64) -> Option<Delta> {
        let mut node = self.doc.node(&id)?.clone();
        node.x = x;
        node.y = y;
        Some(self.emit_delta(GraphOp::UpsertNode(node)))
    }

    pub fn delete_node(&mut self, id: Uuid) -> Delta {
        self.emit_delta(GraphOp::DeleteNode(id))
    }

    pub fn upsert_edge(&mut self, edge: EdgeState) -> Delta {
        self.emit_delta(GraphOp::UpsertEdge(edge))
    }

    pub fn delete_edge(&mut self, id: Uuid) -> Delta {
        self.emit_delta(GraphOp::DeleteEdge(id))
    }

    // ─── Local presence ───

    /// Report the local cursor. Emits at most one frame per broadcast
    /// interval; intermediate positions are coalesced.
    pub fn set_cursor(&mut self, position: Vec2) {
        if let Some(msg) = self.presence.update_local_cursor(position) {
            self.emit_awareness(msg);
        }
    }

    pub fn set_selection(&mut self, node_ids: Vec<Uuid>) {
        let msg = self.presence.update_local_selection(node_ids);
        self.emit_awareness(msg);
    }

    /// Announce identity. Call after every (re)join.
    pub fn announce(&self) {
        let msg = self
            .presence
            .hello_message(self.user_id.clone(), self.display_name.clone());
        self.emit_awareness(msg);
    }

    /// Clean-departure notice for the peers.
    pub fn depart(&self) {
        self.emit_awareness(self.presence.leave_message());
    }

    pub fn heartbeat(&self) {
        self.emit_awareness(self.presence.heartbeat_message());
    }

    // ─── Remote events ───

    /// Merge a delta received from the relay.
    pub fn apply_remote_delta(&mut self, delta: Delta) -> Result<RemoteApply, DocError> {
        self.doc.apply_remote(delta)
    }

    /// Retransmit operations the relay has not integrated, per the state
    /// vector it advertised in the join ack. Closes sender-side gaps left
    /// by frames lost on a dead connection (the relay parks everything
    /// after a gap until the missing operation arrives). Call on every
    /// `JoinAccepted`; returns the number of deltas resent.
    pub fn retransmit_missing(&self, relay_sv: &StateVector) -> usize {
        let missing = self.doc.deltas_missing_from(relay_sv);
        let count = missing.len();
        for delta in missing {
            let _ = self.outgoing_tx.send(Outgoing::Delta(delta));
        }
        count
    }

    /// Merge a resync payload (missing deltas from a join ack), in order.
    pub fn apply_resync(&mut self, deltas: Vec<Delta>) -> Result<usize, DocError> {
        let mut applied = 0;
        for delta in deltas {
            if matches!(self.doc.apply_remote(delta)?, RemoteApply::Applied) {
                applied += 1;
            }
        }
        Ok(applied)
    }

    pub fn apply_remote_awareness(&mut self, msg: &AwarenessMessage) {
        self.presence.handle_message(msg);
    }

    /// Handle a relay-reported disconnect for a peer.
    pub fn peer_left(&mut self, client_id: Uuid) {
        self.presence
            .handle_message(&AwarenessMessage::Leave { client_id });
    }

    /// Drop presence entries that stopped heartbeating.
    pub fn prune_stale_peers(&mut self) -> Vec<Uuid> {
        self.presence.prune_stale()
    }

    // ─── Views and subscriptions ───

    pub fn graph(&self) -> GraphView {
        self.doc.graph()
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.state_vector()
    }

    pub fn replica(&self) -> Uuid {
        self.doc.replica()
    }

    pub fn doc(&self) -> &GraphDoc {
        &self.doc
    }

    pub fn peers(&self) -> Vec<AwarenessEntry> {
        self.presence.entries()
    }

    /// Re-render hook: fires with the full graph view after every change.
    pub fn on_graph_change(
        &mut self,
        listener: impl Fn(&GraphView) + Send + 'static,
    ) -> Subscription {
        self.doc.subscribe(listener)
    }

    pub fn on_presence_change(
        &mut self,
        listener: impl Fn(&[AwarenessEntry]) + Send + 'static,
    ) -> PresenceSubscription {
        self.presence.subscribe(listener)
    }
}

/// Periodic presence upkeep at the standard heartbeat cadence: announces
/// liveness and drops peers that stopped refreshing, without the embedder
/// having to drive either by hand.
pub fn spawn_presence_driver(binding: &Arc<Mutex<CanvasBinding>>) -> JoinHandle<()> {
    spawn_presence_driver_at(binding, HEARTBEAT_INTERVAL)
}

/// Presence upkeep on an explicit interval. The task exits when the
/// binding is dropped.
pub fn spawn_presence_driver_at(
    binding: &Arc<Mutex<CanvasBinding>>,
    interval: Duration,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(binding);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            let Some(binding) = weak.upgrade() else { break };
            let mut b = binding.lock().await;
            b.heartbeat();
            let dropped = b.prune_stale_peers();
            if !dropped.is_empty() {
                log::debug!("Pruned {} stale presence entries", dropped.len());
            }
        }
    })
}
