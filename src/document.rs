//! Replicated canvas document: conflict-free node/edge maps.
//!
//! Every participant — each client and the relay — holds a `GraphDoc`
//! replica. Local mutations produce a [`Delta`]; remote deltas are merged
//! with [`GraphDoc::apply_remote`]. The merge is:
//!
//! - **Commutative & associative** — per-key last-writer-wins resolved by a
//!   total order over [`OpId`] (Lamport clock, replica id tiebreak), so
//!   delivery order across senders never affects the converged state.
//! - **Idempotent** — each delta carries a per-replica sequence number;
//!   re-applying a delta already covered by the state vector is a no-op.
//!
//! Wall-clock time is never consulted: clocks are not trusted across
//! replicas.
//!
//! ```text
//! apply_local(op) ──► Delta ──► network ──► apply_remote(delta)
//!        │                                        │
//!        └────────► listeners ◄───────────────────┘
//! ```
//!
//! Deltas that arrive ahead of a gap in their sender's sequence are parked
//! in a pending buffer and integrated once the gap closes, which makes the
//! merge tolerant of arbitrary interleaving, not just per-sender FIFO.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// A node on the canvas. `data` is schemaless JSON owned by the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub id: Uuid,
    pub kind: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl NodeState {
    pub fn new(id: Uuid, kind: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id,
            kind: kind.into(),
            x,
            y,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// An edge between two nodes, holding id references only (no object
/// references — keeps the merge a flat per-key map merge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeState {
    pub id: Uuid,
    pub source: Uuid,
    pub target: Uuid,
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EdgeState {
    pub fn new(id: Uuid, source: Uuid, target: Uuid, kind: impl Into<String>) -> Self {
        Self {
            id,
            source,
            target,
            kind: kind.into(),
            data: serde_json::Value::Null,
        }
    }
}

/// Operation identifier: Lamport clock + replica id.
///
/// The derived `Ord` (clock first, replica bytes as tiebreak) is the total
/// order that resolves concurrent same-key writes deterministically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpId {
    pub lamport: u64,
    pub replica: Uuid,
}

/// A single replicated mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphOp {
    UpsertNode(NodeState),
    DeleteNode(Uuid),
    UpsertEdge(EdgeState),
    DeleteEdge(Uuid),
}

impl GraphOp {
    /// The map key this operation targets.
    pub fn target_id(&self) -> Uuid {
        match self {
            GraphOp::UpsertNode(n) => n.id,
            GraphOp::DeleteNode(id) => *id,
            GraphOp::UpsertEdge(e) => e.id,
            GraphOp::DeleteEdge(id) => *id,
        }
    }
}

/// One replicated operation plus the ordering metadata needed to merge it.
///
/// `seq` is a 1-based, contiguous, per-replica sequence number; the set of
/// seqs a replica has seen is summarized by a [`StateVector`].
///
/// Deltas are JSON on the wire: node/edge `data` is schemaless, which a
/// non-self-describing codec cannot round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub id: OpId,
    pub seq: u64,
    pub op: GraphOp,
}

impl Delta {
    pub fn encode(&self) -> Result<Vec<u8>, DocError> {
        serde_json::to_vec(self).map_err(|e| DocError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DocError> {
        serde_json::from_slice(bytes).map_err(|e| DocError::Decode(e.to_string()))
    }
}

/// Compact summary of which operations a replica has already seen:
/// the highest contiguous sequence number per sender.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(pub HashMap<Uuid, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest contiguous seq seen from `replica` (0 = nothing seen).
    pub fn seen(&self, replica: &Uuid) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    /// Whether this vector already covers the given delta.
    pub fn contains(&self, delta: &Delta) -> bool {
        delta.seq <= self.seen(&delta.id.replica)
    }

    fn advance(&mut self, replica: Uuid, seq: u64) {
        let entry = self.0.entry(replica).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }
}

/// Immutable view of the converged node/edge maps, handed to listeners.
///
/// `BTreeMap` so that two converged replicas produce identical iteration
/// order and deep-equality is meaningful.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphView {
    pub nodes: BTreeMap<Uuid, NodeState>,
    pub edges: BTreeMap<Uuid, EdgeState>,
}

/// Outcome of applying a remote delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// Integrated into the replica (listeners were notified).
    Applied,
    /// Already covered by the state vector — no-op.
    Duplicate,
    /// Arrived ahead of a sequence gap; parked until the gap closes.
    Buffered,
}

/// Document errors. Structurally valid deltas never error; these cover
/// malformed input and snapshot codec failures.
#[derive(Debug, Clone)]
pub enum DocError {
    Malformed(String),
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocError::Malformed(e) => write!(f, "Malformed delta: {e}"),
            DocError::Encode(e) => write!(f, "Encode error: {e}"),
            DocError::Decode(e) => write!(f, "Decode error: {e}"),
        }
    }
}

impl std::error::Error for DocError {}

/// Handle returned by [`GraphDoc::subscribe`]; pass to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

type Listener = Box<dyn Fn(&GraphView) + Send>;

/// LWW map entry: current value (None = tombstone) + the winning writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry<T> {
    value: Option<T>,
    writer: OpId,
}

/// Serialized body of a full-document snapshot.
///
/// Includes the delta log so a relay restored from a snapshot can still
/// answer minimal resyncs for reconnecting replicas.
#[derive(Serialize, Deserialize)]
struct SnapshotBody {
    lamport: u64,
    state_vector: StateVector,
    nodes: HashMap<Uuid, Entry<NodeState>>,
    edges: HashMap<Uuid, Entry<EdgeState>>,
    log: Vec<Delta>,
}

/// A replica of the shared canvas document.
pub struct GraphDoc {
    replica: Uuid,
    lamport: u64,
    /// Our own next local sequence number minus one.
    seq: u64,
    nodes: HashMap<Uuid, Entry<NodeState>>,
    edges: HashMap<Uuid, Entry<EdgeState>>,
    state_vector: StateVector,
    /// Every integrated delta, in integration order (per-replica seq order
    /// is preserved). Backs minimal resync.
    log: Vec<Delta>,
    /// Out-of-order deltas, per sender, keyed by seq.
    pending: HashMap<Uuid, BTreeMap<u64, Delta>>,
    listeners: Vec<(u64, Listener)>,
    next_listener: u64,
}

impl GraphDoc {
    /// Create an empty replica with a fresh replica id.
    pub fn new() -> Self {
        Self::with_replica(Uuid::new_v4())
    }

    /// Create an empty replica with an explicit replica id.
    pub fn with_replica(replica: Uuid) -> Self {
        Self {
            replica,
            lamport: 0,
            seq: 0,
            nodes: HashMap::new(),
            edges: HashMap::new(),
            state_vector: StateVector::new(),
            log: Vec::new(),
            pending: HashMap::new(),
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    pub fn replica(&self) -> Uuid {
        self.replica
    }

    pub fn lamport(&self) -> u64 {
        self.lamport
    }

    /// Apply a local mutation, returning the delta to ship to peers.
    ///
    /// Always succeeds and updates the local replica immediately — local
    /// editing never blocks on the network.
    pub fn apply_local(&mut self, op: GraphOp) -> Delta {
        self.lamport += 1;
        self.seq += 1;
        let delta = Delta {
            id: OpId {
                lamport: self.lamport,
                replica: self.replica,
            },
            seq: self.seq,
            op,
        };
        self.integrate(&delta);
        self.notify();
        delta
    }

    /// Merge a remote delta into this replica.
    ///
    /// Idempotent: a delta covered by the state vector is reported as
    /// [`RemoteApply::Duplicate`] and changes nothing. A structurally
    /// invalid delta is rejected without touching any state.
    pub fn apply_remote(&mut self, delta: Delta) -> Result<RemoteApply, DocError> {
        self.validate(&delta)?;

        let seen = self.state_vector.seen(&delta.id.replica);
        if delta.seq <= seen {
            return Ok(RemoteApply::Duplicate);
        }
        if delta.seq > seen + 1 {
            // Gap: park until the missing seqs arrive.
            self.pending
                .entry(delta.id.replica)
                .or_default()
                .insert(delta.seq, delta);
            return Ok(RemoteApply::Buffered);
        }

        let replica = delta.id.replica;
        self.integrate(&delta);
        self.drain_pending(replica);
        self.notify();
        Ok(RemoteApply::Applied)
    }

    fn validate(&self, delta: &Delta) -> Result<(), DocError> {
        if delta.seq == 0 {
            return Err(DocError::Malformed("sequence numbers start at 1".into()));
        }
        if delta.id.lamport == 0 {
            return Err(DocError::Malformed("lamport clock starts at 1".into()));
        }
        if delta.id.replica.is_nil() {
            return Err(DocError::Malformed("nil replica id".into()));
        }
        Ok(())
    }

    /// LWW-integrate one in-order delta. Does not notify.
    fn integrate(&mut self, delta: &Delta) {
        if delta.id.lamport > self.lamport {
            self.lamport = delta.id.lamport;
        }

        match &delta.op {
            GraphOp::UpsertNode(node) => {
                Self::merge_entry(&mut self.nodes, node.id, Some(node.clone()), delta.id)
            }
            GraphOp::DeleteNode(id) => Self::merge_entry(&mut self.nodes, *id, None, delta.id),
            GraphOp::UpsertEdge(edge) => {
                Self::merge_entry(&mut self.edges, edge.id, Some(edge.clone()), delta.id)
            }
            GraphOp::DeleteEdge(id) => Self::merge_entry(&mut self.edges, *id, None, delta.id),
        }

        self.state_vector.advance(delta.id.replica, delta.seq);
        self.log.push(delta.clone());
    }

    fn merge_entry<T>(
        map: &mut HashMap<Uuid, Entry<T>>,
        key: Uuid,
        value: Option<T>,
        writer: OpId,
    ) {
        match map.get_mut(&key) {
            Some(entry) => {
                // Total order over OpId: higher (lamport, replica) wins.
                if writer > entry.writer {
                    entry.value = value;
                    entry.writer = writer;
                }
            }
            None => {
                map.insert(key, Entry { value, writer });
            }
        }
    }

    /// Integrate any buffered deltas from `replica` that are now contiguous.
    fn drain_pending(&mut self, replica: Uuid) {
        loop {
            let next_seq = self.state_vector.seen(&replica) + 1;
            let delta = match self.pending.get_mut(&replica) {
                Some(buf) => match buf.remove(&next_seq) {
                    Some(d) => d,
                    None => break,
                },
                None => break,
            };
            self.integrate(&delta);
        }
        if self
            .pending
            .get(&replica)
            .is_some_and(|buf| buf.is_empty())
        {
            self.pending.remove(&replica);
        }
    }

    // ─── Views & subscriptions ───────────────────────────────────────

    /// Current converged node/edge maps (tombstones excluded).
    pub fn graph(&self) -> GraphView {
        GraphView {
            nodes: self
                .nodes
                .iter()
                .filter_map(|(id, e)| e.value.clone().map(|v| (*id, v)))
                .collect(),
            edges: self
                .edges
                .iter()
                .filter_map(|(id, e)| e.value.clone().map(|v| (*id, v)))
                .collect(),
        }
    }

    pub fn node(&self, id: &Uuid) -> Option<&NodeState> {
        self.nodes.get(id).and_then(|e| e.value.as_ref())
    }

    pub fn edge(&self, id: &Uuid) -> Option<&EdgeState> {
        self.edges.get(id).and_then(|e| e.value.as_ref())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.values().filter(|e| e.value.is_some()).count()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().filter(|e| e.value.is_some()).count()
    }

    /// Register a listener invoked with the full graph after every
    /// successful apply (local or remote). Handlers must be fast and
    /// non-blocking.
    pub fn subscribe(&mut self, listener: impl Fn(&GraphView) + Send + 'static) -> Subscription {
        let id = self.next_listener;
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        Subscription(id)
    }

    pub fn unsubscribe(&mut self, sub: Subscription) {
        self.listeners.retain(|(id, _)| *id != sub.0);
    }

    fn notify(&self) {
        if self.listeners.is_empty() {
            return;
        }
        let view = self.graph();
        for (_, listener) in &self.listeners {
            listener(&view);
        }
    }

    // ─── Resync ──────────────────────────────────────────────────────

    pub fn state_vector(&self) -> StateVector {
        self.state_vector.clone()
    }

    /// The deltas a replica with state vector `remote` is still missing.
    ///
    /// Cost is proportional to drift, not document size: exactly the ops
    /// beyond `remote`, in an order that preserves per-sender sequencing.
    pub fn deltas_missing_from(&self, remote: &StateVector) -> Vec<Delta> {
        self.log
            .iter()
            .filter(|d| !remote.contains(d))
            .cloned()
            .collect()
    }

    /// Drop log entries that every replica summarized by `acknowledged`
    /// has already integrated. Returns the number of entries removed.
    pub fn compact_log(&mut self, acknowledged: &StateVector) -> usize {
        let before = self.log.len();
        self.log.retain(|d| !acknowledged.contains(d));
        before - self.log.len()
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Number of buffered out-of-order deltas.
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(|b| b.len()).sum()
    }

    // ─── Snapshots ───────────────────────────────────────────────────

    /// Serialize the full document state (including tombstones, state
    /// vector and delta log). The encoding is opaque to callers; only
    /// `decode_snapshot` understands it.
    pub fn encode_snapshot(&self) -> Result<Vec<u8>, DocError> {
        let body = SnapshotBody {
            lamport: self.lamport,
            state_vector: self.state_vector.clone(),
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
            log: self.log.clone(),
        };
        serde_json::to_vec(&body).map_err(|e| DocError::Encode(e.to_string()))
    }

    /// Rebuild a replica from a snapshot, assigning it `replica` as its
    /// local identity. The local sequence resumes from whatever the
    /// snapshot recorded for that replica.
    pub fn decode_snapshot(bytes: &[u8], replica: Uuid) -> Result<Self, DocError> {
        let body: SnapshotBody =
            serde_json::from_slice(bytes).map_err(|e| DocError::Decode(e.to_string()))?;
        let seq = body.state_vector.seen(&replica);
        Ok(Self {
            replica,
            lamport: body.lamport,
            seq,
            nodes: body.nodes,
            edges: body.edges,
            state_vector: body.state_vector,
            log: body.log,
            pending: HashMap::new(),
            listeners: Vec::new(),
            next_listener: 0,
        })
    }
}

impl Default for GraphDoc {
    fn default() -> Self {
        Self::new()
    }
}
