//! Ephemeral presence: who is in the room, where their cursor is, what
//! they have selected.
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceRoom::update_local_cursor()
//!       │  (rate-limited: 30fps)
//!       ▼
//! AwarenessMessage::Cursor { … }
//!       │
//!       ▼   (relay fan-out)
//! Remote PresenceRoom::handle_message()
//!       │
//!       ▼
//! subscribers receive the full table
//! ```
//!
//! Awareness is never persisted: the table is rebuilt from scratch on
//! reconnect. Entries that stop refreshing are pruned after 5× the
//! heartbeat interval, which covers crashed tabs that never send a clean
//! Leave.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default presence heartbeat period. Clients refresh at this rate even
/// when idle; liveness timeout is 5× this.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum interval between cursor broadcasts (33ms = 30fps).
pub const CURSOR_BROADCAST_INTERVAL: Duration = Duration::from_millis(33);

/// 2D position in canvas (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Generate a stable, visually distinct color from a client UUID.
    ///
    /// HSL with high saturation; the hue is derived from the UUID so the
    /// same client always renders in the same color everywhere.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self {
            r: 0.26,
            g: 0.52,
            b: 0.96,
            a: 1.0,
        }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Awareness messages sent over the wire (inside `SyncMessage::Awareness`
/// payloads). Each variant is a partial update of one client's entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AwarenessMessage {
    /// Announce identity on (re)connect.
    Hello {
        client_id: Uuid,
        user_id: String,
        display_name: String,
        color: CursorColor,
    },
    /// Clean disconnect.
    Leave { client_id: Uuid },
    /// Cursor moved (high frequency, rate-limited to 30fps).
    Cursor {
        client_id: Uuid,
        position: Vec2,
        /// Monotonic per-sender counter; stale updates are dropped.
        timestamp: u64,
    },
    /// Selection changed (only on change).
    Selection {
        client_id: Uuid,
        node_ids: Vec<Uuid>,
    },
    /// Liveness refresh while otherwise idle.
    Heartbeat { client_id: Uuid },
}

impl AwarenessMessage {
    /// Encode to binary (bincode — no schemaless values in here).
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| e.to_string())
    }

    /// Decode from binary.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(msg)
    }

    /// The sender, from any variant.
    pub fn client_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Hello { client_id, .. } => *client_id,
            AwarenessMessage::Leave { client_id } => *client_id,
            AwarenessMessage::Cursor { client_id, .. } => *client_id,
            AwarenessMessage::Selection { client_id, .. } => *client_id,
            AwarenessMessage::Heartbeat { client_id } => *client_id,
        }
    }
}

/// One connected client's presence, as tracked locally.
#[derive(Debug, Clone)]
pub struct AwarenessEntry {
    pub client_id: Uuid,
    pub user_id: String,
    pub display_name: String,
    pub color: CursorColor,
    /// None until the first cursor update arrives.
    pub cursor: Option<Vec2>,
    pub selection: Vec<Uuid>,
    /// Last time any message arrived from this client.
    pub last_active_at: Instant,
    /// Highest cursor timestamp seen (stale rejection).
    last_cursor_timestamp: u64,
}

impl AwarenessEntry {
    fn new(client_id: Uuid, user_id: String, display_name: String, color: CursorColor) -> Self {
        Self {
            client_id,
            user_id,
            display_name,
            color,
            cursor: None,
            selection: Vec::new(),
            last_active_at: Instant::now(),
            last_cursor_timestamp: 0,
        }
    }

    fn placeholder(client_id: Uuid) -> Self {
        Self::new(
            client_id,
            String::new(),
            format!("Peer-{}", &client_id.to_string()[..8]),
            CursorColor::from_uuid(client_id),
        )
    }

    fn touch(&mut self) {
        self.last_active_at = Instant::now();
    }

    /// Whether this entry has gone stale.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_active_at.elapsed() > timeout
    }
}

/// Handle returned by [`PresenceRoom::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceSubscription(u64);

type PresenceListener = Box<dyn Fn(&[AwarenessEntry]) + Send>;

/// Presence table for one document room.
///
/// Tracks every remote client's entry, rate-limits outgoing cursor
/// updates, and prunes entries that stop refreshing.
pub struct PresenceRoom {
    local_client_id: Uuid,
    entries: HashMap<Uuid, AwarenessEntry>,
    last_cursor_broadcast: Instant,
    cursor_broadcast_interval: Duration,
    local_cursor: Option<Vec2>,
    local_selection: Vec<Uuid>,
    timestamp_counter: u64,
    /// Entries older than this are pruned (5× heartbeat).
    liveness_timeout: Duration,
    listeners: Vec<(u64, PresenceListener)>,
    next_listener: u64,
}

impl PresenceRoom {
    pub fn new(local_client_id: Uuid) -> Self {
        Self {
            local_client_id,
            entries: HashMap::new(),
            // Allow an immediate first broadcast.
            last_cursor_broadcast: Instant::now() - Duration::from_secs(1),
            cursor_broadcast_interval: CURSOR_BROADCAST_INTERVAL,
            local_cursor: None,
            local_selection: Vec::new(),
            timestamp_counter: 0,
            liveness_timeout: HEARTBEAT_INTERVAL * 5,
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    /// Custom intervals for testing.
    pub fn with_timing(
        local_client_id: Uuid,
        cursor_interval: Duration,
        liveness_timeout: Duration,
    ) -> Self {
        let mut room = Self::new(local_client_id);
        room.cursor_broadcast_interval = cursor_interval;
        room.liveness_timeout = liveness_timeout;
        room
    }

    // ─── Incoming ────────────────────────────────────────────────────

    /// Apply a remote awareness message to the table.
    ///
    /// Messages from the local client are ignored (the relay echoes
    /// nothing back, but a lagging broadcast channel might).
    pub fn handle_message(&mut self, msg: &AwarenessMessage) {
        if msg.client_id() == self.local_client_id {
            return;
        }

        match msg {
            AwarenessMessage::Hello {
                client_id,
                user_id,
                display_name,
                color,
            } => {
                let entry = AwarenessEntry::new(
                    *client_id,
                    user_id.clone(),
                    display_name.clone(),
                    *color,
                );
                self.entries.insert(*client_id, entry);
            }
            AwarenessMessage::Leave { client_id } => {
                self.entries.remove(client_id);
            }
            AwarenessMessage::Cursor {
                client_id,
                position,
                timestamp,
            } => {
                // A cursor from an unseen client means their Hello raced
                // past us — keep a placeholder until it arrives.
                let entry = self
                    .entries
                    .entry(*client_id)
                    .or_insert_with(|| AwarenessEntry::placeholder(*client_id));
                if *timestamp >= entry.last_cursor_timestamp {
                    entry.cursor = Some(*position);
                    entry.last_cursor_timestamp = *timestamp;
                }
                entry.touch();
            }
            AwarenessMessage::Selection {
                client_id,
                node_ids,
            } => {
                let entry = self
                    .entries
                    .entry(*client_id)
                    .or_insert_with(|| AwarenessEntry::placeholder(*client_id));
                entry.selection = node_ids.clone();
                entry.touch();
            }
            AwarenessMessage::Heartbeat { client_id } => {
                if let Some(entry) = self.entries.get_mut(client_id) {
                    entry.touch();
                }
            }
        }

        if let Some(entry) = self.entries.get_mut(&msg.client_id()) {
            entry.touch();
        }
        self.notify();
    }

    // ─── Outgoing ────────────────────────────────────────────────────

    /// Record a local cursor move; returns a message if it should be
    /// broadcast now (None = throttled).
    pub fn update_local_cursor(&mut self, position: Vec2) -> Option<AwarenessMessage> {
        self.local_cursor = Some(position);

        if self.last_cursor_broadcast.elapsed() < self.cursor_broadcast_interval {
            return None;
        }

        self.timestamp_counter += 1;
        self.last_cursor_broadcast = Instant::now();
        Some(AwarenessMessage::Cursor {
            client_id: self.local_client_id,
            position,
            timestamp: self.timestamp_counter,
        })
    }

    /// Record a local selection change; always broadcast.
    pub fn update_local_selection(&mut self, node_ids: Vec<Uuid>) -> AwarenessMessage {
        self.local_selection = node_ids.clone();
        AwarenessMessage::Selection {
            client_id: self.local_client_id,
            node_ids,
        }
    }

    pub fn hello_message(
        &self,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> AwarenessMessage {
        AwarenessMessage::Hello {
            client_id: self.local_client_id,
            user_id: user_id.into(),
            display_name: display_name.into(),
            color: CursorColor::from_uuid(self.local_client_id),
        }
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            client_id: self.local_client_id,
        }
    }

    pub fn heartbeat_message(&self) -> AwarenessMessage {
        AwarenessMessage::Heartbeat {
            client_id: self.local_client_id,
        }
    }

    // ─── Table access ────────────────────────────────────────────────

    /// Current table of remote entries.
    pub fn entries(&self) -> Vec<AwarenessEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn entry(&self, client_id: &Uuid) -> Option<&AwarenessEntry> {
        self.entries.get(client_id)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn local_client_id(&self) -> Uuid {
        self.local_client_id
    }

    pub fn local_cursor(&self) -> Option<Vec2> {
        self.local_cursor
    }

    pub fn local_selection(&self) -> &[Uuid] {
        &self.local_selection
    }

    /// Register a listener receiving the full table after every change.
    pub fn subscribe(
        &mut self,
        listener: impl Fn(&[AwarenessEntry]) + Send + 'static,
    ) -> PresenceSubscription {
        let id = self.next_listener;
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        PresenceSubscription(id)
    }

    pub fn unsubscribe(&mut self, sub: PresenceSubscription) {
        self.listeners.retain(|(id, _)| *id != sub.0);
    }

    fn notify(&self) {
        if self.listeners.is_empty() {
            return;
        }
        let table = self.entries();
        for (_, listener) in &self.listeners {
            listener(&table);
        }
    }

    /// Remove entries not refreshed within the liveness timeout.
    ///
    /// Handles crashed tabs that never sent a Leave. Returns the pruned
    /// client ids.
    pub fn prune_stale(&mut self) -> Vec<Uuid> {
        let timeout = self.liveness_timeout;
        let stale: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_stale(timeout))
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.entries.remove(id);
        }
        if !stale.is_empty() {
            log::debug!("Pruned {} stale presence entries", stale.len());
            self.notify();
        }
        stale
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }
}
