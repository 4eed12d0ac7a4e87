//! Presence: who is online, their colors, and where their cursor is.
//!
//! Presence never touches the shared document. Each connection owns exactly
//! one [`PresenceRecord`] and is the only writer of it; other peers hold a
//! copy that disappears when the connection does.
//!
//! ```text
//! announce / update_field
//!       │  (position + viewport throttled to one emission per 150 ms,
//!       │   trailing value flushed when the window reopens)
//!       ▼
//! AwarenessMessage::{Announce, Patch, Leave}
//!       │
//!       ▼   (relay fan-out, SyncMessage::Awareness)
//! remote PresenceManager::handle_remote
//!       │
//!       ▼
//! observe_all() ── watch::Receiver<HashMap<connection id, PresenceRecord>>
//! ```

use lobby_core::{Player, PlayerColor, PlayerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

use crate::protocol::ProtocolError;

/// Minimum spacing between two position (or viewport) emissions.
pub const PRESENCE_THROTTLE: Duration = Duration::from_millis(150);

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Raw pointer position in the sender's viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportSize {
    pub width: f32,
    pub height: f32,
}

impl ViewportSize {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// Translate a remote raw position into local coordinates, scaling each
/// axis by `local / remote`. Degenerate remote viewports leave the
/// position unchanged.
pub fn scale_to_viewport(position: Vec2, remote: ViewportSize, local: ViewportSize) -> Vec2 {
    let scale = |value: f32, local: f32, remote: f32| {
        if remote > 0.0 {
            value * local / remote
        } else {
            value
        }
    };
    Vec2 {
        x: scale(position.x, local.width, remote.width),
        y: scale(position.y, local.height, remote.height),
    }
}

/// Presence of one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// Connection that owns the record.
    pub peer_id: Uuid,
    /// Player behind the connection.
    pub id: PlayerId,
    pub username: String,
    pub color: PlayerColor,
    /// Index of the lobby element under the pointer.
    pub element_index: Option<u32>,
    pub position: Option<Vec2>,
    pub viewport_size: Option<ViewportSize>,
}

impl PresenceRecord {
    pub fn for_player(peer_id: Uuid, player: &Player) -> Self {
        Self {
            peer_id,
            id: player.id.clone(),
            username: player.username.clone(),
            color: player.color,
            element_index: None,
            position: None,
            viewport_size: None,
        }
    }

    fn apply(&mut self, field: &PresenceField) {
        match field {
            PresenceField::Username(name) => self.username = name.clone(),
            PresenceField::Color(color) => self.color = *color,
            PresenceField::ElementIndex(index) => self.element_index = *index,
            PresenceField::Position(position) => self.position = *position,
            PresenceField::ViewportSize(size) => self.viewport_size = *size,
        }
    }
}

/// One mutable field of a [`PresenceRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceField {
    Username(String),
    Color(PlayerColor),
    ElementIndex(Option<u32>),
    Position(Option<Vec2>),
    ViewportSize(Option<ViewportSize>),
}

impl PresenceField {
    /// Pointer-driven fields, subject to the throttle.
    pub fn is_high_frequency(&self) -> bool {
        matches!(self, PresenceField::Position(_) | PresenceField::ViewportSize(_))
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire protocol messages
// ───────────────────────────────────────────────────────────────────

/// Presence packets, carried inside `SyncMessage::Awareness` payloads.
///
/// `clock` is the sender's presence counter; receivers drop patches older
/// than what they already hold for that peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full replacement of the sender's record.
    Announce { record: PresenceRecord, clock: u64 },
    /// Single-field update.
    Patch {
        peer_id: Uuid,
        clock: u64,
        field: PresenceField,
    },
    /// Clean departure.
    Leave { peer_id: Uuid },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Connection that sent the message.
    pub fn peer_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Announce { record, .. } => record.peer_id,
            AwarenessMessage::Patch { peer_id, .. } => *peer_id,
            AwarenessMessage::Leave { peer_id } => *peer_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Throttle
// ───────────────────────────────────────────────────────────────────

/// Leading-edge rate limiter with a trailing flush.
///
/// The first value in a window is emitted immediately; later values in the
/// same window overwrite each other and the last one is emitted by
/// [`Throttle::flush`] once the window has passed.
#[derive(Debug, Clone)]
pub struct Throttle<T> {
    interval: Duration,
    last_emit: Option<Instant>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            pending: None,
        }
    }

    fn window_open(&self, now: Instant) -> bool {
        self.last_emit
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval)
    }

    /// Offer a value; returns it if it may be emitted now.
    pub fn offer(&mut self, value: T, now: Instant) -> Option<T> {
        if self.window_open(now) {
            self.last_emit = Some(now);
            self.pending = None;
            Some(value)
        } else {
            self.pending = Some(value);
            None
        }
    }

    /// Emit the trailing value if its window has passed.
    pub fn flush(&mut self, now: Instant) -> Option<T> {
        if self.pending.is_some() && self.window_open(now) {
            self.last_emit = Some(now);
            self.pending.take()
        } else {
            None
        }
    }

    /// When the pending value becomes emittable.
    pub fn deadline(&self) -> Option<Instant> {
        match (&self.pending, self.last_emit) {
            (Some(_), Some(last)) => Some(last + self.interval),
            (Some(_), None) => Some(Instant::now()),
            _ => None,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop the pending value and reopen the window.
    pub fn reset(&mut self) {
        self.pending = None;
        self.last_emit = None;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence manager
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RemotePresence {
    record: PresenceRecord,
    clock: u64,
}

/// Local presence plus the live view of every remote connection.
pub struct PresenceManager {
    local_peer: Uuid,
    local: Option<PresenceRecord>,
    clock: u64,
    peers: HashMap<Uuid, RemotePresence>,
    position_throttle: Throttle<Option<Vec2>>,
    viewport_throttle: Throttle<Option<ViewportSize>>,
    states_tx: watch::Sender<HashMap<Uuid, PresenceRecord>>,
}

impl PresenceManager {
    pub fn new(local_peer: Uuid) -> Self {
        Self::with_interval(local_peer, PRESENCE_THROTTLE)
    }

    /// Create with a custom throttle interval.
    pub fn with_interval(local_peer: Uuid, interval: Duration) -> Self {
        let (states_tx, _) = watch::channel(HashMap::new());
        Self {
            local_peer,
            local: None,
            clock: 0,
            peers: HashMap::new(),
            position_throttle: Throttle::new(interval),
            viewport_throttle: Throttle::new(interval),
            states_tx,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Replace the local record entirely.
    pub fn announce(&mut self, mut record: PresenceRecord) -> AwarenessMessage {
        record.peer_id = self.local_peer;
        self.local = Some(record.clone());
        self.position_throttle.reset();
        self.viewport_throttle.reset();
        AwarenessMessage::Announce {
            record,
            clock: self.tick(),
        }
    }

    /// Announce the current local record again, e.g. for a newcomer.
    pub fn reannounce(&mut self) -> Option<AwarenessMessage> {
        let record = self.local.clone()?;
        Some(AwarenessMessage::Announce {
            record,
            clock: self.tick(),
        })
    }

    /// Update one local field. Pointer fields go through the throttle and
    /// may return `None` until [`PresenceManager::flush`] emits them.
    pub fn update_field(&mut self, field: PresenceField, now: Instant) -> Option<AwarenessMessage> {
        let Some(local) = self.local.as_mut() else {
            log::warn!("Presence field update before announce: {field:?}");
            return None;
        };
        local.apply(&field);

        let field = match field {
            PresenceField::Position(position) => {
                PresenceField::Position(self.position_throttle.offer(position, now)?)
            }
            PresenceField::ViewportSize(size) => {
                PresenceField::ViewportSize(self.viewport_throttle.offer(size, now)?)
            }
            other => other,
        };
        Some(self.patch(field))
    }

    fn patch(&mut self, field: PresenceField) -> AwarenessMessage {
        AwarenessMessage::Patch {
            peer_id: self.local_peer,
            clock: self.tick(),
            field,
        }
    }

    /// Emit trailing throttled values whose window has reopened.
    pub fn flush(&mut self, now: Instant) -> Vec<AwarenessMessage> {
        let mut out = Vec::new();
        if let Some(position) = self.position_throttle.flush(now) {
            out.push(self.patch(PresenceField::Position(position)));
        }
        if let Some(size) = self.viewport_throttle.flush(now) {
            out.push(self.patch(PresenceField::ViewportSize(size)));
        }
        out
    }

    /// Earliest instant at which [`PresenceManager::flush`] has work.
    pub fn next_flush(&self) -> Option<Instant> {
        [self.position_throttle.deadline(), self.viewport_throttle.deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Leave message for a clean departure. Clears the local record.
    pub fn leave(&mut self) -> AwarenessMessage {
        self.local = None;
        AwarenessMessage::Leave {
            peer_id: self.local_peer,
        }
    }

    /// Merge a packet received from connection `sender`.
    ///
    /// Returns `true` if the remote view changed.
    pub fn handle_remote(&mut self, sender: Uuid, msg: &AwarenessMessage) -> bool {
        if sender == self.local_peer || msg.peer_id() == self.local_peer {
            return false;
        }
        if msg.peer_id() != sender {
            log::warn!("Presence for {} relayed by {sender}, ignored", msg.peer_id());
            return false;
        }

        let changed = match msg {
            AwarenessMessage::Announce { record, clock } => match self.peers.get(&sender) {
                Some(known) if known.clock > *clock => false,
                _ => {
                    log::debug!("Presence: {} ({}) announced", record.username, sender);
                    self.peers.insert(
                        sender,
                        RemotePresence {
                            record: record.clone(),
                            clock: *clock,
                        },
                    );
                    true
                }
            },
            AwarenessMessage::Patch { clock, field, .. } => match self.peers.get_mut(&sender) {
                Some(known) if *clock > known.clock => {
                    log::trace!("Presence: {sender} patched {field:?}");
                    known.record.apply(field);
                    known.clock = *clock;
                    true
                }
                Some(_) => false,
                None => {
                    log::debug!("Presence patch from unannounced peer {sender}");
                    false
                }
            },
            AwarenessMessage::Leave { .. } => self.peers.remove(&sender).is_some(),
        };

        if changed {
            self.publish();
        }
        changed
    }

    /// Forget a connection, e.g. on `PeerLeft`.
    pub fn remove_peer(&mut self, peer_id: &Uuid) -> bool {
        let removed = self.peers.remove(peer_id).is_some();
        if removed {
            log::debug!("Presence: {peer_id} left");
            self.publish();
        }
        removed
    }

    /// Drop every remote record, e.g. when the local connection is lost.
    pub fn clear_remote(&mut self) {
        if !self.peers.is_empty() {
            self.peers.clear();
            self.publish();
        }
    }

    fn publish(&self) {
        self.states_tx.send_replace(self.states());
    }

    /// Live map from connection id to presence record.
    pub fn observe_all(&self) -> watch::Receiver<HashMap<Uuid, PresenceRecord>> {
        self.states_tx.subscribe()
    }

    /// Snapshot of remote records.
    pub fn states(&self) -> HashMap<Uuid, PresenceRecord> {
        self.peers
            .iter()
            .map(|(id, p)| (*id, p.record.clone()))
            .collect()
    }

    pub fn peer(&self, peer_id: &Uuid) -> Option<&PresenceRecord> {
        self.peers.get(peer_id).map(|p| &p.record)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Colors of remote peers focused on lobby element `index`.
    pub fn peers_at_element(&self, index: u32) -> Vec<PlayerColor> {
        let mut at: Vec<&PresenceRecord> = self
            .peers
            .values()
            .map(|p| &p.record)
            .filter(|r| r.element_index == Some(index))
            .collect();
        at.sort_by(|a, b| a.id.cmp(&b.id));
        at.into_iter().map(|r| r.color).collect()
    }

    /// Remote cursors translated into the local viewport. Peers without a
    /// position are skipped; peers without a viewport are not scaled.
    pub fn remote_cursors(&self, local_viewport: ViewportSize) -> Vec<(Uuid, PlayerColor, Vec2)> {
        self.peers
            .iter()
            .filter_map(|(id, p)| {
                let position = p.record.position?;
                let position = match p.record.viewport_size {
                    Some(remote) => scale_to_viewport(position, remote, local_viewport),
                    None => position,
                };
                Some((*id, p.record.color, position))
            })
            .collect()
    }

    pub fn local(&self) -> Option<&PresenceRecord> {
        self.local.as_ref()
    }

    pub fn local_peer(&self) -> Uuid {
        self.local_peer
    }
}
