//! Rooms of the relay and the fan-out of their traffic.
//!
//! One tokio broadcast channel per room; each connection holds its own
//! receiver buffering up to `capacity` encoded messages. Receivers that fall
//! further behind lose the oldest messages; the relay then resends them the
//! full room state.

use lobby_core::LobbyError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters behind [`BroadcastStats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Tells apart sockets registered under the same peer id.
pub type ConnectionId = u64;

/// A registered connection: its ticket and its receiver.
pub struct Subscription {
    pub connection: ConnectionId,
    pub receiver: broadcast::Receiver<Arc<Vec<u8>>>,
}

struct Member {
    info: PeerInfo,
    connection: ConnectionId,
}

/// The connections of one room and their shared channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, Member>>,
    next_connection: AtomicU64,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is the per-receiver buffer before lagging receivers drop
    /// messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a connection.
    pub async fn add_peer(&self, info: PeerInfo) -> Subscription {
        let mut peers = self.peers.write().await;
        self.register(&mut peers, info)
    }

    /// Register a connection unless the room already holds `max` peers.
    ///
    /// A peer id that is already registered takes over its slot: the newer
    /// connection owns the membership from then on.
    pub async fn try_add_peer(&self, info: PeerInfo, max: usize) -> Option<Subscription> {
        let mut peers = self.peers.write().await;
        if peers.len() >= max && !peers.contains_key(&info.peer_id) {
            return None;
        }
        Some(self.register(&mut peers, info))
    }

    fn register(&self, peers: &mut HashMap<Uuid, Member>, info: PeerInfo) -> Subscription {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        if let Some(previous) = peers.insert(info.peer_id, Member { info, connection }) {
            log::debug!(
                "Peer {} rebound from connection {} to {connection}",
                previous.info.peer_id,
                previous.connection
            );
        }
        Subscription {
            connection,
            receiver: self.sender.subscribe(),
        }
    }

    /// Unregister `peer_id` if `connection` still owns its membership.
    pub async fn remove_peer(&self, peer_id: &Uuid, connection: ConnectionId) -> Option<PeerInfo> {
        let mut peers = self.peers.write().await;
        if !peers.get(peer_id).is_some_and(|m| m.connection == connection) {
            return None;
        }
        peers.remove(peer_id).map(|m| m.info)
    }

    /// Send to every receiver. Filtering out the sender is the receiving
    /// connection's job. Returns the number of receivers reached.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for messages a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().map(|m| m.info.clone()).collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Relay-side state of one room: the merged document and its fan-out group.
pub struct Room {
    name: String,
    doc: Mutex<Doc>,
    group: BroadcastGroup,
}

impl Room {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            doc: Mutex::new(Doc::new()),
            group: BroadcastGroup::new(capacity),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }

    /// Merge a v1 update into the room document.
    pub async fn apply_update(&self, update: &[u8]) -> Result<(), LobbyError> {
        let doc = self.doc.lock().await;
        // `Update` is not `Send`; decode only once the lock is held.
        let update =
            Update::decode_v1(update).map_err(|e| LobbyError::InvalidUpdate(e.to_string()))?;
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| LobbyError::ApplyUpdate(e.to_string()))?;
        Ok(())
    }

    pub async fn state_vector(&self) -> Vec<u8> {
        let doc = self.doc.lock().await;
        let txn = doc.transact();
        txn.state_vector().encode_v1()
    }

    /// The whole document as one update.
    pub async fn encode_state(&self) -> Vec<u8> {
        let doc = self.doc.lock().await;
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything the holder of `state_vector` is missing.
    pub async fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, LobbyError> {
        let doc = self.doc.lock().await;
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| LobbyError::InvalidStateVector(e.to_string()))?;
        let txn = doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }
}

/// Maps room names to rooms, isolating traffic between rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Register a connection in `room`, creating the room on first use.
    ///
    /// Holds the room map lock throughout so a concurrent
    /// [`RoomManager::remove_if_empty`] cannot orphan the new member.
    pub async fn join(
        &self,
        room: &str,
        info: PeerInfo,
        max_peers: usize,
    ) -> Result<(Arc<Room>, Subscription), ProtocolError> {
        let mut rooms = self.rooms.write().await;
        let target = rooms
            .entry(room.to_string())
            .or_insert_with(|| {
                log::info!("Room {room} opened");
                Arc::new(Room::new(room, self.default_capacity))
            })
            .clone();

        match target.group.try_add_peer(info, max_peers).await {
            Some(subscription) => Ok((target, subscription)),
            None => {
                if target.group.peer_count().await == 0 {
                    rooms.remove(room);
                }
                Err(ProtocolError::RoomFull(room.to_string()))
            }
        }
    }

    pub async fn get(&self, room: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room).cloned()
    }

    /// Drop the room, and its document, if nobody is left in it.
    pub async fn remove_if_empty(&self, room: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(existing) = rooms.get(room) {
            if existing.group.peer_count().await == 0 {
                rooms.remove(room);
                log::info!("Room {room} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let peer = PeerInfo::new("Alice");
        let peer_id = peer.peer_id;

        let sub = group.add_peer(peer).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&peer_id).await);

        assert!(group.remove_peer(&peer_id, sub.connection).await.is_some());
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_try_add_peer_respects_limit() {
        let group = BroadcastGroup::new(16);
        let alice = PeerInfo::new("Alice");

        assert!(group.try_add_peer(alice.clone(), 1).await.is_some());
        assert!(group.try_add_peer(PeerInfo::new("Bob"), 1).await.is_none());
        // Re-joining with the same id is not a new slot.
        assert!(group.try_add_peer(alice, 1).await.is_some());
        assert_eq!(group.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_stale_connection_cannot_remove_rejoined_peer() {
        let group = BroadcastGroup::new(16);
        let alice = PeerInfo::new("Alice");

        let stale = group.try_add_peer(alice.clone(), 4).await.unwrap();
        let live = group.try_add_peer(alice.clone(), 4).await.unwrap();
        assert_ne!(stale.connection, live.connection);

        assert!(group.remove_peer(&alice.peer_id, stale.connection).await.is_none());
        assert!(group.has_peer(&alice.peer_id).await);

        assert!(group.remove_peer(&alice.peer_id, live.connection).await.is_some());
        assert!(!group.has_peer(&alice.peer_id).await);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16);
        let alice = PeerInfo::new("Alice");
        let mut rx1 = group.add_peer(alice.clone()).await.receiver;
        let mut rx2 = group.add_peer(PeerInfo::new("Bob")).await.receiver;

        let msg = SyncMessage::update(alice.peer_id, "rpsApp", 1, vec![1, 2, 3]);
        assert_eq!(group.broadcast(&msg).unwrap(), 2);

        let got = SyncMessage::decode(&rx1.recv().await.unwrap()).unwrap();
        assert_eq!(got.payload, vec![1, 2, 3]);
        assert!(rx2.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_stats_count_sent_and_dropped() {
        let group = BroadcastGroup::new(16);
        let peer = PeerInfo::new("Alice");
        let _rx = group.add_peer(peer.clone()).await;

        let msg = SyncMessage::ping(peer.peer_id);
        group.broadcast(&msg).unwrap();
        group.broadcast(&msg).unwrap();
        group.record_dropped(3);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(PeerInfo::new("Slow")).await.receiver;
        for i in 0..5u8 {
            group.broadcast_raw(Arc::new(vec![i]));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn test_room_manager_join_reuses_room() {
        let manager = RoomManager::new(16);
        let (room1, _a) = manager.join("rpsApp", PeerInfo::new("Alice"), 10).await.unwrap();
        let (room2, _b) = manager.join("rpsApp", PeerInfo::new("Bob"), 10).await.unwrap();

        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(room1.name(), "rpsApp");
        assert_eq!(room1.group().capacity(), 16);
        assert_eq!(room1.group().peer_count().await, 2);
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_room_manager_isolates_rooms() {
        let manager = RoomManager::new(16);
        let (a, _a) = manager.join("a", PeerInfo::new("Alice"), 10).await.unwrap();
        let (b, _b) = manager.join("b", PeerInfo::new("Bob"), 10).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        let mut rooms = manager.active_rooms().await;
        rooms.sort();
        assert_eq!(rooms, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let peer = PeerInfo::new("Alice");
        let peer_id = peer.peer_id;
        let (room, sub) = manager.join("rpsApp", peer, 10).await.unwrap();

        assert!(!manager.remove_if_empty("rpsApp").await);
        room.group().remove_peer(&peer_id, sub.connection).await;
        assert!(manager.remove_if_empty("rpsApp").await);
        assert_eq!(manager.room_count().await, 0);
        assert!(manager.get("rpsApp").await.is_none());
    }

    #[tokio::test]
    async fn test_room_survives_stale_rejoin_cleanup() {
        let manager = RoomManager::new(16);
        let alice = PeerInfo::new("Alice");
        let (room, stale) = manager.join("rpsApp", alice.clone(), 10).await.unwrap();
        let (_, _live) = manager.join("rpsApp", alice.clone(), 10).await.unwrap();

        assert!(room.group().remove_peer(&alice.peer_id, stale.connection).await.is_none());
        assert!(!manager.remove_if_empty("rpsApp").await);
        assert!(Arc::ptr_eq(&manager.get("rpsApp").await.unwrap(), &room));
    }

    #[tokio::test]
    async fn test_room_manager_join_limit() {
        let manager = RoomManager::new(16);
        let (room, _rx) = manager.join("duel", PeerInfo::new("Alice"), 1).await.unwrap();
        assert_eq!(room.group().peer_count().await, 1);

        let refused = manager.join("duel", PeerInfo::new("Bob"), 1).await;
        assert_eq!(refused.err(), Some(ProtocolError::RoomFull("duel".into())));
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_room_manager_join_zero_capacity_leaves_no_room() {
        let manager = RoomManager::new(16);
        assert!(manager.join("nobody", PeerInfo::new("Alice"), 0).await.is_err());
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_room_document_handshake() {
        use yrs::{Array, Doc, Transact};

        let room = Room::new("rpsApp", 16);
        let source = Doc::new();
        let update = {
            let games = source.get_or_insert_array("games");
            let mut txn = source.transact_mut();
            games.push_back(&mut txn, "g1");
            txn.encode_update_v1()
        };
        room.apply_update(&update).await.unwrap();

        let empty_sv = Doc::new().transact().state_vector().encode_v1();
        let diff = room.encode_diff(&empty_sv).await.unwrap();
        assert!(diff.len() > 2);

        // Nothing is missing for a peer that already holds the update.
        let full_sv = source.transact().state_vector().encode_v1();
        assert_eq!(room.state_vector().await, full_sv);

        let replica = Doc::new();
        let state = Update::decode_v1(&room.encode_state().await).unwrap();
        replica.transact_mut().apply_update(state).unwrap();
        assert_eq!(replica.transact().state_vector().encode_v1(), full_sv);
    }

    #[tokio::test]
    async fn test_room_rejects_garbage() {
        let room = Room::new("rpsApp", 16);
        assert!(room.apply_update(&[0xff, 0xff, 0xff]).await.is_err());
        assert!(matches!(
            room.encode_diff(&[0xff, 0xff]).await,
            Err(LobbyError::InvalidStateVector(_))
        ));
    }
}
