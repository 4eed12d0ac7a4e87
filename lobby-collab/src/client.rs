//! WebSocket client connecting a lobby peer to the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Document update send/receive
//! - Presence packets
//! - Offline queue for updates produced while disconnected

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost or closed
    Disconnected,
    /// Document update relayed from a remote peer
    RemoteUpdate {
        peer_id: Uuid,
        clock: u64,
        update: Vec<u8>,
    },
    /// The relay sent its state vector and wants our missing updates
    SyncRequested(Vec<u8>),
    /// Diff answering our state vector
    StateSynced(Vec<u8>),
    /// Presence packet from a remote peer
    Presence {
        peer_id: Uuid,
        message: AwarenessMessage,
    },
    /// A connection joined the room
    PeerJoined(PeerInfo),
    /// A connection left the room
    PeerLeft(Uuid),
}

/// Updates produced while disconnected, replayed on the next connect.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    clock: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update. Returns false when the queue is full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedUpdate { clock, payload });
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|u| (u.clock, u.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.payload.len()).sum()
    }
}

/// The sync client.
///
/// Owns one WebSocket connection to the relay. Incoming traffic is turned
/// into [`SyncEvent`]s on a channel taken once with
/// [`SyncClient::take_event_rx`].
pub struct SyncClient {
    peer_info: PeerInfo,
    room: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Counts updates sent by this connection
    clock: Arc<RwLock<u64>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    server_url: String,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, room: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_info,
            room: room.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(RwLock::new(0)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Create a client and hand out its event receiver at once.
    pub fn with_event_channel(
        peer_info: PeerInfo,
        room: impl Into<String>,
        server_url: impl Into<String>,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let mut client = Self::new(peer_info, room, server_url);
        let (event_tx, event_rx) = mpsc::channel(256);
        client.event_tx = event_tx;
        client.event_rx = None;
        (client, event_rx)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to `{server_url}/{room}`, join the room and replay the
    /// offline queue.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url, self.room);
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {url}: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        log::info!("Connected to {url} as {}", self.peer_info.peer_id);

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);

        // Writer task; closing the channel closes the socket.
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let join_msg = SyncMessage::peer_joined(self.peer_info.peer_id, &self.room, &self.peer_info)?;
        self.send_raw(join_msg.encode()?).await?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates", queued.len());
            for (clock, payload) in queued {
                let msg = SyncMessage::update(self.peer_info.peer_id, &self.room, clock, payload);
                self.send_raw(msg.encode()?).await?;
            }
        }

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let peer_id = self.peer_info.peer_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Dropping undecodable frame: {e}");
                                continue;
                            }
                        };
                        if sync_msg.peer_id == peer_id {
                            continue;
                        }
                        if let Some(event) = Self::to_event(sync_msg) {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    fn to_event(sync_msg: SyncMessage) -> Option<SyncEvent> {
        match sync_msg.msg_type {
            MessageType::Update => Some(SyncEvent::RemoteUpdate {
                peer_id: sync_msg.peer_id,
                clock: sync_msg.clock,
                update: sync_msg.payload,
            }),
            MessageType::SyncStep1 => Some(SyncEvent::SyncRequested(sync_msg.payload)),
            MessageType::SyncStep2 => Some(SyncEvent::StateSynced(sync_msg.payload)),
            MessageType::Awareness => match sync_msg.awareness_message() {
                Ok(message) => Some(SyncEvent::Presence { peer_id: sync_msg.peer_id, message }),
                Err(e) => {
                    log::warn!("Dropping presence from {}: {e}", sync_msg.peer_id);
                    None
                }
            },
            MessageType::PeerJoined => sync_msg.peer_info().ok().map(SyncEvent::PeerJoined),
            MessageType::PeerLeft => Some(SyncEvent::PeerLeft(sync_msg.peer_id)),
            MessageType::Ping | MessageType::Pong => None,
        }
    }

    async fn send_raw(&self, encoded: Vec<u8>) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Send a document update.
    ///
    /// If disconnected, queues the update for replay on the next connect.
    pub async fn send_update(&self, yrs_update: Vec<u8>) -> Result<(), ProtocolError> {
        let current_clock = {
            let mut clock = self.clock.write().await;
            *clock += 1;
            *clock
        };

        if !self.is_connected().await {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(current_clock, yrs_update) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let msg = SyncMessage::update(self.peer_info.peer_id, &self.room, current_clock, yrs_update);
        self.send_raw(msg.encode()?).await
    }

    /// Send a presence packet. Dropped silently while offline.
    pub async fn send_awareness(&self, message: &AwarenessMessage) -> Result<(), ProtocolError> {
        if !self.is_connected().await {
            return Ok(());
        }
        let clock = *self.clock.read().await;
        let msg = SyncMessage::awareness(self.peer_info.peer_id, &self.room, clock, message)?;
        self.send_raw(msg.encode()?).await
    }

    /// Ask the relay for the updates missing from `state_vector`.
    pub async fn send_sync_step1(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        if !self.is_connected().await {
            return Ok(());
        }
        let msg = SyncMessage::sync_step1(self.peer_info.peer_id, &self.room, state_vector);
        self.send_raw(msg.encode()?).await
    }

    /// Answer a relay state vector with our diff.
    pub async fn send_sync_step2(&self, diff: Vec<u8>) -> Result<(), ProtocolError> {
        if !self.is_connected().await {
            return Ok(());
        }
        let msg = SyncMessage::sync_step2(self.peer_info.peer_id, &self.room, diff);
        self.send_raw(msg.encode()?).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let msg = SyncMessage::ping(self.peer_info.peer_id);
        self.send_raw(msg.encode()?).await
    }

    /// Close the connection. The reader task reports
    /// [`SyncEvent::Disconnected`] once the relay acknowledges.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            if let Ok(encoded) = SyncMessage::peer_left(self.peer_info.peer_id, &self.room).encode() {
                let _ = tx.send(encoded).await;
            }
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn clock(&self) -> u64 {
        *self.clock.read().await
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
