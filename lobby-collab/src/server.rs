//! WebSocket relay with room-based routing.
//!
//! Architecture:
//! ```text
//! Peer A ──┐
//!           ├── Room ("rpsApp") ── Yrs Doc ── BroadcastGroup
//! Peer B ──┘                                      │
//!                                  ┌──────────────┼─────────────┐
//!                                  ▼              ▼             ▼
//!                               Peer A         Peer B        Peer C
//! ```
//!
//! The relay never interprets lobby data. It keeps a merged copy of each
//! room document so late joiners can catch up through the sync handshake,
//! and forwards presence packets untouched.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{ConnectionId, Room, RoomManager};
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 1338;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room, further joins are refused
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("{DEFAULT_HOST}:{DEFAULT_PORT}"),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Read `HOST`, `WS_PORT`, `MAX_PEERS_PER_ROOM`, `BROADCAST_CAPACITY`
    /// and `HEARTBEAT_INTERVAL_SECS` from the environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let host = lookup("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port: u16 = parse_var(&lookup, "WS_PORT").unwrap_or(DEFAULT_PORT);

        Self {
            bind_addr: format!("{host}:{port}"),
            max_peers_per_room: parse_var(&lookup, "MAX_PEERS_PER_ROOM")
                .unwrap_or(defaults.max_peers_per_room),
            broadcast_capacity: parse_var(&lookup, "BROADCAST_CAPACITY")
                .unwrap_or(defaults.broadcast_capacity),
            heartbeat_interval_secs: parse_var(&lookup, "HEARTBEAT_INTERVAL_SECS")
                .unwrap_or(defaults.heartbeat_interval_secs),
        }
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring invalid {key}={raw:?}, using default");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub refused_joins: u64,
}

/// Membership of one connection.
struct Membership {
    peer_id: Uuid,
    connection: ConnectionId,
    room: Arc<Room>,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

/// What the connection loop should do after a message.
enum Flow {
    Continue,
    Close,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut membership: Option<Membership> = None;
        let outcome = Self::connection_loop(ws_stream, addr, &mut membership, &rooms, &stats, &config).await;

        if let Some(m) = membership {
            Self::leave(m, &rooms).await;
        }

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms.room_count().await;
        }

        outcome
    }

    /// Unregister a closed connection. A peer that rejoined on another
    /// connection keeps its membership and no `PeerLeft` goes out.
    async fn leave(m: Membership, rooms: &RoomManager) {
        if m.room.group().remove_peer(&m.peer_id, m.connection).await.is_some() {
            let _ = m.room.group().broadcast(&SyncMessage::peer_left(m.peer_id, m.room.name()));
            log::info!("Peer {} left room {}", m.peer_id, m.room.name());
        } else {
            log::debug!("Peer {} closed a superseded connection to {}", m.peer_id, m.room.name());
        }
        rooms.remove_if_empty(m.room.name()).await;
    }

    async fn connection_loop(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        membership: &mut Option<Membership>,
        rooms: &RoomManager,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
        // The first tick completes immediately.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let sync_msg = match SyncMessage::decode(&data) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }

                            let reply = match Self::handle_message(
                                sync_msg, membership, rooms, stats, config,
                            ).await {
                                Ok(Some(reply)) => reply,
                                Ok(None) => continue,
                                Err(ProtocolError::RoomFull(room)) => {
                                    log::warn!("Refusing {addr}: room {room} is full");
                                    ws_sender.send(Message::Close(None)).await?;
                                    break;
                                }
                                Err(e) => {
                                    log::warn!("Dropping message from {addr}: {e}");
                                    continue;
                                }
                            };
                            for msg in reply.messages {
                                ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                            }
                            if let Flow::Close = reply.flow {
                                break;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                msg = async {
                    match membership.as_mut() {
                        Some(m) => m.rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            let own_id = membership.as_ref().map(|m| m.peer_id);
                            if let Ok(relayed) = SyncMessage::decode(&data) {
                                if Some(relayed.peer_id) == own_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            if let Some(m) = membership.as_ref() {
                                m.room.group().record_dropped(n);
                                log::warn!("Peer {} lagged by {n} messages, resending room state", m.peer_id);
                                let resync = Self::resync(&m.room).await;
                                ws_sender.send(Message::Binary(resync.encode()?.into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
        Ok(())
    }

    /// Process one decoded frame. Returns the messages to send back to the
    /// originating connection.
    async fn handle_message(
        sync_msg: SyncMessage,
        membership: &mut Option<Membership>,
        rooms: &RoomManager,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
    ) -> Result<Option<Reply>, ProtocolError> {
        if sync_msg.msg_type == MessageType::PeerJoined {
            if membership.is_some() {
                log::debug!("Ignoring repeated join from {}", sync_msg.peer_id);
                return Ok(None);
            }
            let mut info = sync_msg.peer_info().unwrap_or_else(|e| {
                log::warn!("Join without readable peer info: {e}");
                PeerInfo::with_id(sync_msg.peer_id, "Anonymous")
            });
            info.peer_id = sync_msg.peer_id;

            let (room, subscription) = match rooms
                .join(&sync_msg.room, info.clone(), config.max_peers_per_room)
                .await
            {
                Ok(joined) => joined,
                Err(e) => {
                    stats.write().await.refused_joins += 1;
                    return Err(e);
                }
            };

            room.group().broadcast(&SyncMessage::peer_joined(info.peer_id, room.name(), &info)?)?;
            log::info!("Peer {} ({}) joined room {}", info.name, info.peer_id, room.name());

            let state_vector = room.state_vector().await;
            let request = SyncMessage::sync_step1(Uuid::nil(), room.name(), state_vector);
            *membership = Some(Membership {
                peer_id: info.peer_id,
                connection: subscription.connection,
                room,
                rx: subscription.receiver,
            });
            stats.write().await.active_rooms = rooms.room_count().await;
            return Ok(Some(Reply::send(request)));
        }

        if sync_msg.msg_type == MessageType::Ping {
            return Ok(Some(Reply::send(SyncMessage::pong(Uuid::nil()))));
        }

        let Some(m) = membership.as_ref() else {
            log::debug!("Ignoring {:?} before join", sync_msg.msg_type);
            return Ok(None);
        };
        if sync_msg.peer_id != m.peer_id {
            log::warn!("Dropping message claiming to be {} on connection of {}", sync_msg.peer_id, m.peer_id);
            return Ok(None);
        }

        match sync_msg.msg_type {
            MessageType::SyncStep1 => {
                let diff = m.room.encode_diff(&sync_msg.payload).await?;
                Ok(Some(Reply::send(SyncMessage::sync_step2(Uuid::nil(), m.room.name(), diff))))
            }

            MessageType::SyncStep2 | MessageType::Update => {
                m.room.apply_update(&sync_msg.payload).await?;
                let relayed =
                    SyncMessage::update(sync_msg.peer_id, m.room.name(), sync_msg.clock, sync_msg.payload);
                m.room.group().broadcast(&relayed)?;
                Ok(None)
            }

            MessageType::Awareness => {
                match AwarenessMessage::decode(&sync_msg.payload) {
                    Ok(AwarenessMessage::Announce { record, .. }) => {
                        log::info!("Presence: {} announced in room {}", record.username, m.room.name());
                    }
                    Ok(AwarenessMessage::Leave { peer_id }) => {
                        log::info!("Presence: {peer_id} left room {}", m.room.name());
                    }
                    Ok(AwarenessMessage::Patch { field, .. }) if field.is_high_frequency() => {
                        log::trace!("Presence: cursor update in room {}", m.room.name());
                    }
                    Ok(AwarenessMessage::Patch { peer_id, .. }) => {
                        log::debug!("Presence: {peer_id} patched in room {}", m.room.name());
                    }
                    Err(e) => {
                        log::warn!("Dropping unreadable presence from {}: {e}", sync_msg.peer_id);
                        return Ok(None);
                    }
                }
                m.room.group().broadcast(&sync_msg)?;
                Ok(None)
            }

            MessageType::PeerLeft => Ok(Some(Reply::close())),

            other => {
                log::debug!("Unhandled message type: {other:?}");
                Ok(None)
            }
        }
    }

    /// The whole room document, for a connection whose receiver skipped
    /// fan-out messages. Updates it already holds merge as no-ops.
    async fn resync(room: &Room) -> SyncMessage {
        SyncMessage::sync_step2(Uuid::nil(), room.name(), room.encode_state().await)
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

/// Direct answer to the originating connection.
struct Reply {
    messages: Vec<SyncMessage>,
    flow: Flow,
}

impl Reply {
    fn send(msg: SyncMessage) -> Self {
        Self { messages: vec![msg], flow: Flow::Continue }
    }

    fn close() -> Self {
        Self { messages: Vec::new(), flow: Flow::Close }
    }
}
