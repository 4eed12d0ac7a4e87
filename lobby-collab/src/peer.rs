//! A lobby participant: registry, presence and relay connection in one
//! event loop.
//!
//! Intents (`create_game`, `join_game`, ...) mutate the local document and
//! push the resulting updates to the relay. [`LobbyPeer::step`] waits for
//! whichever comes first: a sync event, a machine timer or a presence flush.

use std::time::Duration;

use lobby_core::{
    DuelEvent, DuelState, Game, GameId, JoinOutcome, Lobby, Player, PlayerColor, Transition,
    PLAYING_DURATION,
};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::client::{ConnectionState, SyncClient, SyncEvent};
use crate::presence::{PresenceField, PresenceManager, PresenceRecord, PRESENCE_THROTTLE};
use crate::protocol::{PeerInfo, ProtocolError};
use crate::server::{DEFAULT_HOST, DEFAULT_PORT};

/// Session every peer joins unless told otherwise.
pub const DEFAULT_ROOM: &str = "rpsApp";

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Relay base URL, the room name is appended as a path segment
    pub server_url: String,
    pub room: String,
    pub playing_duration: Duration,
    pub presence_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://{DEFAULT_HOST}:{DEFAULT_PORT}"),
            room: DEFAULT_ROOM.to_string(),
            playing_duration: PLAYING_DURATION,
            presence_interval: PRESENCE_THROTTLE,
        }
    }
}

pub struct LobbyPeer {
    player: Player,
    lobby: Lobby,
    presence: PresenceManager,
    client: SyncClient,
    events: mpsc::Receiver<SyncEvent>,
    games_tx: watch::Sender<Vec<Game>>,
    published_revision: u64,
}

impl LobbyPeer {
    pub fn new(player: Player, config: PeerConfig) -> Self {
        let info = PeerInfo {
            peer_id: Uuid::new_v4(),
            name: player.username.clone(),
            color: player.color,
        };
        let peer_id = info.peer_id;
        let (client, events) = SyncClient::with_event_channel(info, config.room.clone(), config.server_url);
        let lobby = Lobby::new(config.room).with_playing_duration(config.playing_duration);
        let (games_tx, _) = watch::channel(Vec::new());

        Self {
            player,
            lobby,
            presence: PresenceManager::with_interval(peer_id, config.presence_interval),
            client,
            events,
            games_tx,
            published_revision: 0,
        }
    }

    /// Connect, request the missing document state and announce presence.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.client.connect().await?;
        self.client.send_sync_step1(self.lobby.state_vector()).await?;
        self.flush_outgoing().await?;

        let record = PresenceRecord::for_player(self.peer_id(), &self.player);
        let announce = self.presence.announce(record);
        self.client.send_awareness(&announce).await
    }

    /// Leave cleanly: presence leave packet, then close the socket.
    pub async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        let leave = self.presence.leave();
        self.client.send_awareness(&leave).await?;
        self.client.disconnect().await;
        self.presence.clear_remote();
        Ok(())
    }

    // ── Intents ──────────────────────────────────────────────────────

    pub async fn create_game(&mut self) -> Result<GameId, ProtocolError> {
        let id = self.lobby.create_game(&self.player)?;
        self.flush_outgoing().await?;
        Ok(id)
    }

    pub async fn join_game(&mut self, game_id: &str) -> Result<JoinOutcome, ProtocolError> {
        let outcome = self.lobby.join_game(game_id, &self.player)?;
        self.flush_outgoing().await?;
        Ok(outcome)
    }

    pub async fn delete_game(&mut self, game_id: &str) -> Result<bool, ProtocolError> {
        let deleted = self.lobby.delete_game(game_id);
        self.flush_outgoing().await?;
        Ok(deleted)
    }

    pub async fn send_event(&mut self, game_id: &str, event: DuelEvent) -> Result<Option<Transition>, ProtocolError> {
        let transition = self.lobby.send_event(game_id, event);
        self.flush_outgoing().await?;
        Ok(transition)
    }

    /// Partial presence update; pointer fields are throttled.
    pub async fn update_presence(&mut self, field: PresenceField) -> Result<(), ProtocolError> {
        match self.presence.update_field(field, std::time::Instant::now()) {
            Some(msg) => self.client.send_awareness(&msg).await,
            None => Ok(()),
        }
    }

    /// Change identity. Sent as a full announce.
    pub async fn set_identity(&mut self, username: impl Into<String>, color: PlayerColor) -> Result<(), ProtocolError> {
        self.player.username = username.into();
        self.player.color = color;
        let mut record = PresenceRecord::for_player(self.peer_id(), &self.player);
        if let Some(current) = self.presence.local() {
            record.element_index = current.element_index;
            record.position = current.position;
            record.viewport_size = current.viewport_size;
        }
        let announce = self.presence.announce(record);
        self.client.send_awareness(&announce).await
    }

    async fn flush_outgoing(&mut self) -> Result<(), ProtocolError> {
        for update in self.lobby.take_outgoing() {
            self.client.send_update(update).await?;
        }
        self.publish_games();
        Ok(())
    }

    fn publish_games(&mut self) {
        if self.lobby.revision() != self.published_revision {
            self.published_revision = self.lobby.revision();
            self.games_tx.send_replace(self.lobby.list_games());
        }
    }

    // ── Event loop ───────────────────────────────────────────────────

    /// Wait for and process one trigger. Returns `false` once the
    /// connection is gone.
    pub async fn step(&mut self) -> Result<bool, ProtocolError> {
        let machine_deadline = self.lobby.next_deadline();
        let flush_deadline = self.presence.next_flush();

        tokio::select! {
            event = self.events.recv() => match event {
                Some(event) => {
                    let disconnected = matches!(event, SyncEvent::Disconnected);
                    self.handle_event(event).await?;
                    if disconnected {
                        return Ok(false);
                    }
                }
                None => return Ok(false),
            },
            _ = sleep_until(machine_deadline) => {
                let fired = self.lobby.advance_timers(std::time::Instant::now());
                log::debug!("{fired} machine timer(s) fired");
                self.flush_outgoing().await?;
            }
            _ = sleep_until(flush_deadline) => {
                for msg in self.presence.flush(std::time::Instant::now()) {
                    self.client.send_awareness(&msg).await?;
                }
            }
        }
        Ok(true)
    }

    /// Process triggers for `duration`, or until the connection is gone.
    pub async fn run_for(&mut self, duration: Duration) -> Result<(), ProtocolError> {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            match tokio::time::timeout_at(deadline, self.step()).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) | Err(_) => return Ok(()),
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Process triggers until the connection is gone.
    pub async fn run(&mut self) -> Result<(), ProtocolError> {
        while self.step().await? {}
        Ok(())
    }

    async fn handle_event(&mut self, event: SyncEvent) -> Result<(), ProtocolError> {
        match event {
            SyncEvent::Connected => log::info!("Peer {} connected", self.peer_id()),
            SyncEvent::Disconnected => {
                log::info!("Peer {} disconnected", self.peer_id());
                self.presence.clear_remote();
            }
            SyncEvent::RemoteUpdate { update, .. } | SyncEvent::StateSynced(update) => {
                if let Err(e) = self.lobby.apply_remote_update(&update) {
                    log::warn!("Dropping remote update: {e}");
                }
                self.flush_outgoing().await?;
            }
            SyncEvent::SyncRequested(state_vector) => match self.lobby.encode_diff(&state_vector) {
                Ok(diff) => self.client.send_sync_step2(diff).await?,
                Err(e) => log::warn!("Ignoring sync request: {e}"),
            },
            SyncEvent::Presence { peer_id, message } => {
                self.presence.handle_remote(peer_id, &message);
            }
            SyncEvent::PeerJoined(info) => {
                log::debug!("{} joined, re-announcing", info.name);
                if let Some(announce) = self.presence.reannounce() {
                    self.client.send_awareness(&announce).await?;
                }
            }
            SyncEvent::PeerLeft(peer_id) => {
                self.presence.remove_peer(&peer_id);
            }
        }
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn player(&self) -> &Player {
        &self.player
    }

    pub fn peer_id(&self) -> Uuid {
        self.client.peer_info().peer_id
    }

    pub fn lobby(&self) -> &Lobby {
        &self.lobby
    }

    pub fn presence(&self) -> &PresenceManager {
        &self.presence
    }

    pub fn list_games(&self) -> Vec<Game> {
        self.lobby.list_games()
    }

    pub fn machine_state(&self, game_id: &str) -> Option<DuelState> {
        self.lobby.machine_state(game_id)
    }

    /// Live game list, updated after every local or remote change.
    pub fn games(&self) -> watch::Receiver<Vec<Game>> {
        self.games_tx.subscribe()
    }

    pub fn observe_presence(&self) -> watch::Receiver<std::collections::HashMap<Uuid, PresenceRecord>> {
        self.presence.observe_all()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.client.connection_state().await
    }

    /// Updates waiting for a connection.
    pub async fn pending_updates(&self) -> usize {
        self.client.offline_queue_len().await
    }
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_peer(name: &str) -> LobbyPeer {
        LobbyPeer::new(Player::with_id(name, name), PeerConfig::default())
    }

    #[test]
    fn test_peer_config_default() {
        let config = PeerConfig::default();
        assert_eq!(config.server_url, "ws://127.0.0.1:1338");
        assert_eq!(config.room, "rpsApp");
        assert_eq!(config.playing_duration, PLAYING_DURATION);
    }

    #[tokio::test]
    async fn test_offline_intents_are_queued() {
        let mut peer = offline_peer("p1");
        let games = peer.games();

        let id = peer.create_game().await.unwrap();

        assert_eq!(peer.pending_updates().await, 1);
        assert_eq!(games.borrow().len(), 1);
        assert_eq!(games.borrow()[0].id, id);
        assert_eq!(peer.machine_state(&id), Some(DuelState::Waiting));
    }

    #[tokio::test]
    async fn test_remote_update_event_applies() {
        let mut host = offline_peer("p1");
        let mut guest = offline_peer("p2");
        let id = host.create_game().await.unwrap();

        let update = host.lobby.encode_state();
        guest
            .handle_event(SyncEvent::StateSynced(update))
            .await
            .unwrap();

        assert_eq!(guest.list_games().len(), 1);
        assert_eq!(guest.join_game(&id).await.unwrap(), JoinOutcome::Joined);
        assert_eq!(guest.machine_state(&id), Some(DuelState::Ready));
    }

    #[tokio::test]
    async fn test_garbage_update_is_dropped() {
        let mut peer = offline_peer("p1");
        let update = SyncEvent::RemoteUpdate { peer_id: Uuid::new_v4(), clock: 1, update: vec![0xFF, 0x01] };
        assert!(peer.handle_event(update).await.is_ok());
        assert!(peer.list_games().is_empty());
    }

    #[tokio::test]
    async fn test_presence_events() {
        let mut peer = offline_peer("p1");
        let remote_id = Uuid::new_v4();
        let mut remote = PresenceManager::new(remote_id);
        let announce = remote.announce(PresenceRecord::for_player(remote_id, &Player::with_id("p2", "bob")));

        peer.handle_event(SyncEvent::Presence { peer_id: remote_id, message: announce })
            .await
            .unwrap();
        assert_eq!(peer.presence().peer_count(), 1);

        peer.handle_event(SyncEvent::PeerLeft(remote_id)).await.unwrap();
        assert_eq!(peer.presence().peer_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_event_clears_presence() {
        let mut peer = offline_peer("p1");
        let remote_id = Uuid::new_v4();
        let mut remote = PresenceManager::new(remote_id);
        let announce = remote.announce(PresenceRecord::for_player(remote_id, &Player::random()));
        peer.handle_event(SyncEvent::Presence { peer_id: remote_id, message: announce })
            .await
            .unwrap();

        peer.handle_event(SyncEvent::Disconnected).await.unwrap();
        assert_eq!(peer.presence().peer_count(), 0);
    }

    #[tokio::test]
    async fn test_run_for_fires_machine_timer() {
        let config = PeerConfig { playing_duration: Duration::from_millis(20), ..PeerConfig::default() };
        let mut peer = LobbyPeer::new(Player::with_id("p1", "host"), config);
        let id = peer.create_game().await.unwrap();
        peer.lobby.join_game(&id, &Player::with_id("p2", "guest")).unwrap();
        peer.send_event(&id, DuelEvent::Start).await.unwrap();
        assert_eq!(peer.machine_state(&id), Some(DuelState::Playing));

        peer.run_for(Duration::from_millis(100)).await.unwrap();

        assert_eq!(peer.machine_state(&id), Some(DuelState::Done));
        assert_eq!(peer.lobby().game(&id).map(|g| g.version), Some(3));
    }
}
