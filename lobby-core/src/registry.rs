//! Session registry: the ordered list of games inside the shared document.
//!
//! Document layout (root array `games`, one nested map per game):
//!
//! ```text
//! games: [
//!   { id: "a1b2c3d4e5f6", mode: "duel", players: ["{..player json..}", ..],
//!     state: "{..machine json..}", version: 3 },
//!   ...
//! ]
//! ```
//!
//! Every local mutation is encoded as a v1 update and queued in the outbox
//! (drained with [`Lobby::take_outgoing`]). Remote updates go through
//! [`Lobby::apply_remote_update`], which also reconciles every game's
//! [`SharedMachine`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, Doc, Map, MapPrelim, MapRef, Out, ReadTxn, StateVector,
    Transact, TransactionMut, Update,
};

use crate::binding::{RecordView, SharedMachine, SharedRecord};
use crate::error::LobbyError;
use crate::machine::{
    DuelEvent, DuelMachine, DuelState, MachineAction, Transition, PLAYING_DURATION,
};
use crate::model::{make_id, Game, GameId, GameMode, Player};

/// Name of the root array holding the games.
pub const GAMES_KEY: &str = "games";

mod keys {
    pub const ID: &str = "id";
    pub const MODE: &str = "mode";
    pub const PLAYERS: &str = "players";
    pub const STATE: &str = "state";
    pub const VERSION: &str = "version";
}

/// Result of [`Lobby::join_game`]. Only `Joined` touches the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Full,
    AlreadyMember,
    NotFound,
}

// ───────────────────────────────────────────────────────────────────
// Record adapter
// ───────────────────────────────────────────────────────────────────

/// One game map seen through an open write transaction.
pub struct YrsGameRecord<'a, 'doc> {
    map: MapRef,
    txn: &'a mut TransactionMut<'doc>,
    dirty: bool,
}

impl<'a, 'doc> YrsGameRecord<'a, 'doc> {
    pub fn new(map: MapRef, txn: &'a mut TransactionMut<'doc>) -> Self {
        Self {
            map,
            txn,
            dirty: false,
        }
    }

    /// Whether [`SharedRecord::store`] was called.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl RecordView for YrsGameRecord<'_, '_> {
    fn stored_state(&self) -> Option<String> {
        read_string(&self.map, &*self.txn, keys::STATE)
    }

    fn stored_version(&self) -> u64 {
        read_version(&self.map, &*self.txn)
    }
}

impl SharedRecord for YrsGameRecord<'_, '_> {
    fn store(&mut self, state: String, version: u64) {
        self.map.insert(self.txn, keys::STATE, state);
        self.map.insert(self.txn, keys::VERSION, version as f64);
        self.dirty = true;
    }
}

/// One game map seen through any transaction, read only.
pub struct YrsGameView<'a, T: ReadTxn> {
    map: MapRef,
    txn: &'a T,
}

impl<'a, T: ReadTxn> YrsGameView<'a, T> {
    pub fn new(map: MapRef, txn: &'a T) -> Self {
        Self { map, txn }
    }
}

impl<T: ReadTxn> RecordView for YrsGameView<'_, T> {
    fn stored_state(&self) -> Option<String> {
        read_string(&self.map, self.txn, keys::STATE)
    }

    fn stored_version(&self) -> u64 {
        read_version(&self.map, self.txn)
    }
}

fn read_string<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<String> {
    match map.get(txn, key)? {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn read_version<T: ReadTxn>(map: &MapRef, txn: &T) -> u64 {
    match map.get(txn, keys::VERSION) {
        Some(Out::Any(Any::Number(n))) if n >= 0.0 => n as u64,
        Some(Out::Any(Any::BigInt(n))) if n >= 0 => n as u64,
        _ => 0,
    }
}

fn read_players<T: ReadTxn>(map: &MapRef, txn: &T) -> Vec<Player> {
    let Some(Out::YArray(players)) = map.get(txn, keys::PLAYERS) else {
        return Vec::new();
    };
    players
        .iter(txn)
        .filter_map(|value| match value {
            Out::Any(Any::String(raw)) => match serde_json::from_str::<Player>(&raw) {
                Ok(player) => Some(player),
                Err(e) => {
                    log::warn!("Skipping unreadable player: {e}");
                    None
                }
            },
            _ => None,
        })
        .collect()
}

fn read_game<T: ReadTxn>(map: &MapRef, txn: &T) -> Option<Game> {
    let id = read_string(map, txn, keys::ID)?;
    let mode = read_string(map, txn, keys::MODE)
        .and_then(|name| GameMode::from_name(&name))
        .unwrap_or_default();
    Some(Game {
        players: read_players(map, txn),
        mode,
        state: read_string(map, txn, keys::STATE),
        version: read_version(map, txn),
        id,
    })
}

/// Locate a game map by id. Position is only valid within `txn`.
fn find_game<T: ReadTxn>(games: &ArrayRef, txn: &T, id: &str) -> Option<(u32, MapRef)> {
    games
        .iter(txn)
        .enumerate()
        .find_map(|(index, value)| match value {
            Out::YMap(map) if read_string(&map, txn, keys::ID).as_deref() == Some(id) => {
                Some((index as u32, map))
            }
            _ => None,
        })
}

fn game_maps<T: ReadTxn>(games: &ArrayRef, txn: &T) -> Vec<(GameId, MapRef)> {
    games
        .iter(txn)
        .filter_map(|value| match value {
            Out::YMap(map) => read_string(&map, txn, keys::ID).map(|id| (id, map)),
            _ => None,
        })
        .collect()
}

// ───────────────────────────────────────────────────────────────────
// Lobby
// ───────────────────────────────────────────────────────────────────

/// The session registry of one lobby document, with one bound state
/// machine per game.
pub struct Lobby {
    name: String,
    doc: Doc,
    games: ArrayRef,
    bindings: HashMap<GameId, SharedMachine>,
    outbox: Vec<Vec<u8>>,
    playing_duration: Duration,
    revision: u64,
}

impl Lobby {
    /// Lobby over a fresh document.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_doc(name, Doc::new())
    }

    /// Lobby over an existing document. Games already present get their
    /// machines mounted immediately.
    pub fn with_doc(name: impl Into<String>, doc: Doc) -> Self {
        let games = doc.get_or_insert_array(GAMES_KEY);
        let mut lobby = Self {
            name: name.into(),
            doc,
            games,
            bindings: HashMap::new(),
            outbox: Vec::new(),
            playing_duration: PLAYING_DURATION,
            revision: 0,
        };
        lobby.sync_bindings();
        lobby
    }

    /// Override how long games stay in `playing` (applies to machines
    /// mounted afterwards).
    pub fn with_playing_duration(mut self, duration: Duration) -> Self {
        self.playing_duration = duration;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Bumped on every local mutation and every applied remote update.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn machine_for(&self, game_id: &str) -> DuelMachine {
        DuelMachine::new(self.name.clone(), game_id).with_playing_duration(self.playing_duration)
    }

    fn commit(&mut self, update: Vec<u8>) {
        self.outbox.push(update);
        self.revision += 1;
    }

    // ── Intents ──────────────────────────────────────────────────────

    /// Append a new duel hosted by `host`. No state or version is written
    /// until the first transition.
    pub fn create_game(&mut self, host: &Player) -> Result<GameId, LobbyError> {
        let id = make_id();
        let host_json = serde_json::to_string(host)?;
        let machine = self.machine_for(&id);

        let update = {
            let mut txn = self.doc.transact_mut();
            let map = self.games.push_back(&mut txn, MapPrelim::default());
            map.insert(&mut txn, keys::ID, id.clone());
            map.insert(&mut txn, keys::MODE, GameMode::Duel.as_str());
            let players = map.insert(&mut txn, keys::PLAYERS, ArrayPrelim::default());
            players.push_back(&mut txn, host_json);

            let record = YrsGameRecord::new(map, &mut txn);
            self.bindings
                .insert(id.clone(), SharedMachine::mount(machine, &record));
            txn.encode_update_v1()
        };
        self.commit(update);

        log::info!("Player {} created game {id}", host.username);
        Ok(id)
    }

    /// Add `player` to a game and fire `JOIN`. Full games and existing
    /// members are left untouched.
    pub fn join_game(&mut self, game_id: &str, player: &Player) -> Result<JoinOutcome, LobbyError> {
        let player_json = serde_json::to_string(player)?;
        let machine = self.machine_for(game_id);

        let (outcome, update) = {
            let mut txn = self.doc.transact_mut();
            let Some((_, map)) = find_game(&self.games, &txn, game_id) else {
                return Ok(JoinOutcome::NotFound);
            };
            let Some(game) = read_game(&map, &txn) else {
                return Ok(JoinOutcome::NotFound);
            };
            if game.has_player(&player.id) {
                return Ok(JoinOutcome::AlreadyMember);
            }
            if game.is_full() {
                log::debug!("Join of {} rejected: game {game_id} is full", player.id);
                return Ok(JoinOutcome::Full);
            }

            match map.get(&txn, keys::PLAYERS) {
                Some(Out::YArray(players)) => {
                    players.push_back(&mut txn, player_json);
                }
                _ => {
                    let players = map.insert(&mut txn, keys::PLAYERS, ArrayPrelim::default());
                    players.push_back(&mut txn, player_json);
                }
            }

            let mut record = YrsGameRecord::new(map, &mut txn);
            let binding = match self.bindings.entry(game_id.to_string()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(SharedMachine::mount(machine, &record)),
            };
            binding.send(DuelEvent::Join, &mut record);
            (JoinOutcome::Joined, txn.encode_update_v1())
        };
        self.commit(update);

        log::info!("Player {} joined game {game_id}", player.username);
        Ok(outcome)
    }

    /// Remove a game by id. Returns `false` if it was already gone.
    pub fn delete_game(&mut self, game_id: &str) -> bool {
        let update = {
            let mut txn = self.doc.transact_mut();
            let Some((index, _)) = find_game(&self.games, &txn, game_id) else {
                return false;
            };
            self.games.remove(&mut txn, index);
            txn.encode_update_v1()
        };
        if let Some(mut binding) = self.bindings.remove(game_id) {
            binding.stop();
        }
        self.commit(update);

        log::info!("Deleted game {game_id}");
        true
    }

    /// Feed an event to a game's machine and run its side effects.
    ///
    /// Returns `None` if the game does not exist.
    pub fn send_event(&mut self, game_id: &str, event: DuelEvent) -> Option<Transition> {
        let machine = self.machine_for(game_id);

        let (transition, update) = {
            let mut txn = self.doc.transact_mut();
            let (_, map) = find_game(&self.games, &txn, game_id)?;
            let mut record = YrsGameRecord::new(map, &mut txn);
            let binding = match self.bindings.entry(game_id.to_string()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(SharedMachine::mount(machine, &record)),
            };
            let transition = binding.send(event, &mut record);
            let dirty = record.is_dirty();
            (transition, dirty.then(|| txn.encode_update_v1()))
        };
        if let Some(update) = update {
            self.commit(update);
        }

        self.run_actions(game_id, &transition);
        Some(transition)
    }

    fn run_actions(&mut self, game_id: &str, transition: &Transition) {
        for action in &transition.actions {
            match action {
                MachineAction::Log => log::info!(
                    "Game {game_id} in {} (context {:?})",
                    transition.snapshot.value,
                    transition.snapshot.context
                ),
                MachineAction::Delete => {
                    self.delete_game(game_id);
                }
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Ordered snapshot of every game.
    pub fn list_games(&self) -> Vec<Game> {
        let txn = self.doc.transact();
        self.games
            .iter(&txn)
            .filter_map(|value| match value {
                Out::YMap(map) => read_game(&map, &txn),
                _ => None,
            })
            .collect()
    }

    pub fn game(&self, game_id: &str) -> Option<Game> {
        let txn = self.doc.transact();
        let (_, map) = find_game(&self.games, &txn, game_id)?;
        read_game(&map, &txn)
    }

    pub fn game_count(&self) -> usize {
        let txn = self.doc.transact();
        self.games.len(&txn) as usize
    }

    /// Current node of a game's local machine.
    pub fn machine_state(&self, game_id: &str) -> Option<DuelState> {
        self.bindings.get(game_id).map(|b| b.state().value)
    }

    pub fn binding(&self, game_id: &str) -> Option<&SharedMachine> {
        self.bindings.get(game_id)
    }

    pub fn binding_mut(&mut self, game_id: &str) -> Option<&mut SharedMachine> {
        self.bindings.get_mut(game_id)
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// Earliest pending machine deadline across all games.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.bindings.values().filter_map(|b| b.next_deadline()).min()
    }

    /// Fire every machine timer due at `now`. Returns how many fired.
    pub fn advance_timers(&mut self, now: Instant) -> usize {
        let due: Vec<GameId> = self
            .bindings
            .iter()
            .filter(|(_, b)| b.next_deadline().is_some_and(|d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut fired = 0;
        for game_id in due {
            let update = {
                let mut txn = self.doc.transact_mut();
                let Some((_, map)) = find_game(&self.games, &txn, &game_id) else {
                    continue;
                };
                let Some(binding) = self.bindings.get_mut(&game_id) else {
                    continue;
                };
                let mut record = YrsGameRecord::new(map, &mut txn);
                if binding.advance_timers(now, &mut record).is_none() {
                    continue;
                }
                fired += 1;
                let dirty = record.is_dirty();
                dirty.then(|| txn.encode_update_v1())
            };
            if let Some(update) = update {
                self.commit(update);
            }
        }
        fired
    }

    // ── Replication ──────────────────────────────────────────────────

    /// Apply a v1 update from another peer and reconcile the machines.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> Result<(), LobbyError> {
        let update = Update::decode_v1(update).map_err(|e| LobbyError::InvalidUpdate(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| LobbyError::ApplyUpdate(e.to_string()))?;
        }
        self.revision += 1;
        self.sync_bindings();
        Ok(())
    }

    /// Mount machines for new games, reconcile existing ones, drop the
    /// machines of deleted games.
    fn sync_bindings(&mut self) {
        let txn = self.doc.transact();
        let present = game_maps(&self.games, &txn);

        self.bindings.retain(|id, binding| {
            let alive = present.iter().any(|(present_id, _)| present_id == id);
            if !alive {
                binding.stop();
                log::debug!("Game {id} removed remotely");
            }
            alive
        });

        for (game_id, map) in present {
            let record = YrsGameView::new(map, &txn);
            match self.bindings.entry(game_id) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().reconcile(&record);
                }
                Entry::Vacant(entry) => {
                    let machine = DuelMachine::new(self.name.clone(), entry.key().as_str())
                        .with_playing_duration(self.playing_duration);
                    entry.insert(SharedMachine::mount(machine, &record));
                }
            }
        }
    }

    /// Drain the updates produced by local mutations, oldest first.
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    /// Encoded state vector, the first step of the sync handshake.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything the holder of `state_vector` is missing.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, LobbyError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| LobbyError::InvalidStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// The whole document as one update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

impl std::fmt::Debug for Lobby {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lobby")
            .field("name", &self.name)
            .field("bindings", &self.bindings.len())
            .field("outbox", &self.outbox.len())
            .field("revision", &self.revision)
            .finish()
    }
}
