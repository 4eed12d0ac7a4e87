//! # lobby-core: Replicated duel lobby
//!
//! A lobby is a list of two-player games held in a shared `yrs` document.
//! Every peer runs its own copy of each game's state machine and keeps it
//! consistent with the others through a `(state, version)` pair stored on the
//! game record.
//!
//! ```text
//! ┌──────────────┐  create / join / delete   ┌──────────────────────┐
//! │    Lobby     │ ─────────────────────────►│ yrs Doc: games[...]  │
//! │  (registry)  │                           └──────────┬───────────┘
//! └──────┬───────┘                                      │ v1 updates
//!        │ one per game                                 ▼
//! ┌──────┴───────┐   persist (state, v+1)      remote peers
//! │SharedMachine │ ◄── reconcile on remote update ──────┘
//! │ Interpreter  │
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: players, colors, game snapshots
//! - [`machine`]: duel state machine and interpreter
//! - [`binding`]: interpreter ↔ shared record binding
//! - [`registry`]: the [`Lobby`] session registry

pub mod binding;
pub mod error;
pub mod machine;
pub mod model;
pub mod registry;

pub use binding::{RecordView, SharedMachine, SharedRecord};
pub use error::LobbyError;
pub use machine::{
    DuelEvent, DuelMachine, DuelState, Interpreter, InterpreterStatus, ListenerId, MachineAction,
    MachineContext, MachineSnapshot, Transition, PLAYING_DURATION,
};
pub use model::{make_id, make_username, Game, GameId, GameMode, Player, PlayerColor, PlayerId};
pub use registry::{JoinOutcome, Lobby, YrsGameRecord, YrsGameView, GAMES_KEY};
