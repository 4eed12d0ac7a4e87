//! Lobby entities: players, their colors, and duel games.
//!
//! Games live inside the replicated document (see [`crate::registry`]);
//! the types here are the plain snapshots handed to callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::LobbyError;

/// Opaque player identifier.
pub type PlayerId = String;
/// Opaque game identifier.
pub type GameId = String;

/// Length of generated ids.
const ID_LEN: usize = 12;
/// Exclusive upper bound of generated elo ratings.
const MAX_ELO: u128 = 2200;
/// Number of hues in the rainbow palette.
const PALETTE_STEPS: u32 = 1000;

/// Generate a fresh opaque id (12 lowercase hex characters).
pub fn make_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple[..ID_LEN].to_string()
}

/// Generate a display name of 4 to 10 characters.
pub fn make_username() -> String {
    let uuid = Uuid::new_v4();
    // The last byte picks the length, the leading hex digits the name.
    let len = 4 + (uuid.as_bytes()[15] % 7) as usize;
    uuid.simple().to_string()[..len].to_string()
}

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGB color carried on the wire as `#rrggbb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlayerColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PlayerColor {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Vibrant, evenly spaced hues: `step` out of `num_steps` around the
    /// color wheel at full saturation and value.
    pub fn rainbow(step: u32, num_steps: u32) -> Self {
        let h = step as f32 / num_steps.max(1) as f32;
        let i = (h * 6.0).floor() as u32;
        let f = h * 6.0 - i as f32;
        let q = 1.0 - f;

        let (r, g, b) = match i % 6 {
            0 => (1.0, f, 0.0),
            1 => (q, 1.0, 0.0),
            2 => (0.0, 1.0, f),
            3 => (0.0, q, 1.0),
            4 => (f, 0.0, 1.0),
            _ => (1.0, 0.0, q),
        };
        Self::rgb(channel(r), channel(g), channel(b))
    }

    /// Stable palette color for a seed (same seed, same color).
    pub fn from_seed(seed: u128) -> Self {
        Self::rainbow((seed % PALETTE_STEPS as u128) as u32, PALETTE_STEPS)
    }

    /// Pick a random palette color.
    pub fn random() -> Self {
        Self::from_seed(Uuid::new_v4().as_u128())
    }

    /// `#rrggbb` form.
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

fn channel(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0) as u8
}

impl Default for PlayerColor {
    fn default() -> Self {
        Self::rgb(0x42, 0x85, 0xf4)
    }
}

impl fmt::Display for PlayerColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for PlayerColor {
    type Err = LobbyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix('#')
            .filter(|h| h.len() == 6 && h.is_ascii())
            .ok_or_else(|| LobbyError::InvalidColor(s.to_string()))?;
        let parse = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16).map_err(|_| LobbyError::InvalidColor(s.to_string()))
        };
        Ok(Self::rgb(parse(0..2)?, parse(2..4)?, parse(4..6)?))
    }
}

impl TryFrom<String> for PlayerColor {
    type Error = LobbyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PlayerColor> for String {
    fn from(color: PlayerColor) -> Self {
        color.to_hex()
    }
}

// ───────────────────────────────────────────────────────────────────
// Players
// ───────────────────────────────────────────────────────────────────

/// A lobby participant. `id` never changes for the lifetime of the process;
/// the other fields belong to the owning peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub username: String,
    pub elo: u32,
    pub color: PlayerColor,
}

impl Player {
    /// Create a player with a fresh id, elo and palette color.
    pub fn new(username: impl Into<String>) -> Self {
        let seed = Uuid::new_v4().as_u128();
        Self {
            id: format!("{seed:032x}")[..ID_LEN].to_string(),
            username: username.into(),
            elo: ((seed >> 64) % MAX_ELO) as u32,
            color: PlayerColor::from_seed(seed >> 32),
        }
    }

    /// Create a player with a generated username.
    pub fn random() -> Self {
        Self::new(make_username())
    }

    /// Create with explicit id (for testing)
    pub fn with_id(id: impl Into<PlayerId>, username: impl Into<String>) -> Self {
        let id = id.into();
        let seed = id.bytes().fold(0u128, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u128));
        Self {
            id,
            username: username.into(),
            elo: (seed % MAX_ELO) as u32,
            color: PlayerColor::from_seed(seed),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Games
// ───────────────────────────────────────────────────────────────────

/// How many players a game accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GameMode {
    #[default]
    #[serde(rename = "duel")]
    Duel,
    #[serde(rename = "free-for-all")]
    FreeForAll,
}

impl GameMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameMode::Duel => "duel",
            GameMode::FreeForAll => "free-for-all",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "duel" => Some(GameMode::Duel),
            "free-for-all" => Some(GameMode::FreeForAll),
            _ => None,
        }
    }

    /// Player cap, `None` when unlimited.
    pub fn max_players(&self) -> Option<usize> {
        match self {
            GameMode::Duel => Some(2),
            GameMode::FreeForAll => None,
        }
    }
}

/// Snapshot of one game record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: GameId,
    /// `players[0]` is the host.
    pub players: Vec<Player>,
    pub mode: GameMode,
    /// Serialized machine state, absent until the first transition.
    pub state: Option<String>,
    pub version: u64,
}

impl Game {
    pub fn host(&self) -> Option<&Player> {
        self.players.first()
    }

    pub fn opponent(&self) -> Option<&Player> {
        self.players.get(1)
    }

    pub fn has_player(&self, player_id: &str) -> bool {
        self.players.iter().any(|p| p.id == player_id)
    }

    pub fn is_full(&self) -> bool {
        self.mode
            .max_players()
            .is_some_and(|max| self.players.len() >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_id_length() {
        let id = make_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(make_id(), make_id());
    }

    #[test]
    fn test_make_username_length() {
        let mut lengths = std::collections::HashSet::new();
        for _ in 0..500 {
            let name = make_username();
            assert!((4..=10).contains(&name.len()), "bad length {}", name.len());
            assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
            lengths.insert(name.len());
        }
        assert!(lengths.len() > 1);
    }

    #[test]
    fn test_rainbow_primary_hues() {
        assert_eq!(PlayerColor::rainbow(0, 6), PlayerColor::rgb(255, 0, 0));
        assert_eq!(PlayerColor::rainbow(2, 6), PlayerColor::rgb(0, 255, 0));
        assert_eq!(PlayerColor::rainbow(4, 6), PlayerColor::rgb(0, 0, 255));
    }

    #[test]
    fn test_color_from_seed_stable() {
        assert_eq!(PlayerColor::from_seed(42), PlayerColor::from_seed(42));
        assert_eq!(PlayerColor::from_seed(42), PlayerColor::from_seed(1042));
    }

    #[test]
    fn test_color_hex_parse() {
        let color: PlayerColor = "#ff8000".parse().unwrap();
        assert_eq!(color, PlayerColor::rgb(255, 128, 0));
        assert_eq!(color.to_hex(), "#ff8000");
    }

    #[test]
    fn test_color_rejects_garbage() {
        assert!("ff8000".parse::<PlayerColor>().is_err());
        assert!("#ff80".parse::<PlayerColor>().is_err());
        assert!("#gg0000".parse::<PlayerColor>().is_err());
        assert!("#ééé".parse::<PlayerColor>().is_err());
    }

    #[test]
    fn test_player_json_uses_hex_color() {
        let player = Player {
            id: "p1".into(),
            username: "alice".into(),
            elo: 1200,
            color: PlayerColor::rgb(1, 2, 3),
        };
        let json = serde_json::to_string(&player).unwrap();
        assert!(json.contains("\"#010203\""));
        let back: Player = serde_json::from_str(&json).unwrap();
        assert_eq!(back, player);
    }

    #[test]
    fn test_player_json_rejects_bad_color() {
        let json = r#"{"id":"p1","username":"a","elo":1,"color":"blue"}"#;
        assert!(serde_json::from_str::<Player>(json).is_err());
    }

    #[test]
    fn test_random_player_ranges() {
        let p = Player::random();
        assert_eq!(p.id.len(), 12);
        assert!(p.elo < 2200);
    }

    #[test]
    fn test_game_mode_names() {
        assert_eq!(GameMode::from_name("duel"), Some(GameMode::Duel));
        assert_eq!(GameMode::from_name("free-for-all"), Some(GameMode::FreeForAll));
        assert_eq!(GameMode::from_name("battle"), None);
        assert_eq!(GameMode::FreeForAll.as_str(), "free-for-all");
    }

    fn duel(host: Player) -> Game {
        Game {
            id: make_id(),
            players: vec![host],
            mode: GameMode::Duel,
            state: None,
            version: 0,
        }
    }

    #[test]
    fn test_duel_with_host_only() {
        let host = Player::with_id("h", "host");
        let game = duel(host.clone());
        assert_eq!(game.host(), Some(&host));
        assert!(game.opponent().is_none());
        assert!(!game.is_full());
    }

    #[test]
    fn test_duel_full_at_two() {
        let mut game = duel(Player::with_id("h", "host"));
        game.players.push(Player::with_id("o", "opp"));
        assert!(game.is_full());
        assert_eq!(game.opponent().map(|p| p.id.as_str()), Some("o"));
        assert!(game.has_player("o"));
        assert!(!game.has_player("x"));
    }

    #[test]
    fn test_free_for_all_never_full() {
        let mut game = duel(Player::with_id("h", "host"));
        game.mode = GameMode::FreeForAll;
        for i in 0..10 {
            game.players.push(Player::with_id(format!("p{i}"), "p"));
        }
        assert!(!game.is_full());
    }
}
