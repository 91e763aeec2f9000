//! Lobby domain types: rooms, players, scoreboards, and the views sent to clients.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Smallest room capacity accepted at creation.
pub const MIN_CAPACITY: u8 = 2;
/// Largest room capacity accepted at creation.
pub const MAX_CAPACITY: u8 = 4;
/// Capacity used when a create request omits one.
pub const DEFAULT_CAPACITY: u8 = 4;
/// Longest room or display name accepted, in characters, after trimming.
pub const MAX_NAME_LEN: usize = 32;

/// Persisted account identifier.
pub type AccountId = i64;

/// Opaque per-connection identifier, minted fresh by the transport for every socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub const ALL: [Difficulty; 3] = [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard];

    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

impl FromStr for Difficulty {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "easy" => Ok(Self::Easy),
            "medium" => Ok(Self::Medium),
            "hard" => Ok(Self::Hard),
            _ => Err("valid values: easy, medium, hard"),
        }
    }
}

/// Room variant. High-stakes rooms charge an entry fee into the pot and run sudden-death.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GameMode {
    #[default]
    Normal,
    #[serde(alias = "high-stakes", alias = "highstakes", alias = "high_stakes")]
    HighStakes,
}

impl GameMode {
    pub fn is_high_stakes(&self) -> bool {
        matches!(self, GameMode::HighStakes)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GameMode::Normal => "normal",
            GameMode::HighStakes => "highStakes",
        }
    }
}

/// Position of a room in the match lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    #[default]
    Waiting,
    FullPendingReady,
    Countdown,
    Playing,
    Finished,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Waiting => "waiting",
            Phase::FullPendingReady => "fullPendingReady",
            Phase::Countdown => "countdown",
            Phase::Playing => "playing",
            Phase::Finished => "finished",
        }
    }

    /// Phases in which new members may still be admitted.
    pub fn is_joinable(&self) -> bool {
        matches!(self, Phase::Waiting | Phase::FullPendingReady)
    }

    /// Phases in which readiness may be toggled.
    pub fn accepts_ready(&self) -> bool {
        matches!(self, Phase::Waiting | Phase::FullPendingReady | Phase::Countdown)
    }
}

/// Player status. Disconnected players are represented by absence from the registry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlayerStatus {
    NotJoined,
    #[default]
    Waiting,
    Ready,
    Playing,
    Finished,
}

/// Per-room, per-player live progress record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRow {
    pub connection_id: ConnectionId,
    pub display_name: Option<String>,
    pub articles_completed: u32,
    pub current_article_progress: f64,
    pub error_count: u32,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<f64>,
}

impl ScoreRow {
    pub fn new(connection_id: ConnectionId, display_name: Option<String>) -> Self {
        Self {
            connection_id,
            display_name,
            articles_completed: 0,
            current_article_progress: 0.0,
            error_count: 0,
            finished: false,
            milestone: None,
            elapsed_time: None,
        }
    }

    /// Zeroes progress while keeping identity.
    pub fn reset(&mut self) {
        *self = Self::new(self.connection_id, self.display_name.take());
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub connection_id: ConnectionId,
    pub account_id: Option<AccountId>,
    pub display_name: Option<String>,
    pub status: PlayerStatus,
    pub current_room: Option<String>,
    pub avatar_ref: Option<String>,
}

/// Lobby listing entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub name: String,
    pub difficulty: Difficulty,
    pub mode: GameMode,
    pub capacity: u8,
    pub players: usize,
    pub phase: Phase,
    pub pot: i64,
}

/// Full room state as seen by a member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub name: String,
    pub difficulty: Difficulty,
    pub mode: GameMode,
    pub capacity: u8,
    pub phase: Phase,
    pub pot: i64,
    pub entry_fee: i64,
    pub members: Vec<PlayerView>,
    pub scoreboard: Vec<ScoreRow>,
    pub eliminated: Vec<ConnectionId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Standing {
    pub rank: usize,
    pub eliminated: bool,
    #[serde(flatten)]
    pub score: ScoreRow,
}

/// Ranked result broadcast when a room finishes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Podium {
    pub room_name: String,
    pub standings: Vec<Standing>,
    pub winner: Option<ConnectionId>,
    pub pot: i64,
}

/// Recent-results cache entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub display_name: String,
    pub elapsed_time: f64,
    pub error_count: u32,
}

/// A typing challenge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub username: String,
    pub balance: i64,
    pub profile_image: Option<String>,
}

/// Finished-race record handed to the persistence layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceResult {
    pub account_id: Option<AccountId>,
    pub display_name: String,
    pub room_name: String,
    pub difficulty: Difficulty,
    pub elapsed_time: f64,
    pub error_count: u32,
    pub articles_completed: u32,
}
