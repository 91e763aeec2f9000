//! Shared types for the typerace lobby: domain views, wire events, and errors.

pub mod api;
pub mod error;
pub mod lobby;

pub use error::{ErrorKind, LobbyError};
pub use lobby::{
    Account, AccountId, Article, ConnectionId, Difficulty, GameMode, LeaderboardEntry, Phase,
    PlayerStatus, PlayerView, Podium, RaceResult, RoomSnapshot, RoomSummary, ScoreRow, Standing,
};
