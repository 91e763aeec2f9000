//! Wire protocol for the lobby socket and the HTTP surface.
//!
//! Socket frames are JSON text of the form `{"event": "<name>", "data": <payload>}`.
//! Several inbound payloads accept more than one shape (a bare room name or an object);
//! they are normalized here into one typed request per action before reaching the core.

use crate::error::LobbyError;
use crate::lobby::{
    Account, AccountId, Article, ConnectionId, Difficulty, GameMode, LeaderboardEntry,
    PlayerView, Podium, RoomSnapshot, RoomSummary, ScoreRow, DEFAULT_CAPACITY, MAX_CAPACITY,
    MAX_NAME_LEN, MIN_CAPACITY,
};
use serde::{Deserialize, Deserializer, Serialize};

/// Client to server events.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    Register(Credentials),
    Login(Credentials),
    SaveUsername(String),
    CreateRoom(CreateRoomPayload),
    JoinRoom(JoinRoomPayload),
    LeaveRoom(RoomRef),
    PlayerReady(bool),
    PlaceBet(PlaceBetPayload),
    ArticleCompleted(Option<RoomScope>),
    UpdateProgress(ProgressPayload),
    PlayerMilestone(MilestonePayload),
    PlayerError(Option<RoomScope>),
    GameEnded(GameEndedPayload),
    TimeOut(Option<RoomScope>),
    GetRooms,
    IsRoomFull(RoomRef),
    GetArticles(Option<ArticlesQuery>),
    GetLeaderboard,
}

impl ClientEvent {
    /// Event name, echoed back in `actionError`.
    pub fn action(&self) -> &'static str {
        match self {
            ClientEvent::Register(_) => "register",
            ClientEvent::Login(_) => "login",
            ClientEvent::SaveUsername(_) => "saveUsername",
            ClientEvent::CreateRoom(_) => "createRoom",
            ClientEvent::JoinRoom(_) => "joinRoom",
            ClientEvent::LeaveRoom(_) => "leaveRoom",
            ClientEvent::PlayerReady(_) => "playerReady",
            ClientEvent::PlaceBet(_) => "placeBet",
            ClientEvent::ArticleCompleted(_) => "articleCompleted",
            ClientEvent::UpdateProgress(_) => "updateProgress",
            ClientEvent::PlayerMilestone(_) => "playerMilestone",
            ClientEvent::PlayerError(_) => "playerError",
            ClientEvent::GameEnded(_) => "gameEnded",
            ClientEvent::TimeOut(_) => "timeOut",
            ClientEvent::GetRooms => "getRooms",
            ClientEvent::IsRoomFull(_) => "isRoomFull",
            ClientEvent::GetArticles(_) => "getArticles",
            ClientEvent::GetLeaderboard => "getLeaderboard",
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomFields {
    #[serde(alias = "roomName")]
    pub name: String,
    #[serde(default)]
    pub difficulty: Option<Difficulty>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub max_players: Option<i64>,
    #[serde(default)]
    pub game_mode: Option<GameMode>,
    #[serde(default)]
    pub user_id: Option<AccountId>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum CreateRoomPayload {
    Name(String),
    Fields(CreateRoomFields),
}

/// Normalized room creation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateRoomRequest {
    pub name: String,
    pub difficulty: Difficulty,
    pub mode: GameMode,
    pub capacity: u8,
    /// Display name offered alongside the request, applied when the player has none yet.
    pub display_name: Option<String>,
}

impl CreateRoomPayload {
    /// The claimed `userId` is not trusted; the account bound at login is authoritative.
    pub fn into_request(self) -> Result<CreateRoomRequest, LobbyError> {
        let fields = match self {
            CreateRoomPayload::Name(name) => CreateRoomFields {
                name,
                ..Default::default()
            },
            CreateRoomPayload::Fields(fields) => fields,
        };
        let name = normalize_name("room name", &fields.name)?;
        let capacity = match fields.max_players {
            None => DEFAULT_CAPACITY,
            Some(value) if (MIN_CAPACITY as i64..=MAX_CAPACITY as i64).contains(&value) => {
                value as u8
            }
            Some(value) => {
                return Err(LobbyError::invalid(format!(
                    "maxPlayers must be between {MIN_CAPACITY} and {MAX_CAPACITY}, got {value}"
                )))
            }
        };
        Ok(CreateRoomRequest {
            name,
            difficulty: fields.difficulty.unwrap_or_default(),
            mode: fields.game_mode.unwrap_or_default(),
            capacity,
            display_name: optional_display_name(fields.username),
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum JoinRoomPayload {
    Name(String),
    Fields {
        #[serde(rename = "roomName", alias = "name")]
        room_name: String,
        #[serde(rename = "userId", default)]
        user_id: Option<AccountId>,
        #[serde(default)]
        username: Option<String>,
    },
}

/// Normalized join request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinRoomRequest {
    pub name: String,
    pub display_name: Option<String>,
}

impl JoinRoomPayload {
    pub fn into_request(self) -> Result<JoinRoomRequest, LobbyError> {
        let (name, username) = match self {
            JoinRoomPayload::Name(name) => (name, None),
            JoinRoomPayload::Fields {
                room_name,
                username,
                ..
            } => (room_name, username),
        };
        Ok(JoinRoomRequest {
            name: normalize_name("room name", &name)?,
            display_name: optional_display_name(username),
        })
    }
}

/// A room addressed either by bare name or `{roomName}`.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum RoomRef {
    Name(String),
    Fields {
        #[serde(rename = "roomName", alias = "name")]
        room_name: String,
    },
}

impl RoomRef {
    pub fn into_name(self) -> Result<String, LobbyError> {
        let raw = match self {
            RoomRef::Name(name) => name,
            RoomRef::Fields { room_name } => room_name,
        };
        normalize_name("room name", &raw)
    }
}

/// Optional room hint on player-scoped events. The server resolves the room from the
/// player record; a mismatching hint is rejected.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoomScope {
    pub room_name: Option<String>,
}

pub fn scope_hint(scope: Option<RoomScope>) -> Option<String> {
    scope
        .and_then(|scope| scope.room_name)
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceBetPayload {
    pub room_name: String,
    #[serde(deserialize_with = "lenient_i64")]
    pub amount: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProgressPayload {
    #[serde(alias = "percent", alias = "percentage")]
    pub progress: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MilestonePayload {
    pub milestone: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEndedPayload {
    #[serde(alias = "time")]
    pub elapsed_time: f64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ArticlesQuery {
    Difficulty(Difficulty),
    Fields { difficulty: Difficulty },
}

impl ArticlesQuery {
    pub fn difficulty(&self) -> Difficulty {
        match self {
            ArticlesQuery::Difficulty(difficulty) | ArticlesQuery::Fields { difficulty } => {
                *difficulty
            }
        }
    }
}

/// Trims and bounds a user-supplied name.
pub fn normalize_name(label: &str, raw: &str) -> Result<String, LobbyError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LobbyError::invalid(format!("{label} is required")));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(LobbyError::invalid(format!(
            "{label} must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn optional_display_name(raw: Option<String>) -> Option<String> {
    raw.and_then(|name| normalize_name("username", &name).ok())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Lenient {
    fn into_i64(self) -> Result<i64, String> {
        match self {
            Lenient::Int(value) => Ok(value),
            Lenient::Float(value)
                if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 =>
            {
                Ok(value as i64)
            }
            Lenient::Float(value) => Err(format!("expected an integer, got {value}")),
            Lenient::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| format!("expected an integer, got {text:?}")),
        }
    }
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Lenient::deserialize(deserializer)?
        .into_i64()
        .map_err(serde::de::Error::custom)
}

fn lenient_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Lenient>::deserialize(deserializer)?
        .map(Lenient::into_i64)
        .transpose()
        .map_err(serde::de::Error::custom)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<Account>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AuthResult {
    pub fn ok(account: Account) -> Self {
        Self {
            success: true,
            account: Some(account),
            code: None,
            message: None,
        }
    }

    pub fn failed(err: &LobbyError) -> Self {
        Self {
            success: false,
            account: None,
            code: Some(err.code()),
            message: Some(err.to_string()),
        }
    }
}

/// Server to client events.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    Connected {
        connection_id: ConnectionId,
    },
    UpdatePlayerData(Vec<PlayerView>),
    RoomData(RoomSnapshot),
    UpdateRooms(Vec<RoomSummary>),
    UpdateRoomPlayers {
        room_name: String,
        players: Vec<PlayerView>,
    },
    RoomFull {
        room_name: String,
        full: bool,
    },
    RequestReady {
        room_name: String,
    },
    StartCountdown {
        room_name: String,
        seconds: u64,
    },
    GameStarted {
        room_name: String,
        difficulty: Difficulty,
        mode: GameMode,
    },
    LeaderboardUpdateInRoom {
        room_name: String,
        scoreboard: Vec<ScoreRow>,
    },
    UpdateTotalPot {
        room_name: String,
        pot: i64,
    },
    BetConfirmed {
        room_name: String,
        amount: i64,
        balance: i64,
    },
    ShowPodium(Podium),
    PlayerLeft {
        room_name: String,
        connection_id: ConnectionId,
        display_name: Option<String>,
    },
    PlayerEliminated {
        room_name: String,
        connection_id: ConnectionId,
        display_name: Option<String>,
    },
    EliminatedFromGame {
        room_name: String,
    },
    TimeRanOut {
        room_name: String,
    },
    RegisterResult(AuthResult),
    LoginResult(AuthResult),
    ArticlesData {
        difficulty: Difficulty,
        articles: Vec<Article>,
    },
    LeaderboardData(Vec<LeaderboardEntry>),
    ActionError {
        action: String,
        code: &'static str,
        message: String,
    },
}

impl ServerEvent {
    pub fn action_error(action: impl Into<String>, err: &LobbyError) -> Self {
        ServerEvent::ActionError {
            action: action.into(),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMoneyRequest {
    pub user_id: AccountId,
    #[serde(deserialize_with = "lenient_i64")]
    pub amount: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MoneyResponse {
    pub money: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfoResponse {
    pub id: AccountId,
    pub username: String,
    pub money: i64,
    pub profile_image: Option<String>,
}

impl From<Account> for UserInfoResponse {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            username: account.username,
            money: account.balance,
            profile_image: account.profile_image,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileImageResponse {
    pub profile_image: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub profile_image: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
