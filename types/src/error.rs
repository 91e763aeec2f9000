use crate::lobby::AccountId;
use serde::Serialize;
use thiserror::Error as ThisError;

/// Coarse classification of lobby failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InsufficientFunds,
    InvalidPayload,
    BackendUnavailable,
    Unauthorized,
    /// A state-machine precondition did not hold (full room, wrong phase).
    Rejected,
}

/// Errors surfaced by lobby operations and the persistence adapter.
///
/// Every variant is recoverable: the action is rejected, no state changes, and the
/// originating connection is told why.
#[derive(Clone, Debug, ThisError, PartialEq, Eq)]
pub enum LobbyError {
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("player not found")]
    PlayerNotFound,
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),
    #[error("player is not in a room")]
    NotInRoom,
    #[error("player is already in room {0}")]
    AlreadyInRoom(String),
    #[error("room already exists: {0}")]
    RoomAlreadyExists(String),
    #[error("account already exists: {0}")]
    AccountExists(String),
    #[error("room is full: {0}")]
    RoomFull(String),
    #[error("match already in progress in room {0}")]
    MatchInProgress(String),
    #[error("match is not running in room {0}")]
    MatchNotRunning(String),
    #[error("player has been eliminated")]
    Eliminated,
    #[error("player has already finished the race")]
    AlreadyFinished,
    #[error("account {0} is signed in on another connection")]
    AccountInUse(String),
    #[error("room {0} does not take bets")]
    NotHighStakes(String),
    #[error("authentication required")]
    NotAuthenticated,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("insufficient funds (balance={balance}, required={required})")]
    InsufficientFunds { balance: i64, required: i64 },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl LobbyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LobbyError::RoomNotFound(_)
            | LobbyError::PlayerNotFound
            | LobbyError::AccountNotFound(_)
            | LobbyError::NotInRoom => ErrorKind::NotFound,
            LobbyError::RoomAlreadyExists(_) | LobbyError::AccountExists(_) => {
                ErrorKind::AlreadyExists
            }
            LobbyError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            LobbyError::InvalidPayload(_) => ErrorKind::InvalidPayload,
            LobbyError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            LobbyError::NotAuthenticated | LobbyError::InvalidCredentials => {
                ErrorKind::Unauthorized
            }
            LobbyError::AlreadyInRoom(_)
            | LobbyError::RoomFull(_)
            | LobbyError::MatchInProgress(_)
            | LobbyError::MatchNotRunning(_)
            | LobbyError::Eliminated
            | LobbyError::AlreadyFinished
            | LobbyError::AccountInUse(_)
            | LobbyError::NotHighStakes(_) => ErrorKind::Rejected,
        }
    }

    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            LobbyError::RoomNotFound(_) => "ROOM_NOT_FOUND",
            LobbyError::PlayerNotFound => "PLAYER_NOT_FOUND",
            LobbyError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LobbyError::NotInRoom => "NOT_IN_ROOM",
            LobbyError::AlreadyInRoom(_) => "ALREADY_IN_ROOM",
            LobbyError::RoomAlreadyExists(_) => "ROOM_ALREADY_EXISTS",
            LobbyError::AccountExists(_) => "ACCOUNT_EXISTS",
            LobbyError::RoomFull(_) => "ROOM_FULL",
            LobbyError::MatchInProgress(_) => "MATCH_IN_PROGRESS",
            LobbyError::MatchNotRunning(_) => "MATCH_NOT_RUNNING",
            LobbyError::Eliminated => "ELIMINATED",
            LobbyError::AlreadyFinished => "ALREADY_FINISHED",
            LobbyError::AccountInUse(_) => "ACCOUNT_IN_USE",
            LobbyError::NotHighStakes(_) => "NOT_HIGH_STAKES",
            LobbyError::NotAuthenticated => "NOT_AUTHENTICATED",
            LobbyError::InvalidCredentials => "INVALID_CREDENTIALS",
            LobbyError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LobbyError::InvalidPayload(_) => "INVALID_PAYLOAD",
            LobbyError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        LobbyError::InvalidPayload(message.into())
    }

    pub fn backend(err: impl std::fmt::Display) -> Self {
        LobbyError::BackendUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(LobbyError::RoomNotFound("a".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            LobbyError::RoomAlreadyExists("a".into()).kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            LobbyError::InsufficientFunds { balance: 5, required: 10 }.kind(),
            ErrorKind::InsufficientFunds
        );
        assert_eq!(LobbyError::invalid("bad").kind(), ErrorKind::InvalidPayload);
        assert_eq!(
            LobbyError::backend("db down").kind(),
            ErrorKind::BackendUnavailable
        );
        assert_eq!(LobbyError::RoomFull("a".into()).kind(), ErrorKind::Rejected);
        assert_eq!(LobbyError::AlreadyFinished.kind(), ErrorKind::Rejected);
        assert_eq!(LobbyError::AccountInUse("ada".into()).code(), "ACCOUNT_IN_USE");
    }

    #[test]
    fn messages_include_context() {
        let err = LobbyError::InsufficientFunds { balance: 40, required: 100 };
        assert_eq!(
            err.to_string(),
            "insufficient funds (balance=40, required=100)"
        );
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
    }
}
