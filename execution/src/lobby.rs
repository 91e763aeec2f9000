//! The lobby: connection registry, room registry, and match rules behind one owner.
//!
//! Every operation runs to completion against `&mut Lobby` and reports what should be
//! broadcast through an [`Outbox`]. Operations validate before they mutate, so an `Err`
//! means nothing changed. Work that needs the persistence adapter is split into a
//! `plan_*` step (validate, say what must be paid) and a commit step that re-validates
//! after the adapter call returns.

use crate::dispatch::{CreditReason, Effect, Outbox};
use crate::matchplay::{self, FinishReason};
use crate::players::{ConnectionRegistry, Player};
use crate::rooms::{Room, RoomRegistry};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};
use typerace_types::api::{normalize_name, CreateRoomRequest, JoinRoomRequest, ServerEvent};
use typerace_types::{
    Account, AccountId, ConnectionId, Difficulty, GameMode, LeaderboardEntry, LobbyError, Phase,
    PlayerStatus, Podium, RaceResult,
};

pub const DEFAULT_ENTRY_FEE: i64 = 100;
pub const DEFAULT_COUNTDOWN: Duration = Duration::from_secs(3);
pub const DEFAULT_LEADERBOARD_CAPACITY: usize = 50;
const GUEST_NAME: &str = "Guest";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LobbyConfig {
    /// Fee charged to enter a high-stakes room; it becomes the member's initial bet.
    pub entry_fee: i64,
    pub countdown: Duration,
    /// Size of the recent-results ring.
    pub leaderboard_capacity: usize,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            entry_fee: DEFAULT_ENTRY_FEE,
            countdown: DEFAULT_COUNTDOWN,
            leaderboard_capacity: DEFAULT_LEADERBOARD_CAPACITY,
        }
    }
}

/// What admission to a room costs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Free,
    Fee { account_id: AccountId, amount: i64 },
    AlreadyMember,
}

/// A fee that was collected before the lobby lock was re-acquired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Payment {
    pub account_id: AccountId,
    pub amount: i64,
}

/// A validated bet change, applied by the ledger before it is committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BetPlan {
    pub room: String,
    pub room_id: u64,
    pub account_id: AccountId,
    pub prior: i64,
    pub amount: i64,
}

impl BetPlan {
    /// Balance movement needed: positive is a deduction, negative a refund.
    pub fn delta(&self) -> i64 {
        self.amount - self.prior
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LobbyStats {
    pub rooms_created: u64,
    pub rooms_deleted: u64,
    pub matches_started: u64,
    pub matches_reset: u64,
    pub matches_finished: u64,
    pub eliminations: u64,
    pub bets_placed: u64,
    pub pots_awarded: u64,
    pub pot_paid: i64,
    pub pot_forfeited: i64,
    /// Credits the ledger refused, waiting for the account to sign in again.
    pub credits_pending: u64,
    pub credits_pending_amount: i64,
}

/// A payout or refund the ledger could not apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingCredit {
    pub account_id: AccountId,
    pub amount: i64,
    pub reason: CreditReason,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LobbySnapshot {
    pub players: usize,
    pub rooms: usize,
    #[serde(flatten)]
    pub stats: LobbyStats,
}

#[derive(Debug)]
pub struct Lobby {
    config: LobbyConfig,
    players: ConnectionRegistry,
    rooms: RoomRegistry,
    leaderboard: VecDeque<LeaderboardEntry>,
    pending_credits: Vec<PendingCredit>,
    stats: LobbyStats,
}

impl Lobby {
    pub fn new(config: LobbyConfig) -> Self {
        Self {
            config,
            players: ConnectionRegistry::default(),
            rooms: RoomRegistry::default(),
            leaderboard: VecDeque::new(),
            pending_credits: Vec::new(),
            stats: LobbyStats::default(),
        }
    }

    pub fn config(&self) -> &LobbyConfig {
        &self.config
    }

    pub fn players(&self) -> &ConnectionRegistry {
        &self.players
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn player(&self, id: &ConnectionId) -> Option<&Player> {
        self.players.find(id)
    }

    pub fn room(&self, name: &str) -> Option<&Room> {
        self.rooms.find(name)
    }

    pub fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        self.leaderboard.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> LobbySnapshot {
        LobbySnapshot {
            players: self.players.len(),
            rooms: self.rooms.len(),
            stats: self.stats,
        }
    }

    // Broadcast helpers.

    fn announce_rooms(&self, out: &mut Outbox) {
        out.to_all(ServerEvent::UpdateRooms(self.rooms.list()));
    }

    fn announce_players(&self, out: &mut Outbox) {
        out.to_all(ServerEvent::UpdatePlayerData(self.players.views()));
    }

    fn announce_roster(&self, room: &Room, out: &mut Outbox) {
        out.to_room(
            room,
            ServerEvent::UpdateRoomPlayers {
                room_name: room.name().to_string(),
                players: room.member_views(&self.players),
            },
        );
    }

    fn announce_scoreboard(&self, room: &Room, out: &mut Outbox) {
        out.to_room(
            room,
            ServerEvent::LeaderboardUpdateInRoom {
                room_name: room.name().to_string(),
                scoreboard: room.scoreboard().to_vec(),
            },
        );
    }

    fn announce_pot(&self, room: &Room, out: &mut Outbox) {
        out.to_room(
            room,
            ServerEvent::UpdateTotalPot {
                room_name: room.name().to_string(),
                pot: room.pot(),
            },
        );
    }

    // Connections.

    pub fn connect(&mut self, id: ConnectionId, out: &mut Outbox) {
        self.players.on_connect(id);
        debug!(connection = %id, players = self.players.len(), "connection registered");
        out.to(id, ServerEvent::Connected { connection_id: id });
        out.to(id, ServerEvent::UpdateRooms(self.rooms.list()));
        out.to(id, ServerEvent::UpdatePlayerData(self.players.views()));
    }

    /// Removes the player, first running the same departure path as `leaveRoom`.
    pub fn disconnect(&mut self, id: ConnectionId, out: &mut Outbox) {
        let Some(player) = self.players.find(&id) else {
            debug!(connection = %id, "disconnect for unknown connection");
            return;
        };
        if let Some(room) = player.current_room.clone() {
            self.depart(id, &room, out);
        }
        self.players.on_disconnect(&id);
        debug!(connection = %id, players = self.players.len(), "connection removed");
    }

    /// Rejects authentication while seated: a room may hold fees charged to the old account.
    pub fn check_can_authenticate(&self, id: &ConnectionId) -> Result<(), LobbyError> {
        let player = self.players.get(id)?;
        match &player.current_room {
            Some(room) => Err(LobbyError::AlreadyInRoom(room.clone())),
            None => Ok(()),
        }
    }

    pub fn bind_account(&mut self, id: ConnectionId, account: &Account, out: &mut Outbox) -> Result<(), LobbyError> {
        self.check_can_authenticate(&id)?;
        self.players.bind_account(&id, account)?;
        info!(connection = %id, account = account.id, "account bound");
        self.announce_players(out);
        Ok(())
    }

    pub fn attach_avatar(&mut self, id: ConnectionId, account_id: AccountId, avatar: String, out: &mut Outbox) {
        if self.players.attach_avatar(&id, account_id, avatar) {
            self.announce_players(out);
        } else {
            debug!(connection = %id, account = account_id, "avatar load outlived binding");
        }
    }

    pub fn save_username(&mut self, id: ConnectionId, raw: &str, out: &mut Outbox) -> Result<(), LobbyError> {
        let name = normalize_name("username", raw)?;
        let player = self.players.get_mut(&id)?;
        player.display_name = Some(name.clone());
        let current_room = player.current_room.clone();
        if let Some(room) = current_room.as_deref().and_then(|room| self.rooms.find_mut(room)) {
            room.rename_member(&id, &name);
        }
        match current_room.as_deref().and_then(|room| self.rooms.find(room)) {
            Some(room) => self.announce_roster(room, out),
            None => self.players.set_status(&id, PlayerStatus::NotJoined),
        }
        self.announce_players(out);
        Ok(())
    }

    fn fee_for(&self, player: &Player, mode: GameMode) -> Result<Admission, LobbyError> {
        if !mode.is_high_stakes() {
            return Ok(Admission::Free);
        }
        let account_id = player.account_id.ok_or(LobbyError::NotAuthenticated)?;
        Ok(Admission::Fee {
            account_id,
            amount: self.config.entry_fee,
        })
    }

    fn verify_payment(admission: Admission, payment: Option<Payment>) -> Result<(), LobbyError> {
        match (admission, payment) {
            (Admission::Free, None) | (Admission::AlreadyMember, None) => Ok(()),
            (Admission::Fee { account_id, amount }, Some(paid))
                if paid.account_id == account_id && paid.amount == amount =>
            {
                Ok(())
            }
            (Admission::Fee { .. }, _) => Err(LobbyError::invalid("entry fee changed while the request was processed")),
            (_, Some(_)) => Err(LobbyError::invalid("admission no longer requires a fee")),
        }
    }

    // Room registry.

    pub fn plan_create(&self, id: &ConnectionId, request: &CreateRoomRequest) -> Result<Admission, LobbyError> {
        let player = self.players.get(id)?;
        if let Some(room) = &player.current_room {
            return Err(LobbyError::AlreadyInRoom(room.clone()));
        }
        if self.rooms.contains(&request.name) {
            return Err(LobbyError::RoomAlreadyExists(request.name.clone()));
        }
        self.fee_for(player, request.mode)
    }

    /// Creates the room with its creator as first member. `payment` must match what
    /// [`Lobby::plan_create`] asks for now, not what it asked before the fee was taken.
    pub fn create_room(
        &mut self,
        id: ConnectionId,
        request: &CreateRoomRequest,
        payment: Option<Payment>,
        out: &mut Outbox,
    ) -> Result<(), LobbyError> {
        Self::verify_payment(self.plan_create(&id, request)?, payment)?;
        let entry_fee = if request.mode.is_high_stakes() {
            self.config.entry_fee
        } else {
            0
        };

        let display_name = self
            .players
            .get(&id)?
            .display_name
            .clone()
            .or_else(|| request.display_name.clone());
        let room = self.rooms.create(request, entry_fee)?;
        room.admit(id, display_name.clone())?;
        if let Some(paid) = payment {
            room.set_bet(id, paid.amount);
        }
        let player = self.players.get_mut(&id)?;
        player.display_name = display_name;
        player.current_room = Some(request.name.clone());
        player.status = PlayerStatus::Waiting;
        self.stats.rooms_created += 1;
        info!(
            room = %request.name,
            creator = %id,
            mode = request.mode.as_str(),
            capacity = request.capacity,
            difficulty = request.difficulty.as_str(),
            "room created"
        );

        let room = self.rooms.get(&request.name)?;
        out.to(id, ServerEvent::RoomData(room.snapshot(&self.players)));
        self.announce_roster(room, out);
        if room.mode().is_high_stakes() {
            self.announce_pot(room, out);
        }
        self.announce_rooms(out);
        Ok(())
    }

    pub fn plan_join(&self, id: &ConnectionId, request: &JoinRoomRequest) -> Result<Admission, LobbyError> {
        let player = self.players.get(id)?;
        let room = self.rooms.get(&request.name)?;
        if room.contains(id) {
            return Ok(Admission::AlreadyMember);
        }
        if let Some(current) = &player.current_room {
            return Err(LobbyError::AlreadyInRoom(current.clone()));
        }
        if !room.phase().is_joinable() {
            return Err(LobbyError::MatchInProgress(room.name().to_string()));
        }
        if room.is_full() {
            return Err(LobbyError::RoomFull(room.name().to_string()));
        }
        match self.fee_for(player, room.mode())? {
            Admission::Fee { account_id, .. } => Ok(Admission::Fee {
                account_id,
                amount: room.entry_fee(),
            }),
            admission => Ok(admission),
        }
    }

    /// Adds the player to the room. Joining a room one already belongs to resends the
    /// room state and changes nothing.
    pub fn join_room(
        &mut self,
        id: ConnectionId,
        request: &JoinRoomRequest,
        payment: Option<Payment>,
        out: &mut Outbox,
    ) -> Result<(), LobbyError> {
        let admission = self.plan_join(&id, request)?;
        Self::verify_payment(admission, payment)?;
        if admission == Admission::AlreadyMember {
            let room = self.rooms.get(&request.name)?;
            out.to(id, ServerEvent::RoomData(room.snapshot(&self.players)));
            return Ok(());
        }

        let display_name = self
            .players
            .get(&id)?
            .display_name
            .clone()
            .or_else(|| request.display_name.clone());
        let room = self.rooms.get_mut(&request.name)?;
        room.admit(id, display_name.clone())?;
        if let Some(paid) = payment {
            // A fee forfeited on an earlier departure stays on the same bet line.
            let prior = room.bet(&id);
            room.set_bet(id, prior + paid.amount);
        }
        let filled = room.is_full();
        if filled {
            room.set_phase(Phase::FullPendingReady);
        }
        info!(room = %request.name, connection = %id, members = room.len(), "player joined room");
        let player = self.players.get_mut(&id)?;
        player.display_name = display_name;
        player.current_room = Some(request.name.clone());
        player.status = PlayerStatus::Waiting;

        let room = self.rooms.get(&request.name)?;
        out.to(id, ServerEvent::RoomData(room.snapshot(&self.players)));
        self.announce_roster(room, out);
        if room.mode().is_high_stakes() {
            self.announce_pot(room, out);
        }
        if filled {
            let room_name = room.name().to_string();
            out.to_room(
                room,
                ServerEvent::RoomFull {
                    room_name: room_name.clone(),
                    full: true,
                },
            );
            out.to_room(room, ServerEvent::RequestReady { room_name });
        }
        self.announce_rooms(out);
        Ok(())
    }

    pub fn leave_room(&mut self, id: ConnectionId, name: &str, out: &mut Outbox) -> Result<(), LobbyError> {
        self.players.get(&id)?;
        let room = self.rooms.get(name)?;
        if !room.contains(&id) {
            return Err(LobbyError::NotInRoom);
        }
        self.depart(id, name, out);
        Ok(())
    }

    /// Removes a member, settles its bet, and repairs the room. Shared by leave and
    /// disconnect.
    fn depart(&mut self, id: ConnectionId, name: &str, out: &mut Outbox) {
        let Some(room) = self.rooms.find_mut(name) else {
            warn!(room = %name, connection = %id, "player pointed at a missing room");
            if let Some(player) = self.players.find_mut(&id) {
                player.current_room = None;
            }
            return;
        };
        let display_name = room.row(&id).and_then(|row| row.display_name.clone());
        room.remove(&id);
        let refund = room.release_bet(&id);
        let high_stakes = room.mode().is_high_stakes();

        if let Some(player) = self.players.find_mut(&id) {
            player.current_room = None;
            player.status = PlayerStatus::NotJoined;
            if refund > 0 {
                match player.account_id {
                    Some(account_id) => out.effect(Effect::Credit {
                        connection: id,
                        account_id,
                        amount: refund,
                        reason: CreditReason::Refund,
                    }),
                    None => warn!(room = %name, connection = %id, refund, "refund owed to guest dropped"),
                }
            }
        }
        info!(room = %name, connection = %id, remaining = room.len(), refund, "player left room");

        if room.is_empty() {
            let forfeited = room.pot();
            self.rooms.remove(name);
            self.stats.rooms_deleted += 1;
            if forfeited > 0 {
                self.stats.pot_forfeited += forfeited;
                warn!(room = %name, pot = forfeited, "room emptied with an unclaimed pot");
            }
            info!(room = %name, "room deleted");
            self.announce_rooms(out);
            return;
        }

        let mut reset = false;
        match room.phase() {
            Phase::Playing if !high_stakes => {
                room.set_phase(Phase::Waiting);
                room.reset_scores();
                reset = true;
            }
            Phase::FullPendingReady | Phase::Waiting => {
                let phase = matchplay::lobby_phase(room);
                room.set_phase(phase);
            }
            _ => {}
        }
        if reset {
            self.stats.matches_reset += 1;
            let members = room.members().to_vec();
            for member in &members {
                self.players.set_status(member, PlayerStatus::Waiting);
            }
            info!(room = %name, "match reset to waiting after departure");
        }

        let Some(room) = self.rooms.find(name) else {
            return;
        };
        out.to_room(
            room,
            ServerEvent::PlayerLeft {
                room_name: name.to_string(),
                connection_id: id,
                display_name,
            },
        );
        self.announce_roster(room, out);
        if reset {
            self.announce_scoreboard(room, out);
        }
        if high_stakes {
            self.announce_pot(room, out);
        }

        match room.phase() {
            Phase::Playing => {
                if let Some(reason) = matchplay::finish_reason(room) {
                    self.finish(name, reason, out);
                    return;
                }
            }
            Phase::Waiting | Phase::FullPendingReady => self.evaluate_ready(name, out),
            _ => {}
        }
        self.announce_rooms(out);
    }

    pub fn list_rooms(&self, id: ConnectionId, out: &mut Outbox) {
        out.to(id, ServerEvent::UpdateRooms(self.rooms.list()));
    }

    pub fn is_room_full(&self, id: ConnectionId, name: &str, out: &mut Outbox) -> Result<(), LobbyError> {
        let room = self.rooms.get(name)?;
        out.to(
            id,
            ServerEvent::RoomFull {
                room_name: room.name().to_string(),
                full: room.is_full(),
            },
        );
        Ok(())
    }

    pub fn send_leaderboard(&self, id: ConnectionId, out: &mut Outbox) {
        out.to(id, ServerEvent::LeaderboardData(self.leaderboard()));
    }

    /// Difficulty of the player's current room, if seated.
    pub fn room_difficulty(&self, id: &ConnectionId) -> Option<Difficulty> {
        let name = self.players.find(id)?.current_room.as_deref()?;
        self.rooms.find(name).map(Room::difficulty)
    }

    // Match state machine.

    pub fn set_ready(&mut self, id: ConnectionId, ready: bool, out: &mut Outbox) -> Result<(), LobbyError> {
        let name = self
            .players
            .get(&id)?
            .current_room
            .clone()
            .ok_or(LobbyError::NotInRoom)?;
        let room = self.rooms.get(&name)?;
        if !room.phase().accepts_ready() {
            return Err(LobbyError::MatchInProgress(name));
        }
        let status = if ready {
            PlayerStatus::Ready
        } else {
            PlayerStatus::Waiting
        };
        self.players.set_status(&id, status);
        debug!(room = %name, connection = %id, ready, "readiness changed");
        self.announce_roster(room, out);
        self.evaluate_ready(&name, out);
        Ok(())
    }

    /// Starts the countdown when every member of a pre-match room is ready.
    fn evaluate_ready(&mut self, name: &str, out: &mut Outbox) {
        let Some(room) = self.rooms.find_mut(name) else {
            return;
        };
        if !room.phase().is_joinable() || !matchplay::all_ready(room, &self.players) {
            return;
        }
        room.set_phase(Phase::Countdown);
        let delay = self.config.countdown;
        let room = &*room;
        info!(room = %name, members = room.len(), delay_ms = delay.as_millis() as u64, "countdown armed");
        out.to_room(
            room,
            ServerEvent::StartCountdown {
                room_name: name.to_string(),
                seconds: delay.as_millis().div_ceil(1_000) as u64,
            },
        );
        out.effect(Effect::ArmCountdown {
            room: name.to_string(),
            room_id: room.id(),
            delay,
        });
        self.announce_rooms(out);
    }

    /// Countdown callback. A no-op unless the same room generation is still counting down.
    pub fn start_match(&mut self, name: &str, room_id: u64, out: &mut Outbox) -> bool {
        let Some(room) = self.rooms.find_mut(name) else {
            debug!(room = %name, "countdown fired for a deleted room");
            return false;
        };
        if room.id() != room_id || room.phase() != Phase::Countdown {
            debug!(room = %name, phase = room.phase().as_str(), "stale countdown ignored");
            return false;
        }
        room.set_phase(Phase::Playing);
        room.reset_scores();
        let members = room.members().to_vec();
        for member in &members {
            self.players.set_status(member, PlayerStatus::Playing);
        }
        self.stats.matches_started += 1;
        info!(room = %name, members = members.len(), "match started");

        let Some(room) = self.rooms.find(name) else {
            return false;
        };
        out.to_room(
            room,
            ServerEvent::GameStarted {
                room_name: name.to_string(),
                difficulty: room.difficulty(),
                mode: room.mode(),
            },
        );
        self.announce_roster(room, out);
        self.announce_scoreboard(room, out);
        self.announce_rooms(out);
        true
    }

    /// Resolves the playing room of `id`, honoring an optional client-side room hint.
    ///
    /// Unless `allow_done` is set, the player's row must still be racing: eliminated
    /// players get `Eliminated` and players who already ended get `AlreadyFinished`.
    fn playing_room(
        &self,
        id: &ConnectionId,
        hint: Option<&str>,
        allow_done: bool,
    ) -> Result<String, LobbyError> {
        let name = self
            .players
            .get(id)?
            .current_room
            .clone()
            .ok_or(LobbyError::NotInRoom)?;
        if hint.is_some_and(|hint| hint != name) {
            return Err(LobbyError::NotInRoom);
        }
        let room = self.rooms.get(&name)?;
        if room.phase() != Phase::Playing {
            return Err(LobbyError::MatchNotRunning(name));
        }
        if allow_done {
            return Ok(name);
        }
        if room.is_eliminated(id) {
            return Err(LobbyError::Eliminated);
        }
        if room.row(id).is_some_and(|row| row.finished) {
            return Err(LobbyError::AlreadyFinished);
        }
        Ok(name)
    }

    fn update_row(
        &mut self,
        id: ConnectionId,
        hint: Option<&str>,
        out: &mut Outbox,
        update: impl FnOnce(&mut typerace_types::ScoreRow),
    ) -> Result<String, LobbyError> {
        let name = self.playing_room(&id, hint, false)?;
        let room = self.rooms.get_mut(&name)?;
        let row = room.row_mut(&id).ok_or(LobbyError::NotInRoom)?;
        update(row);
        let room = self.rooms.get(&name)?;
        self.announce_scoreboard(room, out);
        Ok(name)
    }

    pub fn article_completed(&mut self, id: ConnectionId, hint: Option<&str>, out: &mut Outbox) -> Result<(), LobbyError> {
        self.update_row(id, hint, out, |row| {
            row.articles_completed += 1;
            row.current_article_progress = 0.0;
        })?;
        Ok(())
    }

    pub fn update_progress(&mut self, id: ConnectionId, progress: f64, out: &mut Outbox) -> Result<(), LobbyError> {
        if !progress.is_finite() {
            return Err(LobbyError::invalid("progress must be a finite number"));
        }
        let progress = progress.clamp(0.0, 100.0);
        self.update_row(id, None, out, |row| row.current_article_progress = progress)?;
        Ok(())
    }

    pub fn player_milestone(&mut self, id: ConnectionId, milestone: u32, out: &mut Outbox) -> Result<(), LobbyError> {
        self.update_row(id, None, out, |row| row.milestone = Some(milestone))?;
        Ok(())
    }

    /// Counts a typing error. In sudden-death rooms the first error eliminates the player.
    pub fn player_error(&mut self, id: ConnectionId, hint: Option<&str>, out: &mut Outbox) -> Result<(), LobbyError> {
        let name = self.playing_room(&id, hint, false)?;
        let room = self.rooms.get_mut(&name)?;
        let sudden_death = room.mode().is_high_stakes();
        let row = room.row_mut(&id).ok_or(LobbyError::NotInRoom)?;
        row.error_count += 1;
        if !sudden_death {
            let room = self.rooms.get(&name)?;
            self.announce_scoreboard(room, out);
            return Ok(());
        }

        row.finished = true;
        let display_name = row.display_name.clone();
        room.eliminate(id);
        self.players.set_status(&id, PlayerStatus::Finished);
        self.stats.eliminations += 1;
        info!(room = %name, connection = %id, "player eliminated");

        let room = self.rooms.get(&name)?;
        out.to_room(
            room,
            ServerEvent::PlayerEliminated {
                room_name: name.clone(),
                connection_id: id,
                display_name,
            },
        );
        out.to(
            id,
            ServerEvent::EliminatedFromGame {
                room_name: name.clone(),
            },
        );
        self.announce_scoreboard(room, out);
        if let Some(reason) = matchplay::finish_reason(room) {
            self.finish(&name, reason, out);
        }
        Ok(())
    }

    /// Marks the player's race complete and records the result.
    pub fn game_ended(&mut self, id: ConnectionId, elapsed_time: f64, out: &mut Outbox) -> Result<(), LobbyError> {
        if !elapsed_time.is_finite() || elapsed_time < 0.0 {
            return Err(LobbyError::invalid("elapsedTime must be a non-negative number"));
        }
        let name = self.playing_room(&id, None, false)?;
        let account_id = self.players.get(&id)?.account_id;
        let room = self.rooms.get_mut(&name)?;
        let difficulty = room.difficulty();
        let row = room.row_mut(&id).ok_or(LobbyError::NotInRoom)?;
        row.finished = true;
        row.elapsed_time = Some(elapsed_time);
        let display_name = row
            .display_name
            .clone()
            .unwrap_or_else(|| GUEST_NAME.to_string());
        let result = RaceResult {
            account_id,
            display_name: display_name.clone(),
            room_name: name.clone(),
            difficulty,
            elapsed_time,
            error_count: row.error_count,
            articles_completed: row.articles_completed,
        };
        self.players.set_status(&id, PlayerStatus::Finished);

        if self.config.leaderboard_capacity > 0 {
            if self.leaderboard.len() >= self.config.leaderboard_capacity {
                self.leaderboard.pop_front();
            }
            self.leaderboard.push_back(LeaderboardEntry {
                display_name,
                elapsed_time,
                error_count: result.error_count,
            });
        }
        out.effect(Effect::RecordResult(result));

        let room = self.rooms.get(&name)?;
        self.announce_scoreboard(room, out);
        if let Some(reason) = matchplay::finish_reason(room) {
            self.finish(&name, reason, out);
        }
        Ok(())
    }

    /// Client-reported race clock expiry: finishes the room with the scores as they stand.
    pub fn time_out(&mut self, id: ConnectionId, hint: Option<&str>, out: &mut Outbox) -> Result<(), LobbyError> {
        let name = self.playing_room(&id, hint, true)?;
        let room = self.rooms.get(&name)?;
        out.to_room(
            room,
            ServerEvent::TimeRanOut {
                room_name: name.clone(),
            },
        );
        self.finish(&name, FinishReason::TimedOut, out);
        Ok(())
    }

    /// Ranks the room, pays the pot to rank one, and broadcasts the podium.
    fn finish(&mut self, name: &str, reason: FinishReason, out: &mut Outbox) {
        let Some(room) = self.rooms.find_mut(name) else {
            return;
        };
        room.set_phase(Phase::Finished);
        let standings = matchplay::rank(room);
        let pot = room.take_pot();
        let members = room.members().to_vec();
        for member in &members {
            self.players.set_status(member, PlayerStatus::Finished);
        }
        let winner = standings.first().map(|standing| standing.score.connection_id);
        self.stats.matches_finished += 1;

        if pot > 0 {
            let payee = winner.and_then(|id| Some((id, self.players.find(&id)?.account_id?)));
            match payee {
                Some((connection, account_id)) => {
                    self.stats.pots_awarded += 1;
                    self.stats.pot_paid += pot;
                    out.effect(Effect::Credit {
                        connection,
                        account_id,
                        amount: pot,
                        reason: CreditReason::Payout,
                    });
                }
                None => {
                    self.stats.pot_forfeited += pot;
                    warn!(room = %name, pot, "winner has no account; pot forfeited");
                }
            }
        }
        info!(
            room = %name,
            reason = reason.as_str(),
            winner = ?winner,
            pot,
            "match finished"
        );

        let Some(room) = self.rooms.find(name) else {
            return;
        };
        out.to_room(
            room,
            ServerEvent::ShowPodium(Podium {
                room_name: name.to_string(),
                standings,
                winner,
                pot,
            }),
        );
        self.announce_roster(room, out);
        self.announce_rooms(out);
    }

    // Wagers.

    pub fn pending_credits(&self) -> &[PendingCredit] {
        &self.pending_credits
    }

    /// Parks a credit the ledger refused and tells the owed connection, if still present.
    pub fn defer_credit(
        &mut self,
        connection: ConnectionId,
        credit: PendingCredit,
        err: &LobbyError,
        out: &mut Outbox,
    ) {
        self.pending_credits.push(credit);
        self.stats.credits_pending += 1;
        self.stats.credits_pending_amount += credit.amount;
        warn!(
            account = credit.account_id,
            amount = credit.amount,
            reason = credit.reason.action(),
            %err,
            "credit deferred until the account signs in again"
        );
        if self.players.find(&connection).is_some() {
            out.to(connection, ServerEvent::action_error(credit.reason.action(), err));
        }
    }

    /// Removes and returns every credit still owed to `account_id`.
    pub fn take_pending_credits(&mut self, account_id: AccountId) -> Vec<PendingCredit> {
        let (owed, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_credits)
            .into_iter()
            .partition(|credit| credit.account_id == account_id);
        self.pending_credits = rest;
        for credit in &owed {
            self.stats.credits_pending -= 1;
            self.stats.credits_pending_amount -= credit.amount;
        }
        owed
    }

    pub fn plan_bet(&self, id: &ConnectionId, name: &str, amount: i64) -> Result<BetPlan, LobbyError> {
        let player = self.players.get(id)?;
        let room = self.rooms.get(name)?;
        if !room.contains(id) {
            return Err(LobbyError::NotInRoom);
        }
        if !room.mode().is_high_stakes() {
            return Err(LobbyError::NotHighStakes(name.to_string()));
        }
        if !room.phase().accepts_ready() {
            return Err(LobbyError::MatchInProgress(name.to_string()));
        }
        let account_id = player.account_id.ok_or(LobbyError::NotAuthenticated)?;
        if amount < room.entry_fee() {
            return Err(LobbyError::invalid(format!(
                "bet must be at least the entry fee of {}",
                room.entry_fee()
            )));
        }
        Ok(BetPlan {
            room: name.to_string(),
            room_id: room.id(),
            account_id,
            prior: room.bet(id),
            amount,
        })
    }

    /// Applies a bet whose balance movement already succeeded. Fails, without mutating,
    /// if the room or the player's bet changed in the meantime.
    pub fn commit_bet(&mut self, id: ConnectionId, plan: &BetPlan, balance: i64, out: &mut Outbox) -> Result<(), LobbyError> {
        let fresh = self.plan_bet(&id, &plan.room, plan.amount)?;
        if fresh != *plan {
            return Err(LobbyError::invalid("bet changed while it was being processed"));
        }
        let room = self.rooms.get_mut(&plan.room)?;
        room.set_bet(id, plan.amount);
        self.stats.bets_placed += 1;
        info!(room = %plan.room, connection = %id, amount = plan.amount, pot = room.pot(), "bet placed");

        let room = self.rooms.get(&plan.room)?;
        out.to(
            id,
            ServerEvent::BetConfirmed {
                room_name: plan.room.clone(),
                amount: plan.amount,
                balance,
            },
        );
        self.announce_pot(room, out);
        self.announce_rooms(out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Audience;
    use proptest::prelude::*;

    fn lobby() -> Lobby {
        Lobby::new(LobbyConfig::default())
    }

    fn connect(lobby: &mut Lobby) -> ConnectionId {
        let id = ConnectionId::new();
        lobby.connect(id, &mut Outbox::default());
        id
    }

    fn bind(lobby: &mut Lobby, id: ConnectionId, account_id: AccountId) {
        let account = Account {
            id: account_id,
            username: format!("user{account_id}"),
            balance: 1_000,
            profile_image: None,
        };
        lobby.bind_account(id, &account, &mut Outbox::default()).unwrap();
    }

    fn create(name: &str, mode: GameMode, capacity: u8) -> CreateRoomRequest {
        CreateRoomRequest {
            name: name.to_string(),
            difficulty: Difficulty::Easy,
            mode,
            capacity,
            display_name: None,
        }
    }

    fn join(name: &str) -> JoinRoomRequest {
        JoinRoomRequest {
            name: name.to_string(),
            display_name: None,
        }
    }

    fn events(out: &Outbox) -> Vec<&ServerEvent> {
        out.dispatches().iter().map(|dispatch| &dispatch.event).collect()
    }

    fn has_event(out: &Outbox, predicate: impl Fn(&ServerEvent) -> bool) -> bool {
        out.dispatches().iter().any(|dispatch| predicate(&dispatch.event))
    }

    /// Builds a normal room named `name` holding `count` fresh players.
    fn seated(lobby: &mut Lobby, name: &str, capacity: u8, count: usize) -> Vec<ConnectionId> {
        let ids: Vec<_> = (0..count).map(|_| connect(lobby)).collect();
        lobby
            .create_room(ids[0], &create(name, GameMode::Normal, capacity), None, &mut Outbox::default())
            .unwrap();
        for id in &ids[1..] {
            lobby.join_room(*id, &join(name), None, &mut Outbox::default()).unwrap();
        }
        ids
    }

    fn start(lobby: &mut Lobby, name: &str, ids: &[ConnectionId]) {
        for id in ids {
            lobby.set_ready(*id, true, &mut Outbox::default()).unwrap();
        }
        let room_id = lobby.room(name).unwrap().id();
        assert!(lobby.start_match(name, room_id, &mut Outbox::default()));
    }

    fn pay(admission: Admission) -> Option<Payment> {
        match admission {
            Admission::Fee { account_id, amount } => Some(Payment { account_id, amount }),
            _ => None,
        }
    }

    fn assert_invariants(lobby: &Lobby) {
        let mut seen = std::collections::HashSet::new();
        for room in lobby.rooms().iter() {
            assert!(room.len() <= room.capacity() as usize, "capacity exceeded in {}", room.name());
            assert!(!room.is_empty(), "empty room {} still registered", room.name());
            assert_eq!(room.pot(), room.bets().values().sum::<i64>());
            assert_eq!(room.members().len(), room.scoreboard().len());
            for member in room.members() {
                assert!(seen.insert(*member), "{member} seated twice");
                let player = lobby.player(member).expect("member must be connected");
                assert_eq!(player.current_room.as_deref(), Some(room.name()));
            }
        }
        for view in lobby.players().views() {
            if let Some(room) = view.current_room {
                assert!(lobby.room(&room).is_some_and(|room| room.contains(&view.connection_id)));
            }
        }
    }

    #[test]
    fn connect_greets_with_id_and_rooms() {
        let mut lobby = lobby();
        let id = ConnectionId::new();
        let mut out = Outbox::default();
        lobby.connect(id, &mut out);
        assert_eq!(events(&out)[0], &ServerEvent::Connected { connection_id: id });
        assert!(out
            .dispatches()
            .iter()
            .all(|dispatch| dispatch.audience == Audience::Connection(id)));
        assert_eq!(lobby.player(&id).unwrap().status, PlayerStatus::Waiting);
    }

    #[test]
    fn create_room_seats_creator() {
        let mut lobby = lobby();
        let id = connect(&mut lobby);
        let mut out = Outbox::default();
        lobby
            .create_room(id, &create("sprint", GameMode::Normal, 3), None, &mut out)
            .unwrap();
        let room = lobby.room("sprint").unwrap();
        assert_eq!(room.members(), &[id]);
        assert_eq!(room.scoreboard().len(), 1);
        assert_eq!(room.phase(), Phase::Waiting);
        assert_eq!(lobby.player(&id).unwrap().current_room.as_deref(), Some("sprint"));
        assert!(has_event(&out, |event| matches!(event, ServerEvent::RoomData(_))));
        assert!(has_event(&out, |event| matches!(event, ServerEvent::UpdateRooms(rooms) if rooms.len() == 1)));
    }

    #[test]
    fn duplicate_create_leaves_existing_room_alone() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "sprint", 3, 2);
        let other = connect(&mut lobby);
        let mut out = Outbox::default();
        let err = lobby
            .create_room(other, &create("sprint", GameMode::HighStakes, 2), None, &mut out)
            .unwrap_err();
        assert_eq!(err, LobbyError::RoomAlreadyExists("sprint".into()));
        assert!(out.dispatches().is_empty());
        let room = lobby.room("sprint").unwrap();
        assert_eq!(room.members(), ids.as_slice());
        assert_eq!(room.mode(), GameMode::Normal);
        assert!(lobby.player(&other).unwrap().current_room.is_none());
    }

    #[test]
    fn rejoin_is_idempotent() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "sprint", 4, 2);
        let mut out = Outbox::default();
        lobby.join_room(ids[1], &join("sprint"), None, &mut out).unwrap();
        let room = lobby.room("sprint").unwrap();
        assert_eq!(room.len(), 2);
        assert_eq!(room.scoreboard().len(), 2);
        assert_eq!(out.dispatches().len(), 1);
        assert!(matches!(events(&out)[0], ServerEvent::RoomData(_)));
    }

    #[test]
    fn filling_a_room_requests_ready_and_rejects_extra_players() {
        let mut lobby = lobby();
        let ids: Vec<_> = (0..3).map(|_| connect(&mut lobby)).collect();
        lobby
            .create_room(ids[0], &create("pair", GameMode::Normal, 2), None, &mut Outbox::default())
            .unwrap();
        let mut out = Outbox::default();
        lobby.join_room(ids[1], &join("pair"), None, &mut out).unwrap();
        assert_eq!(lobby.room("pair").unwrap().phase(), Phase::FullPendingReady);
        assert!(has_event(&out, |event| matches!(event, ServerEvent::RequestReady { .. })));
        assert!(out.dispatches().iter().any(|dispatch| {
            matches!(dispatch.event, ServerEvent::RequestReady { .. })
                && dispatch.audience.includes(&ids[0])
                && dispatch.audience.includes(&ids[1])
        }));

        let err = lobby
            .join_room(ids[2], &join("pair"), None, &mut Outbox::default())
            .unwrap_err();
        assert_eq!(err, LobbyError::RoomFull("pair".into()));
        assert_eq!(lobby.room("pair").unwrap().len(), 2);
        assert_invariants(&lobby);
    }

    #[test]
    fn players_cannot_sit_in_two_rooms() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "one", 4, 1);
        let other = connect(&mut lobby);
        lobby
            .create_room(other, &create("two", GameMode::Normal, 4), None, &mut Outbox::default())
            .unwrap();
        let err = lobby
            .join_room(ids[0], &join("two"), None, &mut Outbox::default())
            .unwrap_err();
        assert_eq!(err, LobbyError::AlreadyInRoom("one".into()));
        let err = lobby
            .create_room(ids[0], &create("three", GameMode::Normal, 4), None, &mut Outbox::default())
            .unwrap_err();
        assert_eq!(err, LobbyError::AlreadyInRoom("one".into()));
        assert_invariants(&lobby);
    }

    #[test]
    fn joining_unknown_room_fails() {
        let mut lobby = lobby();
        let id = connect(&mut lobby);
        let err = lobby
            .join_room(id, &join("nowhere"), None, &mut Outbox::default())
            .unwrap_err();
        assert_eq!(err, LobbyError::RoomNotFound("nowhere".into()));
    }

    #[test]
    fn all_ready_arms_countdown_once() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "trio", 4, 3);
        for id in &ids[..2] {
            let mut out = Outbox::default();
            lobby.set_ready(*id, true, &mut out).unwrap();
            assert!(out.effects().is_empty());
        }
        let mut out = Outbox::default();
        lobby.set_ready(ids[2], true, &mut out).unwrap();
        let room = lobby.room("trio").unwrap();
        assert_eq!(room.phase(), Phase::Countdown);
        assert_eq!(
            out.effects(),
            &[Effect::ArmCountdown {
                room: "trio".into(),
                room_id: room.id(),
                delay: DEFAULT_COUNTDOWN,
            }]
        );
        assert!(has_event(&out, |event| matches!(event, ServerEvent::StartCountdown { seconds: 3, .. })));

        // Un-readying during the countdown does not cancel it.
        let mut out = Outbox::default();
        lobby.set_ready(ids[1], false, &mut out).unwrap();
        assert!(out.effects().is_empty());
        assert_eq!(lobby.room("trio").unwrap().phase(), Phase::Countdown);
        assert_eq!(lobby.player(&ids[1]).unwrap().status, PlayerStatus::Waiting);

        let room_id = lobby.room("trio").unwrap().id();
        assert!(lobby.start_match("trio", room_id, &mut Outbox::default()));
        assert_eq!(lobby.room("trio").unwrap().phase(), Phase::Playing);
        for id in &ids {
            assert_eq!(lobby.player(id).unwrap().status, PlayerStatus::Playing);
        }
    }

    #[test]
    fn lone_ready_player_does_not_start() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "solo", 4, 1);
        let mut out = Outbox::default();
        lobby.set_ready(ids[0], true, &mut out).unwrap();
        assert_eq!(lobby.room("solo").unwrap().phase(), Phase::Waiting);
        assert!(out.effects().is_empty());
    }

    #[test]
    fn stale_countdown_is_ignored() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "flaky", 4, 2);
        for id in &ids {
            lobby.set_ready(*id, true, &mut Outbox::default()).unwrap();
        }
        let old_id = lobby.room("flaky").unwrap().id();
        for id in &ids {
            lobby.leave_room(*id, "flaky", &mut Outbox::default()).unwrap();
        }
        assert!(lobby.room("flaky").is_none());
        let again = seated(&mut lobby, "flaky", 4, 1);
        assert!(!lobby.start_match("flaky", old_id, &mut Outbox::default()));
        assert_eq!(lobby.room("flaky").unwrap().phase(), Phase::Waiting);
        assert_eq!(lobby.player(&again[0]).unwrap().status, PlayerStatus::Waiting);
    }

    #[test]
    fn ranking_on_time_out_matches_scores() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "race", 4, 3);
        start(&mut lobby, "race", &ids);
        let scores = [(3, 2), (3, 0), (1, 0)];
        for (id, (done, errors)) in ids.iter().zip(scores) {
            for _ in 0..done {
                lobby.article_completed(*id, None, &mut Outbox::default()).unwrap();
            }
            for _ in 0..errors {
                lobby.player_error(*id, None, &mut Outbox::default()).unwrap();
            }
        }
        let mut out = Outbox::default();
        lobby.time_out(ids[2], Some("race"), &mut out).unwrap();
        let podium = out
            .dispatches()
            .iter()
            .find_map(|dispatch| match &dispatch.event {
                ServerEvent::ShowPodium(podium) => Some(podium.clone()),
                _ => None,
            })
            .expect("podium broadcast");
        let order: Vec<_> = podium.standings.iter().map(|s| s.score.connection_id).collect();
        assert_eq!(order, vec![ids[1], ids[0], ids[2]]);
        assert_eq!(podium.winner, Some(ids[1]));
        assert!(has_event(&out, |event| matches!(event, ServerEvent::TimeRanOut { .. })));
        assert_eq!(lobby.room("race").unwrap().phase(), Phase::Finished);
    }

    #[test]
    fn progress_outside_playing_is_rejected() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "early", 4, 2);
        let err = lobby
            .update_progress(ids[0], 40.0, &mut Outbox::default())
            .unwrap_err();
        assert_eq!(err, LobbyError::MatchNotRunning("early".into()));
        let lone = connect(&mut lobby);
        let err = lobby
            .article_completed(lone, None, &mut Outbox::default())
            .unwrap_err();
        assert_eq!(err, LobbyError::NotInRoom);
    }

    #[test]
    fn progress_is_clamped_and_broadcast() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "clamp", 4, 2);
        start(&mut lobby, "clamp", &ids);
        let mut out = Outbox::default();
        lobby.update_progress(ids[0], 140.0, &mut out).unwrap();
        let row = lobby.room("clamp").unwrap().row(&ids[0]).unwrap().clone();
        assert_eq!(row.current_article_progress, 100.0);
        assert!(has_event(&out, |event| matches!(event, ServerEvent::LeaderboardUpdateInRoom { .. })));
        assert!(lobby
            .update_progress(ids[0], f64::NAN, &mut Outbox::default())
            .is_err());
        lobby.player_milestone(ids[1], 50, &mut Outbox::default()).unwrap();
        assert_eq!(
            lobby.room("clamp").unwrap().row(&ids[1]).unwrap().milestone,
            Some(50)
        );
    }

    #[test]
    fn everyone_finishing_ends_the_match_and_records_results() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "finish", 4, 2);
        start(&mut lobby, "finish", &ids);
        let mut out = Outbox::default();
        lobby.game_ended(ids[0], 42.5, &mut out).unwrap();
        assert!(matches!(out.effects(), [Effect::RecordResult(result)] if result.elapsed_time == 42.5));
        assert_eq!(lobby.room("finish").unwrap().phase(), Phase::Playing);
        assert_eq!(lobby.player(&ids[0]).unwrap().status, PlayerStatus::Finished);

        let mut out = Outbox::default();
        lobby.game_ended(ids[1], 50.0, &mut out).unwrap();
        assert_eq!(lobby.room("finish").unwrap().phase(), Phase::Finished);
        assert!(has_event(&out, |event| matches!(event, ServerEvent::ShowPodium(_))));
        assert_eq!(lobby.leaderboard().len(), 2);
        assert_eq!(lobby.leaderboard()[0].elapsed_time, 42.5);
    }

    #[test]
    fn finished_rows_reject_further_progress() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "done", 4, 2);
        start(&mut lobby, "done", &ids);
        let mut out = Outbox::default();
        lobby.game_ended(ids[0], 30.0, &mut out).unwrap();
        assert!(matches!(out.effects(), [Effect::RecordResult(result)] if result.articles_completed == 0));

        let mut out = Outbox::default();
        assert_eq!(
            lobby.article_completed(ids[0], None, &mut out),
            Err(LobbyError::AlreadyFinished)
        );
        assert_eq!(
            lobby.player_error(ids[0], None, &mut out),
            Err(LobbyError::AlreadyFinished)
        );
        assert_eq!(
            lobby.update_progress(ids[0], 40.0, &mut out),
            Err(LobbyError::AlreadyFinished)
        );
        assert_eq!(
            lobby.game_ended(ids[0], 31.0, &mut out),
            Err(LobbyError::AlreadyFinished)
        );
        assert!(out.dispatches().is_empty());
        assert!(out.effects().is_empty());

        let row = lobby.room("done").unwrap().row(&ids[0]).unwrap();
        assert_eq!(row.articles_completed, 0);
        assert_eq!(row.error_count, 0);
        assert_eq!(row.elapsed_time, Some(30.0));
        assert_eq!(lobby.leaderboard().len(), 1);

        // The other racer is unaffected.
        lobby.article_completed(ids[1], None, &mut Outbox::default()).unwrap();
    }

    #[test]
    fn sudden_death_finisher_cannot_be_eliminated_afterwards() {
        let mut lobby = lobby();
        let ids: Vec<_> = (0..3).map(|_| connect(&mut lobby)).collect();
        for (index, id) in ids.iter().enumerate() {
            bind(&mut lobby, *id, index as AccountId + 1);
        }
        let request = create("last", GameMode::HighStakes, 3);
        let payment = pay(lobby.plan_create(&ids[0], &request).unwrap());
        lobby.create_room(ids[0], &request, payment, &mut Outbox::default()).unwrap();
        for id in &ids[1..] {
            let payment = pay(lobby.plan_join(id, &join("last")).unwrap());
            lobby.join_room(*id, &join("last"), payment, &mut Outbox::default()).unwrap();
        }
        start(&mut lobby, "last", &ids);

        for _ in 0..5 {
            lobby.article_completed(ids[0], None, &mut Outbox::default()).unwrap();
        }
        lobby.game_ended(ids[0], 55.0, &mut Outbox::default()).unwrap();
        assert_eq!(
            lobby.player_error(ids[0], None, &mut Outbox::default()),
            Err(LobbyError::AlreadyFinished)
        );
        assert!(!lobby.room("last").unwrap().is_eliminated(&ids[0]));

        lobby.player_error(ids[1], None, &mut Outbox::default()).unwrap();
        let mut out = Outbox::default();
        lobby.player_error(ids[2], None, &mut out).unwrap();
        assert_eq!(lobby.room("last").unwrap().phase(), Phase::Finished);
        let podium = out.dispatches().iter().find_map(|dispatch| match &dispatch.event {
            ServerEvent::ShowPodium(podium) => Some(podium.clone()),
            _ => None,
        });
        assert_eq!(podium.and_then(|podium| podium.winner), Some(ids[0]));
    }

    #[test]
    fn seated_players_cannot_switch_accounts() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "seat", 4, 1);
        let account = Account {
            id: 77,
            username: "late".into(),
            balance: 0,
            profile_image: None,
        };
        let err = lobby
            .bind_account(ids[0], &account, &mut Outbox::default())
            .unwrap_err();
        assert_eq!(err, LobbyError::AlreadyInRoom("seat".into()));
        assert!(lobby.player(&ids[0]).unwrap().account_id.is_none());
    }

    #[test]
    fn leaderboard_is_bounded() {
        let mut lobby = Lobby::new(LobbyConfig {
            leaderboard_capacity: 2,
            ..LobbyConfig::default()
        });
        for round in 0..3 {
            let name = format!("r{round}");
            let ids = seated(&mut lobby, &name, 4, 2);
            start(&mut lobby, &name, &ids);
            lobby.game_ended(ids[0], round as f64, &mut Outbox::default()).unwrap();
        }
        let times: Vec<_> = lobby.leaderboard().iter().map(|entry| entry.elapsed_time).collect();
        assert_eq!(times, vec![1.0, 2.0]);
    }

    #[test]
    fn normal_departure_mid_race_resets_room() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "reset", 4, 3);
        start(&mut lobby, "reset", &ids);
        lobby.article_completed(ids[1], None, &mut Outbox::default()).unwrap();
        let mut out = Outbox::default();
        lobby.leave_room(ids[0], "reset", &mut out).unwrap();

        let room = lobby.room("reset").unwrap();
        assert_eq!(room.phase(), Phase::Waiting);
        assert_eq!(room.len(), 2);
        assert!(room.scoreboard().iter().all(|row| row.articles_completed == 0));
        for id in &ids[1..] {
            assert_eq!(lobby.player(id).unwrap().status, PlayerStatus::Waiting);
        }
        assert_eq!(lobby.player(&ids[0]).unwrap().status, PlayerStatus::NotJoined);
        assert!(has_event(&out, |event| matches!(event, ServerEvent::PlayerLeft { connection_id, .. } if *connection_id == ids[0])));
        assert!(out.dispatches().iter().all(|dispatch| match &dispatch.audience {
            Audience::Room { members, .. } => !members.contains(&ids[0]),
            _ => true,
        }));
    }

    #[test]
    fn disconnect_keeps_room_until_last_member_leaves() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "dc", 4, 2);
        lobby.disconnect(ids[0], &mut Outbox::default());
        assert!(lobby.player(&ids[0]).is_none());
        let room = lobby.room("dc").unwrap();
        assert_eq!(room.members(), &[ids[1]]);

        let mut out = Outbox::default();
        lobby.disconnect(ids[1], &mut out);
        assert!(lobby.room("dc").is_none());
        assert!(has_event(&out, |event| matches!(event, ServerEvent::UpdateRooms(rooms) if rooms.is_empty())));
        assert_invariants(&lobby);
    }

    #[test]
    fn leaving_a_full_room_reopens_it() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "gap", 2, 2);
        assert_eq!(lobby.room("gap").unwrap().phase(), Phase::FullPendingReady);
        lobby.leave_room(ids[1], "gap", &mut Outbox::default()).unwrap();
        assert_eq!(lobby.room("gap").unwrap().phase(), Phase::Waiting);
        let err = lobby.leave_room(ids[1], "gap", &mut Outbox::default()).unwrap_err();
        assert_eq!(err, LobbyError::NotInRoom);
    }

    #[test]
    fn departure_of_the_only_unready_member_starts_countdown() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "holdout", 4, 3);
        lobby.set_ready(ids[0], true, &mut Outbox::default()).unwrap();
        lobby.set_ready(ids[1], true, &mut Outbox::default()).unwrap();
        let mut out = Outbox::default();
        lobby.leave_room(ids[2], "holdout", &mut out).unwrap();
        assert_eq!(lobby.room("holdout").unwrap().phase(), Phase::Countdown);
        assert!(matches!(out.effects(), [Effect::ArmCountdown { .. }]));
    }

    #[test]
    fn high_stakes_requires_account_and_fee() {
        let mut lobby = lobby();
        let guest = connect(&mut lobby);
        let err = lobby
            .plan_create(&guest, &create("vault", GameMode::HighStakes, 2))
            .unwrap_err();
        assert_eq!(err, LobbyError::NotAuthenticated);

        let host = connect(&mut lobby);
        bind(&mut lobby, host, 1);
        let request = create("vault", GameMode::HighStakes, 2);
        let admission = lobby.plan_create(&host, &request).unwrap();
        assert_eq!(
            admission,
            Admission::Fee {
                account_id: 1,
                amount: DEFAULT_ENTRY_FEE
            }
        );
        // A commit without the fee is refused.
        let err = lobby
            .create_room(host, &request, None, &mut Outbox::default())
            .unwrap_err();
        assert!(matches!(err, LobbyError::InvalidPayload(_)));
        assert!(lobby.room("vault").is_none());

        let payment = pay(admission);
        lobby
            .create_room(host, &request, payment, &mut Outbox::default())
            .unwrap();
        assert_eq!(lobby.room("vault").unwrap().pot(), DEFAULT_ENTRY_FEE);
    }

    #[test]
    fn sudden_death_elimination_finishes_with_last_survivor() {
        let mut lobby = lobby();
        let ids: Vec<_> = (0..3).map(|_| connect(&mut lobby)).collect();
        for (index, id) in ids.iter().enumerate() {
            bind(&mut lobby, *id, index as AccountId + 1);
        }
        let request = create("sd", GameMode::HighStakes, 3);
        let payment = pay(lobby.plan_create(&ids[0], &request).unwrap());
        lobby.create_room(ids[0], &request, payment, &mut Outbox::default()).unwrap();
        for id in &ids[1..] {
            let payment = pay(lobby.plan_join(id, &join("sd")).unwrap());
            lobby.join_room(*id, &join("sd"), payment, &mut Outbox::default()).unwrap();
        }
        assert_eq!(lobby.room("sd").unwrap().pot(), 3 * DEFAULT_ENTRY_FEE);
        start(&mut lobby, "sd", &ids);

        let mut out = Outbox::default();
        lobby.player_error(ids[0], None, &mut out).unwrap();
        assert!(lobby.room("sd").unwrap().is_eliminated(&ids[0]));
        assert!(out.dispatches().iter().any(|dispatch| {
            matches!(dispatch.event, ServerEvent::EliminatedFromGame { .. })
                && dispatch.audience == Audience::Connection(ids[0])
        }));
        assert_eq!(
            lobby.article_completed(ids[0], None, &mut Outbox::default()),
            Err(LobbyError::Eliminated)
        );
        assert_eq!(lobby.room("sd").unwrap().phase(), Phase::Playing);

        let mut out = Outbox::default();
        lobby.player_error(ids[1], None, &mut out).unwrap();
        let room = lobby.room("sd").unwrap();
        assert_eq!(room.phase(), Phase::Finished);
        assert_eq!(room.pot(), 0);
        assert!(out.effects().contains(&Effect::Credit {
            connection: ids[2],
            account_id: 3,
            amount: 3 * DEFAULT_ENTRY_FEE,
            reason: CreditReason::Payout,
        }));
        assert_eq!(lobby.snapshot().stats.eliminations, 2);
    }

    #[test]
    fn deferred_credits_are_held_per_account() {
        let mut lobby = lobby();
        let ids: Vec<_> = (0..2).map(|_| connect(&mut lobby)).collect();
        bind(&mut lobby, ids[0], 1);
        let err = LobbyError::backend("ledger offline");
        let owed = PendingCredit {
            account_id: 1,
            amount: 200,
            reason: CreditReason::Payout,
        };
        let mut out = Outbox::default();
        lobby.defer_credit(ids[0], owed, &err, &mut out);
        lobby.defer_credit(
            ids[1],
            PendingCredit {
                account_id: 2,
                amount: 50,
                reason: CreditReason::Refund,
            },
            &err,
            &mut out,
        );
        assert!(out.dispatches().iter().any(|dispatch| {
            dispatch.audience == Audience::Connection(ids[0])
                && matches!(
                    &dispatch.event,
                    ServerEvent::ActionError { action, code: "BACKEND_UNAVAILABLE", .. } if action == "payout"
                )
        }));
        assert_eq!(lobby.snapshot().stats.credits_pending, 2);
        assert_eq!(lobby.snapshot().stats.credits_pending_amount, 250);

        assert_eq!(lobby.take_pending_credits(1), vec![owed]);
        assert!(lobby.take_pending_credits(1).is_empty());
        assert_eq!(lobby.pending_credits().len(), 1);
        assert_eq!(lobby.snapshot().stats.credits_pending_amount, 50);
    }

    #[test]
    fn high_stakes_leave_forfeits_fee_and_refunds_extra() {
        let mut lobby = lobby();
        let ids: Vec<_> = (0..2).map(|_| connect(&mut lobby)).collect();
        bind(&mut lobby, ids[0], 1);
        bind(&mut lobby, ids[1], 2);
        let request = create("stake", GameMode::HighStakes, 4);
        let payment = pay(lobby.plan_create(&ids[0], &request).unwrap());
        lobby.create_room(ids[0], &request, payment, &mut Outbox::default()).unwrap();
        let payment = pay(lobby.plan_join(&ids[1], &join("stake")).unwrap());
        lobby.join_room(ids[1], &join("stake"), payment, &mut Outbox::default()).unwrap();

        let plan = lobby.plan_bet(&ids[1], "stake", 250).unwrap();
        assert_eq!(plan.delta(), 150);
        lobby.commit_bet(ids[1], &plan, 750, &mut Outbox::default()).unwrap();
        assert_eq!(lobby.room("stake").unwrap().pot(), 350);

        let mut out = Outbox::default();
        lobby.leave_room(ids[1], "stake", &mut out).unwrap();
        assert_eq!(
            out.effects(),
            &[Effect::Credit {
                connection: ids[1],
                account_id: 2,
                amount: 150,
                reason: CreditReason::Refund
            }]
        );
        let room = lobby.room("stake").unwrap();
        assert_eq!(room.pot(), 200);
        assert_eq!(room.pot(), room.bets().values().sum::<i64>());
    }

    #[test]
    fn bets_are_validated_and_stale_plans_refused() {
        let mut lobby = lobby();
        let ids = seated(&mut lobby, "casual", 4, 2);
        assert_eq!(
            lobby.plan_bet(&ids[0], "casual", 500),
            Err(LobbyError::NotHighStakes("casual".into()))
        );

        let host = connect(&mut lobby);
        bind(&mut lobby, host, 9);
        let request = create("vault", GameMode::HighStakes, 4);
        let payment = pay(lobby.plan_create(&host, &request).unwrap());
        lobby.create_room(host, &request, payment, &mut Outbox::default()).unwrap();
        assert!(matches!(
            lobby.plan_bet(&host, "vault", DEFAULT_ENTRY_FEE - 1),
            Err(LobbyError::InvalidPayload(_))
        ));

        let first = lobby.plan_bet(&host, "vault", 300).unwrap();
        let second = lobby.plan_bet(&host, "vault", 400).unwrap();
        lobby.commit_bet(host, &first, 700, &mut Outbox::default()).unwrap();
        let mut out = Outbox::default();
        assert!(lobby.commit_bet(host, &second, 600, &mut out).is_err());
        assert!(out.dispatches().is_empty());
        assert_eq!(lobby.room("vault").unwrap().pot(), 300);
    }

    #[test]
    fn save_username_outside_room_sets_not_joined() {
        let mut lobby = lobby();
        let id = connect(&mut lobby);
        let mut out = Outbox::default();
        lobby.save_username(id, "  Ada ", &mut out).unwrap();
        let player = lobby.player(&id).unwrap();
        assert_eq!(player.display_name.as_deref(), Some("Ada"));
        assert_eq!(player.status, PlayerStatus::NotJoined);
        assert!(has_event(&out, |event| matches!(event, ServerEvent::UpdatePlayerData(_))));
        assert!(lobby.save_username(id, "", &mut Outbox::default()).is_err());
    }

    #[derive(Clone, Debug)]
    enum Step {
        Connect,
        Disconnect(usize),
        Create(usize, u8, u8, bool),
        Join(usize, u8),
        Leave(usize),
        Ready(usize, bool),
        Bet(usize, i64),
        Fire(u8),
        Error(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Connect),
            any::<usize>().prop_map(Step::Disconnect),
            (any::<usize>(), 0u8..3, 2u8..=4, any::<bool>())
                .prop_map(|(who, room, cap, hs)| Step::Create(who, room, cap, hs)),
            (any::<usize>(), 0u8..3).prop_map(|(who, room)| Step::Join(who, room)),
            any::<usize>().prop_map(Step::Leave),
            (any::<usize>(), any::<bool>()).prop_map(|(who, ready)| Step::Ready(who, ready)),
            (any::<usize>(), 0i64..400).prop_map(|(who, amount)| Step::Bet(who, amount)),
            (0u8..3).prop_map(Step::Fire),
            any::<usize>().prop_map(Step::Error),
        ]
    }

    proptest! {
        #[test]
        fn random_sessions_preserve_invariants(steps in prop::collection::vec(step(), 1..120)) {
            let mut lobby = lobby();
            let mut ids: Vec<ConnectionId> = Vec::new();
            let mut next_account: AccountId = 1;
            let pick = |ids: &Vec<ConnectionId>, n: usize| (!ids.is_empty()).then(|| ids[n % ids.len()]);
            for step in steps {
                let mut out = Outbox::default();
                match step {
                    Step::Connect => {
                        let id = connect(&mut lobby);
                        if next_account % 2 == 1 {
                            bind(&mut lobby, id, next_account);
                        }
                        next_account += 1;
                        ids.push(id);
                    }
                    Step::Disconnect(n) => {
                        if let Some(id) = pick(&ids, n) {
                            lobby.disconnect(id, &mut out);
                            ids.retain(|other| *other != id);
                        }
                    }
                    Step::Create(n, room, capacity, high_stakes) => {
                        if let Some(id) = pick(&ids, n) {
                            let mode = if high_stakes { GameMode::HighStakes } else { GameMode::Normal };
                            let request = create(&format!("room{room}"), mode, capacity);
                            if let Ok(admission) = lobby.plan_create(&id, &request) {
                                let payment = pay(admission);
                                let _ = lobby.create_room(id, &request, payment, &mut out);
                            }
                        }
                    }
                    Step::Join(n, room) => {
                        if let Some(id) = pick(&ids, n) {
                            let request = join(&format!("room{room}"));
                            if let Ok(admission) = lobby.plan_join(&id, &request) {
                                let payment = pay(admission);
                                let _ = lobby.join_room(id, &request, payment, &mut out);
                            }
                        }
                    }
                    Step::Leave(n) => {
                        if let Some(id) = pick(&ids, n) {
                            if let Some(room) = lobby.player(&id).and_then(|p| p.current_room.clone()) {
                                lobby.leave_room(id, &room, &mut out).unwrap();
                            }
                        }
                    }
                    Step::Ready(n, ready) => {
                        if let Some(id) = pick(&ids, n) {
                            let _ = lobby.set_ready(id, ready, &mut out);
                        }
                    }
                    Step::Bet(n, amount) => {
                        if let Some(id) = pick(&ids, n) {
                            if let Some(room) = lobby.player(&id).and_then(|p| p.current_room.clone()) {
                                if let Ok(plan) = lobby.plan_bet(&id, &room, amount) {
                                    let _ = lobby.commit_bet(id, &plan, 0, &mut out);
                                }
                            }
                        }
                    }
                    Step::Fire(room) => {
                        let name = format!("room{room}");
                        if let Some(room_id) = lobby.room(&name).map(Room::id) {
                            lobby.start_match(&name, room_id, &mut out);
                        }
                    }
                    Step::Error(n) => {
                        if let Some(id) = pick(&ids, n) {
                            let _ = lobby.player_error(id, None, &mut out);
                        }
                    }
                }
                assert_invariants(&lobby);
            }
        }
    }
}
