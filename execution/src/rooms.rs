//! Room registry: lifecycle, membership, capacity, and wagers.
//!
//! Invariants enforced here:
//! - `members.len() <= capacity`
//! - members are unique and mirror the scoreboard rows one to one
//! - `pot() == bets.values().sum()` (the pot is derived, never stored)

use crate::players::ConnectionRegistry;
use std::collections::{BTreeMap, BTreeSet};
use typerace_types::api::CreateRoomRequest;
use typerace_types::{
    ConnectionId, Difficulty, GameMode, LobbyError, Phase, PlayerView, RoomSnapshot, RoomSummary,
    ScoreRow,
};

#[derive(Clone, Debug)]
pub struct Room {
    id: u64,
    name: String,
    difficulty: Difficulty,
    mode: GameMode,
    capacity: u8,
    entry_fee: i64,
    members: Vec<ConnectionId>,
    scoreboard: Vec<ScoreRow>,
    phase: Phase,
    bets: BTreeMap<ConnectionId, i64>,
    eliminated: BTreeSet<ConnectionId>,
}

impl Room {
    fn new(id: u64, request: &CreateRoomRequest, entry_fee: i64) -> Self {
        Self {
            id,
            name: request.name.clone(),
            difficulty: request.difficulty,
            mode: request.mode,
            capacity: request.capacity,
            entry_fee,
            members: Vec::new(),
            scoreboard: Vec::new(),
            phase: Phase::Waiting,
            bets: BTreeMap::new(),
            eliminated: BTreeSet::new(),
        }
    }

    /// Generation id. Distinguishes a room from a later one reusing its name.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn difficulty(&self) -> Difficulty {
        self.difficulty
    }

    pub fn mode(&self) -> GameMode {
        self.mode
    }

    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    pub fn entry_fee(&self) -> i64 {
        self.entry_fee
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn members(&self) -> &[ConnectionId] {
        &self.members
    }

    pub fn scoreboard(&self) -> &[ScoreRow] {
        &self.scoreboard
    }

    pub fn bets(&self) -> &BTreeMap<ConnectionId, i64> {
        &self.bets
    }

    pub fn bet(&self, id: &ConnectionId) -> i64 {
        self.bets.get(id).copied().unwrap_or(0)
    }

    pub fn pot(&self) -> i64 {
        self.bets.values().sum()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.capacity as usize
    }

    pub fn is_eliminated(&self, id: &ConnectionId) -> bool {
        self.eliminated.contains(id)
    }

    /// Members that have not been eliminated, in join order.
    pub fn survivors(&self) -> impl Iterator<Item = &ConnectionId> {
        self.members
            .iter()
            .filter(move |id| !self.eliminated.contains(*id))
    }

    pub fn row(&self, id: &ConnectionId) -> Option<&ScoreRow> {
        self.scoreboard.iter().find(|row| row.connection_id == *id)
    }

    pub(crate) fn row_mut(&mut self, id: &ConnectionId) -> Option<&mut ScoreRow> {
        self.scoreboard.iter_mut().find(|row| row.connection_id == *id)
    }

    /// Adds a member with a zeroed scoreboard row. Re-admitting a member is a no-op.
    pub(crate) fn admit(&mut self, id: ConnectionId, display_name: Option<String>) -> Result<(), LobbyError> {
        if self.contains(&id) {
            return Ok(());
        }
        if self.is_full() {
            return Err(LobbyError::RoomFull(self.name.clone()));
        }
        self.members.push(id);
        self.scoreboard.push(ScoreRow::new(id, display_name));
        Ok(())
    }

    /// Removes a member and its scoreboard row. Bets are settled separately.
    pub(crate) fn remove(&mut self, id: &ConnectionId) -> bool {
        let before = self.members.len();
        self.members.retain(|member| member != id);
        self.scoreboard.retain(|row| row.connection_id != *id);
        self.eliminated.remove(id);
        self.members.len() != before
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub(crate) fn set_bet(&mut self, id: ConnectionId, amount: i64) {
        if amount == 0 {
            self.bets.remove(&id);
        } else {
            self.bets.insert(id, amount);
        }
    }

    /// Settles a departing player's bet and returns the refundable part.
    ///
    /// High-stakes entry fees stay in `bets` (forfeited to the pot); anything wagered
    /// above the fee is returned. Other rooms refund the whole bet.
    pub(crate) fn release_bet(&mut self, id: &ConnectionId) -> i64 {
        let Some(bet) = self.bets.remove(id) else {
            return 0;
        };
        if self.mode.is_high_stakes() {
            let forfeited = bet.min(self.entry_fee);
            if forfeited > 0 {
                self.bets.insert(*id, forfeited);
            }
            bet - forfeited
        } else {
            bet
        }
    }

    /// Empties the pot, returning its total.
    pub(crate) fn take_pot(&mut self) -> i64 {
        let pot = self.pot();
        self.bets.clear();
        pot
    }

    pub(crate) fn eliminate(&mut self, id: ConnectionId) -> bool {
        self.contains(&id) && self.eliminated.insert(id)
    }

    /// Zeroes every scoreboard row and clears eliminations.
    pub(crate) fn reset_scores(&mut self) {
        for row in &mut self.scoreboard {
            row.reset();
        }
        self.eliminated.clear();
    }

    pub(crate) fn rename_member(&mut self, id: &ConnectionId, display_name: &str) {
        if let Some(row) = self.row_mut(id) {
            row.display_name = Some(display_name.to_string());
        }
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            name: self.name.clone(),
            difficulty: self.difficulty,
            mode: self.mode,
            capacity: self.capacity,
            players: self.members.len(),
            phase: self.phase,
            pot: self.pot(),
        }
    }

    pub fn member_views(&self, players: &ConnectionRegistry) -> Vec<PlayerView> {
        self.members
            .iter()
            .filter_map(|id| players.find(id))
            .map(|player| player.view())
            .collect()
    }

    pub fn snapshot(&self, players: &ConnectionRegistry) -> RoomSnapshot {
        RoomSnapshot {
            name: self.name.clone(),
            difficulty: self.difficulty,
            mode: self.mode,
            capacity: self.capacity,
            phase: self.phase,
            pot: self.pot(),
            entry_fee: self.entry_fee,
            members: self.member_views(players),
            scoreboard: self.scoreboard.clone(),
            eliminated: self.eliminated.iter().copied().collect(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: BTreeMap<String, Room>,
    next_id: u64,
}

impl RoomRegistry {
    /// Allocates an empty room. The caller admits the creator before releasing the lock.
    pub(crate) fn create(&mut self, request: &CreateRoomRequest, entry_fee: i64) -> Result<&mut Room, LobbyError> {
        if self.rooms.contains_key(&request.name) {
            return Err(LobbyError::RoomAlreadyExists(request.name.clone()));
        }
        self.next_id += 1;
        let room = Room::new(self.next_id, request, entry_fee);
        Ok(self.rooms.entry(request.name.clone()).or_insert(room))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rooms.contains_key(name)
    }

    pub fn find(&self, name: &str) -> Option<&Room> {
        self.rooms.get(name)
    }

    pub(crate) fn find_mut(&mut self, name: &str) -> Option<&mut Room> {
        self.rooms.get_mut(name)
    }

    pub fn get(&self, name: &str) -> Result<&Room, LobbyError> {
        self.find(name)
            .ok_or_else(|| LobbyError::RoomNotFound(name.to_string()))
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Result<&mut Room, LobbyError> {
        self.rooms
            .get_mut(name)
            .ok_or_else(|| LobbyError::RoomNotFound(name.to_string()))
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Room> {
        self.rooms.remove(name)
    }

    /// Summaries ordered by room name.
    pub fn list(&self) -> Vec<RoomSummary> {
        self.rooms.values().map(Room::summary).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, mode: GameMode, capacity: u8) -> CreateRoomRequest {
        CreateRoomRequest {
            name: name.to_string(),
            difficulty: Difficulty::Medium,
            mode,
            capacity,
            display_name: None,
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = RoomRegistry::default();
        let first = ConnectionId::new();
        registry
            .create(&request("duel", GameMode::Normal, 2), 0)
            .unwrap()
            .admit(first, None)
            .unwrap();
        let err = registry
            .create(&request("duel", GameMode::HighStakes, 4), 100)
            .unwrap_err();
        assert_eq!(err, LobbyError::RoomAlreadyExists("duel".into()));
        let room = registry.get("duel").unwrap();
        assert_eq!(room.mode(), GameMode::Normal);
        assert_eq!(room.members(), &[first]);
    }

    #[test]
    fn generations_increase_across_reuse() {
        let mut registry = RoomRegistry::default();
        let first = registry.create(&request("a", GameMode::Normal, 2), 0).unwrap().id();
        registry.remove("a");
        let second = registry.create(&request("a", GameMode::Normal, 2), 0).unwrap().id();
        assert!(second > first);
    }

    #[test]
    fn admit_respects_capacity_and_is_idempotent() {
        let mut registry = RoomRegistry::default();
        let room = registry.create(&request("pair", GameMode::Normal, 2), 0).unwrap();
        let (a, b, c) = (ConnectionId::new(), ConnectionId::new(), ConnectionId::new());
        room.admit(a, None).unwrap();
        room.admit(a, None).unwrap();
        assert_eq!(room.len(), 1);
        assert_eq!(room.scoreboard().len(), 1);
        room.admit(b, None).unwrap();
        assert!(room.is_full());
        assert_eq!(room.admit(c, None), Err(LobbyError::RoomFull("pair".into())));
        assert_eq!(room.len(), 2);
    }

    #[test]
    fn high_stakes_departure_forfeits_only_the_fee() {
        let mut registry = RoomRegistry::default();
        let room = registry.create(&request("vault", GameMode::HighStakes, 4), 100).unwrap();
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        room.admit(a, None).unwrap();
        room.admit(b, None).unwrap();
        room.set_bet(a, 250);
        room.set_bet(b, 100);
        assert_eq!(room.pot(), 350);

        room.remove(&a);
        assert_eq!(room.release_bet(&a), 150);
        assert_eq!(room.bet(&a), 100);
        assert_eq!(room.pot(), 200);
        assert_eq!(room.pot(), room.bets().values().sum::<i64>());

        assert_eq!(room.take_pot(), 200);
        assert!(room.bets().is_empty());
    }

    #[test]
    fn normal_departure_refunds_everything() {
        let mut registry = RoomRegistry::default();
        let room = registry.create(&request("casual", GameMode::Normal, 4), 0).unwrap();
        let a = ConnectionId::new();
        room.admit(a, None).unwrap();
        room.set_bet(a, 40);
        assert_eq!(room.release_bet(&a), 40);
        assert_eq!(room.pot(), 0);
    }

    #[test]
    fn removal_drops_row_and_elimination() {
        let mut registry = RoomRegistry::default();
        let room = registry.create(&request("sd", GameMode::HighStakes, 3), 10).unwrap();
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        room.admit(a, None).unwrap();
        room.admit(b, None).unwrap();
        assert!(room.eliminate(a));
        assert!(!room.eliminate(a));
        assert_eq!(room.survivors().copied().collect::<Vec<_>>(), vec![b]);
        assert!(room.remove(&a));
        assert!(!room.is_eliminated(&a));
        assert!(room.row(&a).is_none());
        assert!(!room.remove(&a));
    }
}
