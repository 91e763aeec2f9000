//! Connection registry: one lightweight player record per live connection.

use std::collections::HashMap;
use typerace_types::{Account, AccountId, ConnectionId, LobbyError, PlayerStatus, PlayerView};

#[derive(Clone, Debug, PartialEq)]
pub struct Player {
    pub id: ConnectionId,
    pub account_id: Option<AccountId>,
    pub display_name: Option<String>,
    pub status: PlayerStatus,
    pub current_room: Option<String>,
    pub avatar_ref: Option<String>,
    seq: u64,
}

impl Player {
    pub fn view(&self) -> PlayerView {
        PlayerView {
            connection_id: self.id,
            account_id: self.account_id,
            display_name: self.display_name.clone(),
            status: self.status,
            current_room: self.current_room.clone(),
            avatar_ref: self.avatar_ref.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    players: HashMap<ConnectionId, Player>,
    next_seq: u64,
}

impl ConnectionRegistry {
    /// Registers a connection. Registering an id twice returns the existing record.
    pub fn on_connect(&mut self, id: ConnectionId) -> &Player {
        let seq = self.next_seq;
        let player = self.players.entry(id).or_insert_with(|| Player {
            id,
            account_id: None,
            display_name: None,
            status: PlayerStatus::Waiting,
            current_room: None,
            avatar_ref: None,
            seq,
        });
        if player.seq == seq {
            self.next_seq += 1;
        }
        player
    }

    /// Drops the record. Room cleanup is the caller's job and must run first.
    pub fn on_disconnect(&mut self, id: &ConnectionId) -> Option<Player> {
        self.players.remove(id)
    }

    pub fn find(&self, id: &ConnectionId) -> Option<&Player> {
        self.players.get(id)
    }

    pub fn find_mut(&mut self, id: &ConnectionId) -> Option<&mut Player> {
        self.players.get_mut(id)
    }

    pub fn get(&self, id: &ConnectionId) -> Result<&Player, LobbyError> {
        self.find(id).ok_or(LobbyError::PlayerNotFound)
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Result<&mut Player, LobbyError> {
        self.find_mut(id).ok_or(LobbyError::PlayerNotFound)
    }

    /// The connection, other than `except`, currently signed in as `account_id`.
    pub fn bound_to(&self, account_id: AccountId, except: &ConnectionId) -> Option<ConnectionId> {
        self.players
            .values()
            .find(|player| player.id != *except && player.account_id == Some(account_id))
            .map(|player| player.id)
    }

    /// Binds `account` to the connection. An account is live on at most one connection,
    /// so a second binding fails with `AccountInUse` until the first one disconnects.
    pub fn bind_account(&mut self, id: &ConnectionId, account: &Account) -> Result<(), LobbyError> {
        self.get(id)?;
        if self.bound_to(account.id, id).is_some() {
            return Err(LobbyError::AccountInUse(account.username.clone()));
        }
        let player = self.get_mut(id)?;
        player.account_id = Some(account.id);
        player.display_name = Some(account.username.clone());
        player.avatar_ref = None;
        Ok(())
    }

    /// Sets the avatar only if the connection is still bound to `account_id`.
    pub fn attach_avatar(&mut self, id: &ConnectionId, account_id: AccountId, avatar: String) -> bool {
        match self.find_mut(id) {
            Some(player) if player.account_id == Some(account_id) => {
                player.avatar_ref = Some(avatar);
                true
            }
            _ => false,
        }
    }

    pub fn set_status(&mut self, id: &ConnectionId, status: PlayerStatus) {
        if let Some(player) = self.find_mut(id) {
            player.status = status;
        }
    }

    /// Player views in connection order.
    pub fn views(&self) -> Vec<PlayerView> {
        let mut players: Vec<&Player> = self.players.values().collect();
        players.sort_by_key(|player| player.seq);
        players.into_iter().map(Player::view).collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
