//! Broadcast contract between the lobby core and the transport.
//!
//! Lobby operations never talk to sockets. They fill an [`Outbox`] with [`Dispatch`]es
//! (what to send, to whom) and [`Effect`]s (work that must happen after the lobby lock is
//! released). The coordinator hands dispatches to a [`Gateway`] in the order they were
//! produced, which is what keeps each room's stream in processing order.

use crate::rooms::Room;
use std::time::Duration;
use typerace_types::api::ServerEvent;
use typerace_types::{AccountId, ConnectionId, RaceResult};

/// Recipients of a dispatch.
#[derive(Clone, Debug, PartialEq)]
pub enum Audience {
    All,
    /// Members of a room, resolved when the dispatch was produced.
    Room {
        name: String,
        members: Vec<ConnectionId>,
    },
    Connection(ConnectionId),
}

impl Audience {
    pub fn includes(&self, id: &ConnectionId) -> bool {
        match self {
            Audience::All => true,
            Audience::Room { members, .. } => members.contains(id),
            Audience::Connection(target) => target == id,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Dispatch {
    pub audience: Audience,
    pub event: ServerEvent,
}

impl Dispatch {
    pub fn to(id: ConnectionId, event: ServerEvent) -> Self {
        Self {
            audience: Audience::Connection(id),
            event,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreditReason {
    Payout,
    Refund,
}

impl CreditReason {
    /// Action name reported to the client when the credit cannot be applied.
    pub fn action(&self) -> &'static str {
        match self {
            CreditReason::Payout => "payout",
            CreditReason::Refund => "refund",
        }
    }
}

/// Deferred work produced under the lobby lock and executed after it is released.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// One-shot timer that moves the room to `playing` if it is still counting down.
    ArmCountdown {
        room: String,
        room_id: u64,
        delay: Duration,
    },
    /// Balance credit owed to the account signed in on `connection`.
    Credit {
        connection: ConnectionId,
        account_id: AccountId,
        amount: i64,
        reason: CreditReason,
    },
    RecordResult(RaceResult),
}

#[derive(Debug, Default)]
pub struct Outbox {
    dispatches: Vec<Dispatch>,
    effects: Vec<Effect>,
}

impl Outbox {
    pub fn to_all(&mut self, event: ServerEvent) {
        self.dispatches.push(Dispatch {
            audience: Audience::All,
            event,
        });
    }

    pub fn to(&mut self, id: ConnectionId, event: ServerEvent) {
        self.dispatches.push(Dispatch::to(id, event));
    }

    pub fn to_room(&mut self, room: &Room, event: ServerEvent) {
        self.dispatches.push(Dispatch {
            audience: Audience::Room {
                name: room.name().to_string(),
                members: room.members().to_vec(),
            },
            event,
        });
    }

    pub fn effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub fn dispatches(&self) -> &[Dispatch] {
        &self.dispatches
    }

    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    pub fn into_parts(self) -> (Vec<Dispatch>, Vec<Effect>) {
        (self.dispatches, self.effects)
    }
}

/// Delivery half of the broadcast contract.
///
/// Delivery is at-most-once per connected client and must not block: a recipient whose
/// queue is full or closed simply misses the event and resynchronizes by query.
pub trait Gateway: Send + Sync {
    fn deliver(&self, dispatch: &Dispatch);
}
