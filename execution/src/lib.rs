//! Typerace lobby coordinator.
//!
//! This crate holds the in-memory model of connected players, rooms, readiness, match
//! phases, and wagers, plus the async shell that serializes access to it.
//!
//! ## Layers
//! - [`Lobby`] is synchronous. Each operation validates, mutates, and fills an [`Outbox`]
//!   with broadcasts and deferred [`Effect`]s. A failed operation changes nothing.
//! - [`Coordinator`] owns the lobby lock, delivers broadcasts through a [`Gateway`], runs
//!   effects against the [`Store`], and arms countdown timers.
//! - [`Store`] is the persistence boundary. [`MemoryStore`] backs tests and
//!   database-less deployments.
//!
//! ## Consistency invariants
//! - a room never holds more members than its capacity and is deleted once empty;
//! - a connection is a member of at most one room;
//! - a room's pot always equals the sum of its bets.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use typerace_execution::{Coordinator, LobbyConfig, MemoryStore};
//!
//! let store = Arc::new(MemoryStore::default());
//! let coordinator = Arc::new(Coordinator::new(LobbyConfig::default(), store, gateway));
//! coordinator.connect(id);
//! coordinator.handle_and_report(id, event).await;
//! ```

pub mod coordinator;
pub mod dispatch;
pub mod ledger;
pub mod lobby;
pub mod matchplay;
pub mod players;
pub mod rooms;
pub mod store;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

pub use coordinator::Coordinator;
pub use dispatch::{Audience, CreditReason, Dispatch, Effect, Gateway, Outbox};
pub use ledger::Ledger;
pub use lobby::{
    Admission, BetPlan, Lobby, LobbyConfig, LobbySnapshot, LobbyStats, Payment, PendingCredit,
};
pub use store::{Catalog, MemoryStore, Store, DEFAULT_STARTING_BALANCE};
