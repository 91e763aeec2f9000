//! Persistence adapter consumed by the lobby core.
//!
//! Accounts, balances, profile images, the article catalog, and race results live
//! behind [`Store`]. Room state never does: rooms are memory resident.

use async_trait::async_trait;
use typerace_types::{Account, AccountId, Article, Difficulty, LobbyError, RaceResult};

mod catalog;
mod memory;
pub mod password;

pub use catalog::Catalog;
pub use memory::MemoryStore;

/// Balance given to newly registered accounts unless configured otherwise.
pub const DEFAULT_STARTING_BALANCE: i64 = 1_000;

/// Storage operations for accounts and race history.
///
/// Implementations convert their own failures into [`LobbyError::BackendUnavailable`].
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the account when `password` matches, else `InvalidCredentials`.
    async fn verify_credentials(&self, username: &str, password: &str)
        -> Result<Account, LobbyError>;

    /// Creates an account, failing with `AccountExists` on a case-insensitive name clash.
    async fn create_account(&self, username: &str, password: &str) -> Result<Account, LobbyError>;

    async fn get_account(&self, account_id: AccountId) -> Result<Account, LobbyError>;

    async fn get_balance(&self, account_id: AccountId) -> Result<i64, LobbyError>;

    /// Applies `delta` to the balance as one atomic step and returns the new balance.
    ///
    /// Fails with `InsufficientFunds` (leaving the balance untouched) when the result
    /// would be negative.
    async fn adjust_balance(&self, account_id: AccountId, delta: i64) -> Result<i64, LobbyError>;

    async fn get_profile_image(&self, account_id: AccountId) -> Result<Option<String>, LobbyError>;

    async fn set_profile_image(&self, account_id: AccountId, path: &str) -> Result<(), LobbyError>;

    async fn get_challenge_set(&self, difficulty: Difficulty) -> Result<Vec<Article>, LobbyError>;

    async fn record_result(&self, result: &RaceResult) -> Result<(), LobbyError>;
}
