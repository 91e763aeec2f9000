//! Wager ledger: balance movements for entry fees, bets, refunds, and payouts.
//!
//! Every movement is a single atomic `adjust_balance` call on the store, so a failed
//! movement never leaves a partial write behind.

use crate::lobby::BetPlan;
use crate::store::Store;
use std::sync::Arc;
use tracing::{debug, warn};
use typerace_types::{AccountId, LobbyError};

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn balance(&self, account_id: AccountId) -> Result<i64, LobbyError> {
        self.store.get_balance(account_id).await
    }

    /// Removes `amount` from the balance, failing with `InsufficientFunds` if it would go negative.
    pub async fn deduct(&self, account_id: AccountId, amount: i64) -> Result<i64, LobbyError> {
        if amount <= 0 {
            return Err(LobbyError::invalid("deduction must be positive"));
        }
        let balance = self.store.adjust_balance(account_id, -amount).await?;
        debug!(account = account_id, amount, balance, "balance deducted");
        Ok(balance)
    }

    pub async fn credit(&self, account_id: AccountId, amount: i64) -> Result<i64, LobbyError> {
        if amount <= 0 {
            return Err(LobbyError::invalid("credit must be positive"));
        }
        let balance = self.store.adjust_balance(account_id, amount).await?;
        debug!(account = account_id, amount, balance, "balance credited");
        Ok(balance)
    }

    /// Signed adjustment used by the HTTP money route.
    pub async fn adjust(&self, account_id: AccountId, delta: i64) -> Result<i64, LobbyError> {
        match delta {
            0 => self.balance(account_id).await,
            delta if delta > 0 => self.credit(account_id, delta).await,
            delta => self.deduct(account_id, delta.saturating_neg()).await,
        }
    }

    /// Moves only the difference between the new bet and the prior one.
    pub async fn settle_bet(&self, plan: &BetPlan) -> Result<i64, LobbyError> {
        let delta = plan.delta();
        match delta {
            0 => self.balance(plan.account_id).await,
            delta if delta > 0 => self.deduct(plan.account_id, delta).await,
            delta => self.credit(plan.account_id, -delta).await,
        }
    }

    /// Undoes a settled bet whose commit was refused.
    pub async fn reverse_bet(&self, plan: &BetPlan) {
        let delta = plan.delta();
        let result = match delta {
            0 => return,
            delta if delta > 0 => self.credit(plan.account_id, delta).await,
            delta => self.deduct(plan.account_id, -delta).await,
        };
        if let Err(err) = result {
            warn!(account = plan.account_id, room = %plan.room, delta, ?err, "failed to reverse bet");
        }
    }
}
