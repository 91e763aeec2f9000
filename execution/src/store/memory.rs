use super::{password, Catalog, Store, DEFAULT_STARTING_BALANCE};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use typerace_types::{Account, AccountId, Article, Difficulty, LobbyError, RaceResult};

struct StoredAccount {
    account: Account,
    password_hash: String,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<AccountId, StoredAccount>,
    by_name: HashMap<String, AccountId>,
    next_id: AccountId,
    results: Vec<RaceResult>,
}

impl Inner {
    fn insert(&mut self, username: String, password_hash: String, balance: i64) -> Result<Account, LobbyError> {
        let key = username.to_lowercase();
        if self.by_name.contains_key(&key) {
            return Err(LobbyError::AccountExists(username));
        }
        self.next_id += 1;
        let account = Account {
            id: self.next_id,
            username,
            balance,
            profile_image: None,
        };
        self.by_name.insert(key, account.id);
        self.accounts.insert(
            account.id,
            StoredAccount {
                account: account.clone(),
                password_hash,
            },
        );
        Ok(account)
    }

    fn account_mut(&mut self, account_id: AccountId) -> Result<&mut Account, LobbyError> {
        self.accounts
            .get_mut(&account_id)
            .map(|stored| &mut stored.account)
            .ok_or(LobbyError::AccountNotFound(account_id))
    }
}

/// Process-local store used when no database is configured, and by tests.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    catalog: Catalog,
    starting_balance: i64,
    unavailable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Catalog::default(), DEFAULT_STARTING_BALANCE)
    }
}

impl MemoryStore {
    pub fn new(catalog: Catalog, starting_balance: i64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            catalog,
            starting_balance,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent call fail with `BackendUnavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Inserts an account that cannot log in. Used to stage balances without hashing.
    pub fn seed_account(&self, username: &str, balance: i64) -> Result<Account, LobbyError> {
        self.inner()?.insert(username.to_string(), String::new(), balance)
    }

    pub fn results(&self) -> Vec<RaceResult> {
        match self.inner() {
            Ok(inner) => inner.results.clone(),
            Err(_) => Vec::new(),
        }
    }

    fn inner(&self) -> Result<MutexGuard<'_, Inner>, LobbyError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LobbyError::backend("memory store marked unavailable"));
        }
        Ok(match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => {
                tracing::warn!("memory store lock poisoned; recovering");
                poisoned.into_inner()
            }
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Account, LobbyError> {
        let inner = self.inner()?;
        let stored = inner
            .by_name
            .get(&username.trim().to_lowercase())
            .and_then(|id| inner.accounts.get(id))
            .ok_or(LobbyError::InvalidCredentials)?;
        if !password::verify(password, &stored.password_hash) {
            return Err(LobbyError::InvalidCredentials);
        }
        Ok(stored.account.clone())
    }

    async fn create_account(&self, username: &str, password: &str) -> Result<Account, LobbyError> {
        let username = password::validate_registration(username, password)?;
        let hash = password::hash(password).map_err(LobbyError::backend)?;
        self.inner()?.insert(username, hash, self.starting_balance)
    }

    async fn get_account(&self, account_id: AccountId) -> Result<Account, LobbyError> {
        self.inner()?.account_mut(account_id).map(|account| account.clone())
    }

    async fn get_balance(&self, account_id: AccountId) -> Result<i64, LobbyError> {
        self.inner()?.account_mut(account_id).map(|account| account.balance)
    }

    async fn adjust_balance(&self, account_id: AccountId, delta: i64) -> Result<i64, LobbyError> {
        let mut inner = self.inner()?;
        let account = inner.account_mut(account_id)?;
        let next = account
            .balance
            .checked_add(delta)
            .ok_or_else(|| LobbyError::invalid("balance overflow"))?;
        if next < 0 {
            return Err(LobbyError::InsufficientFunds {
                balance: account.balance,
                required: -delta,
            });
        }
        account.balance = next;
        Ok(next)
    }

    async fn get_profile_image(&self, account_id: AccountId) -> Result<Option<String>, LobbyError> {
        self.inner()?
            .account_mut(account_id)
            .map(|account| account.profile_image.clone())
    }

    async fn set_profile_image(&self, account_id: AccountId, path: &str) -> Result<(), LobbyError> {
        self.inner()?.account_mut(account_id)?.profile_image = Some(path.to_string());
        Ok(())
    }

    async fn get_challenge_set(&self, difficulty: Difficulty) -> Result<Vec<Article>, LobbyError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LobbyError::backend("memory store marked unavailable"));
        }
        Ok(self.catalog.challenge_set(difficulty))
    }

    async fn record_result(&self, result: &RaceResult) -> Result<(), LobbyError> {
        self.inner()?.results.push(result.clone());
        Ok(())
    }
}
