//! SQLite-backed [`Store`].
//!
//! Every call runs on the blocking pool against one shared connection. Busy or locked
//! errors are retried with exponential backoff before surfacing as `BackendUnavailable`.

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};
use typerace_execution::store::password;
use typerace_execution::{Catalog, Store};
use typerace_types::{Account, AccountId, Article, Difficulty, LobbyError, RaceResult};

const MAX_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(25);

#[derive(Debug, thiserror::Error)]
enum SqlError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Lobby(#[from] LobbyError),
}

impl SqlError {
    fn is_contention(&self) -> bool {
        match self {
            SqlError::Sqlite(err) => matches!(
                err.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            ),
            SqlError::Lobby(_) => false,
        }
    }
}

impl From<SqlError> for LobbyError {
    fn from(err: SqlError) -> Self {
        match err {
            SqlError::Sqlite(err) => LobbyError::backend(err),
            SqlError::Lobby(err) => err,
        }
    }
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    starting_balance: i64,
}

impl SqliteStore {
    pub fn open(path: &Path, starting_balance: i64) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open database {}", path.display()))?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            starting_balance,
        })
    }

    /// Loads `catalog` into the articles table.
    ///
    /// With `replace` the table is rewritten; otherwise it is only filled when empty.
    pub fn sync_articles(&self, catalog: &Catalog, replace: bool) -> anyhow::Result<usize> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let existing: i64 = conn
            .query_row("SELECT COUNT(*) FROM articles", [], |row| row.get(0))
            .context("count articles")?;
        if existing > 0 && !replace {
            return Ok(existing as usize);
        }

        let tx = conn.transaction().context("begin article sync")?;
        tx.execute("DELETE FROM articles", [])
            .context("clear articles")?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO articles (difficulty, title, body) VALUES (?1, ?2, ?3)")
                .context("prepare article insert")?;
            for (difficulty, article) in catalog.iter() {
                stmt.execute(params![difficulty.as_str(), article.title, article.text])
                    .context("insert article")?;
            }
        }
        tx.commit().context("commit article sync")?;
        info!(articles = catalog.len(), "article catalog loaded into database");
        Ok(catalog.len())
    }

    async fn call<T, F>(&self, op: &'static str, f: F) -> Result<T, LobbyError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> Result<T, SqlError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let mut attempt = 0;
            loop {
                match f(&mut conn) {
                    Err(err) if err.is_contention() && attempt < MAX_RETRIES => {
                        std::thread::sleep(RETRY_BASE * 2u32.pow(attempt));
                        attempt += 1;
                    }
                    result => return result,
                }
            }
        })
        .await
        .map_err(LobbyError::backend)?;

        result.map_err(|err| {
            if let SqlError::Sqlite(inner) = &err {
                warn!(op, err = %inner, "database call failed");
            }
            err.into()
        })
    }
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=250;
         CREATE TABLE IF NOT EXISTS accounts (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             username TEXT NOT NULL,
             username_key TEXT NOT NULL UNIQUE,
             password_hash TEXT NOT NULL,
             balance INTEGER NOT NULL CHECK (balance >= 0),
             profile_image TEXT,
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
         );
         CREATE TABLE IF NOT EXISTS race_results (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             account_id INTEGER REFERENCES accounts(id),
             display_name TEXT NOT NULL,
             room_name TEXT NOT NULL,
             difficulty TEXT NOT NULL,
             elapsed_time REAL NOT NULL,
             error_count INTEGER NOT NULL,
             articles_completed INTEGER NOT NULL,
             finished_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
         );
         CREATE INDEX IF NOT EXISTS race_results_account ON race_results(account_id);
         CREATE TABLE IF NOT EXISTS articles (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             difficulty TEXT NOT NULL,
             title TEXT NOT NULL,
             body TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS articles_difficulty ON articles(difficulty);",
    )
    .context("init database schema")?;
    Ok(())
}

fn read_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        username: row.get(1)?,
        balance: row.get(2)?,
        profile_image: row.get(3)?,
    })
}

fn load_account(conn: &Connection, account_id: AccountId) -> Result<Account, SqlError> {
    conn.query_row(
        "SELECT id, username, balance, profile_image FROM accounts WHERE id = ?1",
        params![account_id],
        read_account,
    )
    .optional()?
    .ok_or(SqlError::Lobby(LobbyError::AccountNotFound(account_id)))
}

#[async_trait]
impl Store for SqliteStore {
    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Account, LobbyError> {
        let key = username.trim().to_lowercase();
        let password = password.to_string();
        self.call("verify_credentials", move |conn| {
            let found = conn
                .query_row(
                    "SELECT id, username, balance, profile_image, password_hash
                     FROM accounts WHERE username_key = ?1",
                    params![key],
                    |row| Ok((read_account(row)?, row.get::<_, String>(4)?)),
                )
                .optional()?;
            match found {
                Some((account, hash)) if password::verify(&password, &hash) => Ok(account),
                _ => Err(LobbyError::InvalidCredentials.into()),
            }
        })
        .await
    }

    async fn create_account(&self, username: &str, password: &str) -> Result<Account, LobbyError> {
        let username = password::validate_registration(username, password)?;
        let password = password.to_string();
        let hash = tokio::task::spawn_blocking(move || password::hash(&password))
            .await
            .map_err(LobbyError::backend)?
            .map_err(LobbyError::backend)?;
        let balance = self.starting_balance;
        self.call("create_account", move |conn| {
            let inserted = conn.execute(
                "INSERT INTO accounts (username, username_key, password_hash, balance)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(username_key) DO NOTHING",
                params![username, username.to_lowercase(), hash, balance],
            )?;
            if inserted == 0 {
                return Err(LobbyError::AccountExists(username.clone()).into());
            }
            Ok(Account {
                id: conn.last_insert_rowid(),
                username: username.clone(),
                balance,
                profile_image: None,
            })
        })
        .await
    }

    async fn get_account(&self, account_id: AccountId) -> Result<Account, LobbyError> {
        self.call("get_account", move |conn| load_account(conn, account_id))
            .await
    }

    async fn get_balance(&self, account_id: AccountId) -> Result<i64, LobbyError> {
        self.call("get_balance", move |conn| {
            load_account(conn, account_id).map(|account| account.balance)
        })
        .await
    }

    async fn adjust_balance(&self, account_id: AccountId, delta: i64) -> Result<i64, LobbyError> {
        self.call("adjust_balance", move |conn| {
            let updated = conn
                .query_row(
                    "UPDATE accounts SET balance = balance + ?1
                     WHERE id = ?2 AND balance + ?1 >= 0
                     RETURNING balance",
                    params![delta, account_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            match updated {
                Some(balance) => Ok(balance),
                None => {
                    let balance = load_account(conn, account_id)?.balance;
                    Err(LobbyError::InsufficientFunds {
                        balance,
                        required: delta.saturating_neg(),
                    }
                    .into())
                }
            }
        })
        .await
    }

    async fn get_profile_image(&self, account_id: AccountId) -> Result<Option<String>, LobbyError> {
        self.call("get_profile_image", move |conn| {
            load_account(conn, account_id).map(|account| account.profile_image)
        })
        .await
    }

    async fn set_profile_image(&self, account_id: AccountId, path: &str) -> Result<(), LobbyError> {
        let path = path.to_string();
        self.call("set_profile_image", move |conn| {
            let updated = conn.execute(
                "UPDATE accounts SET profile_image = ?1 WHERE id = ?2",
                params![path, account_id],
            )?;
            if updated == 0 {
                return Err(LobbyError::AccountNotFound(account_id).into());
            }
            Ok(())
        })
        .await
    }

    async fn get_challenge_set(&self, difficulty: Difficulty) -> Result<Vec<Article>, LobbyError> {
        self.call("get_challenge_set", move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT title, body FROM articles WHERE difficulty = ?1 ORDER BY RANDOM()",
            )?;
            let rows = stmt.query_map(params![difficulty.as_str()], |row| {
                Ok(Article {
                    title: row.get(0)?,
                    text: row.get(1)?,
                })
            })?;
            let articles = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(articles)
        })
        .await
    }

    async fn record_result(&self, result: &RaceResult) -> Result<(), LobbyError> {
        let result = result.clone();
        self.call("record_result", move |conn| {
            conn.execute(
                "INSERT INTO race_results
                 (account_id, display_name, room_name, difficulty, elapsed_time, error_count, articles_completed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    result.account_id,
                    result.display_name,
                    result.room_name,
                    result.difficulty.as_str(),
                    result.elapsed_time,
                    result.error_count,
                    result.articles_completed,
                ],
            )?;
            Ok(())
        })
        .await
    }
}
