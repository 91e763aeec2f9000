//! Async shell around the [`Lobby`].
//!
//! The lobby lives behind a `std::sync::Mutex` that is never held across an `.await`.
//! Dispatches are handed to the [`Gateway`] while the lock is still held so every room
//! sees events in processing order. Effects (ledger credits, result recording, countdown
//! timers) run after the lock is released.
//!
//! Operations that must touch the store before mutating (paid admission, bets, login)
//! validate under the lock, release it for the store call, then re-validate and commit.
//! If the commit is refused the store call is compensated with a refund.

use crate::dispatch::{CreditReason, Effect, Gateway, Outbox};
use crate::ledger::Ledger;
use crate::lobby::{Admission, Lobby, LobbyConfig, LobbySnapshot, Payment, PendingCredit};
use crate::store::Store;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use typerace_types::api::{
    normalize_name, scope_hint, AuthResult, ClientEvent, CreateRoomRequest, Credentials,
    JoinRoomRequest, ServerEvent,
};
use typerace_types::{AccountId, ConnectionId, Difficulty, ErrorKind, LobbyError};

/// Attempts made for a ledger credit before it is deferred.
const CREDIT_ATTEMPTS: u32 = 3;
const CREDIT_BACKOFF: Duration = Duration::from_millis(25);

pub struct Coordinator {
    lobby: Mutex<Lobby>,
    store: Arc<dyn Store>,
    ledger: Ledger,
    gateway: Arc<dyn Gateway>,
}

impl Coordinator {
    pub fn new(config: LobbyConfig, store: Arc<dyn Store>, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            lobby: Mutex::new(Lobby::new(config)),
            ledger: Ledger::new(store.clone()),
            store,
            gateway,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn snapshot(&self) -> LobbySnapshot {
        self.read(Lobby::snapshot)
    }

    fn lock(&self) -> MutexGuard<'_, Lobby> {
        match self.lobby.lock() {
            Ok(lobby) => lobby,
            Err(poisoned) => {
                warn!("lobby lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Runs a read-only closure under the lock.
    pub fn read<T>(&self, f: impl FnOnce(&Lobby) -> T) -> T {
        f(&self.lock())
    }

    /// Runs a mutation under the lock and delivers its dispatches before unlocking.
    ///
    /// A failed mutation delivers nothing and yields no effects.
    fn apply<T>(
        &self,
        f: impl FnOnce(&mut Lobby, &mut Outbox) -> Result<T, LobbyError>,
    ) -> (Result<T, LobbyError>, Vec<Effect>) {
        let mut lobby = self.lock();
        let mut out = Outbox::default();
        let result = f(&mut lobby, &mut out);
        if result.is_err() {
            return (result, Vec::new());
        }
        let (dispatches, effects) = out.into_parts();
        for dispatch in &dispatches {
            self.gateway.deliver(dispatch);
        }
        drop(lobby);
        (result, effects)
    }

    async fn commit<T>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut Lobby, &mut Outbox) -> Result<T, LobbyError>,
    ) -> Result<T, LobbyError> {
        let (result, effects) = self.apply(f);
        self.run_effects(effects).await;
        result
    }

    /// Sends one event to one connection, ordered with the lobby's other output.
    fn reply(&self, id: ConnectionId, event: ServerEvent) {
        let _ = self.apply(|_, out| {
            out.to(id, event);
            Ok(())
        });
    }

    async fn run_effects(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ArmCountdown {
                    room,
                    room_id,
                    delay,
                } => self.arm_countdown(room, room_id, delay),
                Effect::Credit {
                    connection,
                    account_id,
                    amount,
                    reason,
                } => match self.credit_with_retry(account_id, amount).await {
                    Ok(balance) => match reason {
                        CreditReason::Payout => {
                            info!(account = account_id, amount, balance, "pot paid out")
                        }
                        CreditReason::Refund => {
                            info!(account = account_id, amount, balance, "bet refunded")
                        }
                    },
                    Err(err) => {
                        let credit = PendingCredit {
                            account_id,
                            amount,
                            reason,
                        };
                        let _ = self.apply(|lobby, out| {
                            lobby.defer_credit(connection, credit, &err, out);
                            Ok(())
                        });
                    }
                },
                Effect::RecordResult(result) => {
                    if let Err(err) = self.store.record_result(&result).await {
                        warn!(room = %result.room_name, account = ?result.account_id, ?err, "failed to record race result");
                    }
                }
            }
        }
    }

    /// Credits the ledger, retrying an unavailable backend with exponential backoff.
    async fn credit_with_retry(
        &self,
        account_id: AccountId,
        amount: i64,
    ) -> Result<i64, LobbyError> {
        let mut backoff = CREDIT_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.ledger.credit(account_id, amount).await {
                Err(err)
                    if err.kind() == ErrorKind::BackendUnavailable && attempt < CREDIT_ATTEMPTS =>
                {
                    debug!(account = account_id, amount, attempt, %err, "credit failed; retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Retries credits deferred for `account_id`, now signed in on `id`.
    async fn settle_pending_credits(self: &Arc<Self>, id: ConnectionId, account_id: AccountId) {
        let (owed, _) = self.apply(|lobby, _| Ok(lobby.take_pending_credits(account_id)));
        let effects: Vec<Effect> = owed
            .unwrap_or_default()
            .into_iter()
            .map(|credit| Effect::Credit {
                connection: id,
                account_id,
                amount: credit.amount,
                reason: credit.reason,
            })
            .collect();
        if !effects.is_empty() {
            info!(account = account_id, credits = effects.len(), "retrying deferred credits");
            self.run_effects(effects).await;
        }
    }

    /// Spawns the one-shot countdown. The timer holds only a weak handle, so a dropped
    /// coordinator cancels it.
    fn arm_countdown(self: &Arc<Self>, room: String, room_id: u64, delay: Duration) {
        let coordinator = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(coordinator) = coordinator.upgrade() else {
                return;
            };
            let (started, _) = coordinator.apply(|lobby, out| Ok(lobby.start_match(&room, room_id, out)));
            if !matches!(started, Ok(true)) {
                debug!(room = %room, room_id, "countdown expired without starting a match");
            }
        });
    }

    /// Registers a connection. The gateway must already be able to reach `id`.
    pub fn connect(&self, id: ConnectionId) {
        let _ = self.apply(|lobby, out| {
            lobby.connect(id, out);
            Ok(())
        });
    }

    pub async fn disconnect(self: &Arc<Self>, id: ConnectionId) {
        let _ = self
            .commit(|lobby, out| {
                lobby.disconnect(id, out);
                Ok(())
            })
            .await;
    }

    /// Handles one inbound event, reporting a failure back to the sender as `actionError`.
    pub async fn handle_and_report(self: &Arc<Self>, id: ConnectionId, event: ClientEvent) {
        let action = event.action();
        if let Err(err) = self.handle(id, event).await {
            match err.kind() {
                ErrorKind::BackendUnavailable => {
                    warn!(connection = %id, action, ?err, "action failed")
                }
                _ => debug!(connection = %id, action, %err, "action rejected"),
            }
            self.reply(id, ServerEvent::action_error(action, &err));
        }
    }

    pub async fn handle(self: &Arc<Self>, id: ConnectionId, event: ClientEvent) -> Result<(), LobbyError> {
        match event {
            ClientEvent::Register(credentials) => self.authenticate(id, credentials, true).await,
            ClientEvent::Login(credentials) => self.authenticate(id, credentials, false).await,
            ClientEvent::SaveUsername(name) => {
                self.commit(|lobby, out| lobby.save_username(id, &name, out))
                    .await
            }
            ClientEvent::CreateRoom(payload) => self.create_room(id, payload.into_request()?).await,
            ClientEvent::JoinRoom(payload) => self.join_room(id, payload.into_request()?).await,
            ClientEvent::LeaveRoom(room) => {
                let name = room.into_name()?;
                self.commit(|lobby, out| lobby.leave_room(id, &name, out))
                    .await
            }
            ClientEvent::PlayerReady(ready) => {
                self.commit(|lobby, out| lobby.set_ready(id, ready, out))
                    .await
            }
            ClientEvent::PlaceBet(payload) => {
                let name = normalize_name("room name", &payload.room_name)?;
                self.place_bet(id, name, payload.amount).await
            }
            ClientEvent::ArticleCompleted(scope) => {
                let hint = scope_hint(scope);
                self.commit(|lobby, out| lobby.article_completed(id, hint.as_deref(), out))
                    .await
            }
            ClientEvent::UpdateProgress(payload) => {
                self.commit(|lobby, out| lobby.update_progress(id, payload.progress, out))
                    .await
            }
            ClientEvent::PlayerMilestone(payload) => {
                self.commit(|lobby, out| lobby.player_milestone(id, payload.milestone, out))
                    .await
            }
            ClientEvent::PlayerError(scope) => {
                let hint = scope_hint(scope);
                self.commit(|lobby, out| lobby.player_error(id, hint.as_deref(), out))
                    .await
            }
            ClientEvent::GameEnded(payload) => {
                self.commit(|lobby, out| lobby.game_ended(id, payload.elapsed_time, out))
                    .await
            }
            ClientEvent::TimeOut(scope) => {
                let hint = scope_hint(scope);
                self.commit(|lobby, out| lobby.time_out(id, hint.as_deref(), out))
                    .await
            }
            ClientEvent::GetRooms => {
                self.apply(|lobby, out| {
                    lobby.list_rooms(id, out);
                    Ok(())
                })
                .0
            }
            ClientEvent::IsRoomFull(room) => {
                let name = room.into_name()?;
                self.apply(|lobby, out| lobby.is_room_full(id, &name, out)).0
            }
            ClientEvent::GetArticles(query) => {
                self.send_articles(id, query.map(|query| query.difficulty()))
                    .await
            }
            ClientEvent::GetLeaderboard => {
                self.apply(|lobby, out| {
                    lobby.send_leaderboard(id, out);
                    Ok(())
                })
                .0
            }
        }
    }

    /// Register or log in, then bind the account to the connection.
    ///
    /// Credential failures are answered with a failed `registerResult`/`loginResult`
    /// rather than `actionError`.
    async fn authenticate(self: &Arc<Self>, id: ConnectionId, credentials: Credentials, register: bool) -> Result<(), LobbyError> {
        let respond: fn(AuthResult) -> ServerEvent = if register {
            ServerEvent::RegisterResult
        } else {
            ServerEvent::LoginResult
        };
        if let Err(err) = self.read(|lobby| lobby.check_can_authenticate(&id)) {
            if err == LobbyError::PlayerNotFound {
                return Err(err);
            }
            self.reply(id, respond(AuthResult::failed(&err)));
            return Ok(());
        }

        let verified = if register {
            self.store
                .create_account(&credentials.username, &credentials.password)
                .await
        } else {
            self.store
                .verify_credentials(&credentials.username, &credentials.password)
                .await
        };
        let account = match verified {
            Ok(account) => account,
            Err(err) => {
                debug!(connection = %id, register, %err, "authentication refused");
                self.reply(id, respond(AuthResult::failed(&err)));
                return Ok(());
            }
        };
        if register {
            info!(account = account.id, username = %account.username, "account registered");
        }

        let bound = self
            .commit(|lobby, out| {
                lobby.bind_account(id, &account, out)?;
                out.to(id, respond(AuthResult::ok(account.clone())));
                Ok(())
            })
            .await;
        if let Err(err) = bound {
            self.reply(id, respond(AuthResult::failed(&err)));
            return Ok(());
        }

        match self.store.get_profile_image(account.id).await {
            Ok(Some(avatar)) => {
                let account_id = account.id;
                self.commit(|lobby, out| {
                    lobby.attach_avatar(id, account_id, avatar, out);
                    Ok(())
                })
                .await?;
            }
            Ok(None) => {}
            Err(err) => warn!(account = account.id, ?err, "failed to load profile image"),
        }
        self.settle_pending_credits(id, account.id).await;
        Ok(())
    }

    async fn collect_fee(&self, admission: Admission) -> Result<Option<Payment>, LobbyError> {
        match admission {
            Admission::Fee { account_id, amount } => {
                let balance = self.ledger.deduct(account_id, amount).await?;
                debug!(account = account_id, amount, balance, "entry fee collected");
                Ok(Some(Payment { account_id, amount }))
            }
            Admission::Free | Admission::AlreadyMember => Ok(None),
        }
    }

    async fn refund(&self, payment: Option<Payment>) {
        let Some(Payment { account_id, amount }) = payment else {
            return;
        };
        match self.ledger.credit(account_id, amount).await {
            Ok(_) => info!(account = account_id, amount, "entry fee refunded after refused admission"),
            Err(err) => warn!(account = account_id, amount, ?err, "failed to refund entry fee"),
        }
    }

    async fn create_room(self: &Arc<Self>, id: ConnectionId, request: CreateRoomRequest) -> Result<(), LobbyError> {
        let admission = self.read(|lobby| lobby.plan_create(&id, &request))?;
        let payment = self.collect_fee(admission).await?;
        let committed = self
            .commit(|lobby, out| lobby.create_room(id, &request, payment, out))
            .await;
        if committed.is_err() {
            self.refund(payment).await;
        }
        committed
    }

    async fn join_room(self: &Arc<Self>, id: ConnectionId, request: JoinRoomRequest) -> Result<(), LobbyError> {
        let admission = self.read(|lobby| lobby.plan_join(&id, &request))?;
        let payment = self.collect_fee(admission).await?;
        let committed = self
            .commit(|lobby, out| lobby.join_room(id, &request, payment, out))
            .await;
        if committed.is_err() {
            self.refund(payment).await;
        }
        committed
    }

    async fn place_bet(self: &Arc<Self>, id: ConnectionId, room: String, amount: i64) -> Result<(), LobbyError> {
        let plan = self.read(|lobby| lobby.plan_bet(&id, &room, amount))?;
        let balance = self.ledger.settle_bet(&plan).await?;
        let committed = self
            .commit(|lobby, out| lobby.commit_bet(id, &plan, balance, out))
            .await;
        if committed.is_err() {
            self.ledger.reverse_bet(&plan).await;
        }
        committed
    }

    /// Sends a challenge set. Without an explicit difficulty the player's room decides.
    async fn send_articles(&self, id: ConnectionId, difficulty: Option<Difficulty>) -> Result<(), LobbyError> {
        let difficulty = match difficulty {
            Some(difficulty) => difficulty,
            None => self
                .read(|lobby| lobby.room_difficulty(&id))
                .unwrap_or_default(),
        };
        let articles = self.store.get_challenge_set(difficulty).await?;
        self.reply(
            id,
            ServerEvent::ArticlesData {
                difficulty,
                articles,
            },
        );
        Ok(())
    }

    /// Delivers an event that did not come from a lobby operation, such as a parse error.
    pub fn notify(&self, id: ConnectionId, event: ServerEvent) {
        self.reply(id, event);
    }
}
