//! LowCard Engine: the state machine, its entry points, and the locking
//! discipline that keeps them safe across replicas.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::state::{now_ms, Game, GameStatus, GameStore, Player, Timer, TimerPhase};
use crate::constants::{
    BIG_GAME_MIN_ENTRY, BIG_GAME_NAME_MARKER, BOT_KEY_PREFIX, BOT_RECORD_TTL, COUNTDOWN_DURATION, DEFAULT_MAX_ENTRY,
    DEFAULT_MIN_ENTRY, DRAW_LOCK_PREFIX, DRAW_LOCK_TTL, HOUSE_FEE_PERCENT, JOIN_LOCK_PREFIX, JOIN_LOCK_RETRY_ATTEMPTS,
    JOIN_LOCK_RETRY_DELAY, JOIN_LOCK_TTL, JOIN_PHASE_DURATION, MERCHANT_COMMISSION_PERCENT, MIN_PLAYERS,
    ROUND_DURATION, STALE_GAME_GRACE, START_LOCK_PREFIX, START_LOCK_TTL, STUCK_WAITING_AGE,
};
use crate::deck::DeckService;
use crate::error::EngineResult;
use crate::events::{CommandOutcome, DomainEvent};
use crate::game_state::{GameStateManager, GameType};
use crate::ledger::{Ledger, MerchantTagHook};
use crate::lock::LockManager;
use crate::store::durable::{DurableStore, LowCardFinishSummary};
use crate::store::keyed::KeyedStore;
use crate::broadcaster::Broadcaster;

/// `lowcard:bot:{R}` presence record shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BotRecord {
    active: bool,
    default_amount: i64,
    created_at: i64,
}

pub struct LowCardEngine<K, D, M, B>
where
    K: KeyedStore,
    D: DurableStore,
    M: MerchantTagHook,
    B: Broadcaster,
{
    keyed: Arc<K>,
    durable: Arc<D>,
    locks: LockManager<K>,
    ledger: Ledger<D, K, M>,
    deck: DeckService<K>,
    game_state: GameStateManager<K>,
    games: GameStore<K>,
    merchant: Arc<M>,
    broadcaster: Arc<B>,
}

impl<K, D, M, B> LowCardEngine<K, D, M, B>
where
    K: KeyedStore,
    D: DurableStore,
    M: MerchantTagHook,
    B: Broadcaster,
{
    pub fn new(keyed: Arc<K>, durable: Arc<D>, merchant: Arc<M>, broadcaster: Arc<B>) -> Self {
        Self {
            locks: LockManager::new(keyed.clone()),
            ledger: Ledger::new(durable.clone(), keyed.clone(), merchant.clone()),
            deck: DeckService::new(keyed.clone()),
            game_state: GameStateManager::new(keyed.clone()),
            games: GameStore::new(keyed.clone()),
            keyed,
            durable,
            merchant,
            broadcaster,
        }
    }

    // -- accessors used by the Timer Poller and Restart Recovery --

    pub fn keyed(&self) -> &Arc<K> {
        &self.keyed
    }

    pub async fn read_game(&self, room_id: &str) -> EngineResult<Option<Game>> {
        self.games.read(room_id).await
    }

    pub async fn read_timer(&self, room_id: &str) -> EngineResult<Option<Timer>> {
        self.games.read_timer(room_id).await
    }

    /// Atomic "claim this exact expiry for processing". Guards the
    /// lock-free `tallyRound`/`autoDrawForTimeout`/`beginGame` dispatch path
    /// against two replicas' pollers both firing on the same expired timer.
    pub async fn claim_timer(&self, room_id: &str, timer: &Timer) -> EngineResult<bool> {
        self.games.claim_timer(room_id, timer).await
    }

    pub async fn write_round_timer(&self, room_id: &str, expires_at: i64, round_number: u32) -> EngineResult<()> {
        self.games
            .write_timer(room_id, &Timer { phase: TimerPhase::Round, expires_at, round_number, created_at: now_ms() })
            .await
    }

    pub async fn broadcast_round_started(&self, room_id: &str, round: u32) -> EngineResult<()> {
        self.broadcaster
            .to_room(room_id, DomainEvent::RoundStarted, json!({"roomId": room_id, "round": round}))
            .await
    }

    /// `game:active:{R}` directory lookup, consulted by the Command Router
    /// to decide whether a scoped play command is in bounds.
    pub async fn active_game_type(&self, room_id: &str) -> EngineResult<Option<GameType>> {
        self.game_state.active_game(room_id).await
    }

    /// `lowcard:bot:{R}` presence record: distinct from `game:active` — this
    /// says LowCard's bot is provisioned for the room at all, independent of
    /// whether a round is in progress right now.
    pub async fn bot_active(&self, room_id: &str) -> EngineResult<bool> {
        match self.keyed.get(&format!("{BOT_KEY_PREFIX}:{room_id}")).await? {
            Some(raw) => Ok(serde_json::from_str::<BotRecord>(&raw).map(|r| r.active).unwrap_or(false)),
            None => Ok(false),
        }
    }

    /// `/bot lowcard add`: refuses if a sibling bot already owns the room,
    /// writes the 7-day presence record, marks LowCard active.
    pub async fn enable_bot(&self, room_id: &str, default_amount: i64) -> EngineResult<CommandOutcome> {
        if let Some(existing) = self.game_state.active_game(room_id).await? {
            if existing != GameType::LowCard {
                return Ok(CommandOutcome::private_error("Another bot is already active in this room."));
            }
        }
        let record = BotRecord { active: true, default_amount, created_at: now_ms() };
        self.keyed
            .set_ttl(&format!("{BOT_KEY_PREFIX}:{room_id}"), &serde_json::to_string(&record)?, BOT_RECORD_TTL)
            .await?;
        self.game_state.set_active(room_id, GameType::LowCard).await?;
        Ok(CommandOutcome::ok_with("Bot is running"))
    }

    /// `/bot lowcard remove`: refunds any waiting game, deletes the
    /// bot/deck/game keys, clears the active game type.
    pub async fn disable_bot(&self, room_id: &str) -> EngineResult<CommandOutcome> {
        if let Some(game) = self.games.read(room_id).await? {
            if game.status == GameStatus::Waiting {
                self.refund_players(room_id, &game.players, game.entry_amount, &format!("LowCard Refund - Bot Removed (Room {room_id})")).await;
            }
        }
        self.cleanup_room(room_id).await?;
        self.keyed.delete(&format!("{BOT_KEY_PREFIX}:{room_id}")).await?;
        Ok(CommandOutcome::ok_with("Bot removed"))
    }

    // -- internal helpers --

    async fn refund_players(&self, room_id: &str, players: &[Player], entry_amount: i64, reason: &str) {
        for p in players {
            match self.ledger.credit(&p.user_id, entry_amount, &p.username, reason).await {
                Ok(balance) => {
                    if let Err(e) = self
                        .broadcaster
                        .to_room(room_id, DomainEvent::CreditsUpdated, json!({"roomId": room_id, "userId": p.user_id, "balance": balance}))
                        .await
                    {
                        tracing::error!(error = %e, user_id = %p.user_id, "credits-updated broadcast failed");
                    }
                }
                Err(e) => tracing::error!(error = %e, user_id = %p.user_id, "CRITICAL: refund failed"),
            }
        }
    }

    async fn cleanup_room(&self, room_id: &str) -> EngineResult<()> {
        self.games.delete(room_id).await?;
        self.games.clear_timer(room_id).await?;
        self.deck.delete(room_id).await?;
        self.game_state.clear(room_id).await?;
        Ok(())
    }

    /// Restart Recovery's refund: every recorded player, regardless of
    /// elimination state, gets their entry back since the whole room is
    /// being torn down, not just resolved mid-round.
    pub async fn refund_for_restart(&self, room_id: &str, game: &Game) -> EngineResult<()> {
        self.refund_players(room_id, &game.players, game.entry_amount, &format!("LowCard Refund - Server Restart (Room {room_id})")).await;
        self.cleanup_room(room_id).await
    }

    /// Refunds and tears down a waiting game abandoned past its join
    /// deadline plus grace period.
    pub async fn check_and_cleanup_stale_game(&self, room_id: &str) -> EngineResult<bool> {
        let Some(game) = self.games.read(room_id).await? else {
            return Ok(false);
        };
        if game.status == GameStatus::Waiting
            && now_ms() > game.join_deadline + STALE_GAME_GRACE.as_millis() as i64
        {
            self.refund_players(room_id, &game.players, game.entry_amount, &format!("LowCard Refund - Stale Game (Room {room_id})")).await;
            self.cleanup_room(room_id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Wraps a startGame failure that happened after the entry fee was
    /// already deducted: refunds it, tears down any partial room state, and
    /// reports the one message the caller is allowed to rely on.
    async fn fail_start_game(&self, room_id: &str, user_id: &str, username: &str, amount: i64, err: impl std::fmt::Display) -> CommandOutcome {
        tracing::error!(error = %err, room_id, "startGame failed after deduct, refunding");
        match self
            .ledger
            .credit(user_id, amount, username, &format!("LowCard Refund - game creation failed (Room {room_id})"))
            .await
        {
            Ok(balance) => {
                if let Err(e) = self
                    .broadcaster
                    .to_room(room_id, DomainEvent::CreditsUpdated, json!({"roomId": room_id, "userId": user_id, "balance": balance}))
                    .await
                {
                    tracing::error!(error = %e, user_id, "credits-updated broadcast failed");
                }
            }
            Err(refund_err) => tracing::error!(error = %refund_err, "CRITICAL: unable to refund after startGame failure"),
        }
        if let Err(cleanup_err) = self.cleanup_room(room_id).await {
            tracing::error!(error = %cleanup_err, room_id, "CRITICAL: cleanup after startGame failure also failed");
        }
        CommandOutcome::private_error("Game creation failed, credits refunded. Try again.")
    }

    // -- entry points --

    /// `startGame(R, userId, username, amount)` — holds `lowcard:lock:{R}` (30s).
    pub async fn start_game(&self, room_id: &str, user_id: &str, username: &str, amount: Option<i64>) -> CommandOutcome {
        let key = format!("{START_LOCK_PREFIX}:{room_id}");
        let token = match self.locks.acquire(&key, START_LOCK_TTL).await {
            Ok(Some(t)) => t,
            Ok(None) => return CommandOutcome::busy(),
            Err(e) => {
                tracing::error!(error = %e, "start lock acquire failed");
                return CommandOutcome::busy();
            }
        };

        let outcome = self.start_game_inner(room_id, user_id, username, amount).await;

        if let Err(e) = self.locks.release(&key, &token).await {
            tracing::error!(error = %e, "failed to release start lock");
        }

        outcome.unwrap_or_else(|e| {
            tracing::error!(error = %e, room_id, "startGame infrastructure fault");
            CommandOutcome::private_error("Game creation failed, credits refunded. Try again.")
        })
    }

    async fn start_game_inner(&self, room_id: &str, user_id: &str, username: &str, amount: Option<i64>) -> EngineResult<CommandOutcome> {
        self.check_and_cleanup_stale_game(room_id).await?;

        if let Some(existing) = self.games.read(room_id).await? {
            let stuck = existing.status == GameStatus::Waiting
                && self.games.read_timer(room_id).await?.is_none()
                && now_ms() - existing.created_at.timestamp_millis() > STUCK_WAITING_AGE.as_millis() as i64;

            if stuck {
                self.refund_players(room_id, &existing.players, existing.entry_amount, &format!("LowCard Refund - Stuck Game (Room {room_id})")).await;
                self.cleanup_room(room_id).await?;
            } else if matches!(existing.status, GameStatus::Waiting | GameStatus::Playing) {
                return Ok(CommandOutcome::private_error("A game is already in progress in this room."));
            } else {
                self.cleanup_room(room_id).await?;
            }
        }

        let room_name = self.durable.room_name(room_id).await?.unwrap_or_default();
        let big_game = room_name.to_lowercase().contains(BIG_GAME_NAME_MARKER);
        let min_entry = if big_game { BIG_GAME_MIN_ENTRY } else { DEFAULT_MIN_ENTRY };

        let amount = amount.unwrap_or(min_entry);
        if amount <= 0 || amount < min_entry {
            return Ok(CommandOutcome::private_error(format!("Minimum entry is {min_entry} COINS.")));
        }
        if !big_game && amount > DEFAULT_MAX_ENTRY {
            return Ok(CommandOutcome::private_error(format!("Maximum entry is {DEFAULT_MAX_ENTRY} COINS.")));
        }

        let game_session_id = uuid::Uuid::new_v4().to_string();
        let deduct = self
            .ledger
            .deduct(user_id, amount, username, &format!("LowCard bet - Room {room_id}"), &game_session_id)
            .await?;
        if !deduct.success {
            return Ok(CommandOutcome::private_error("Not enough credits."));
        }
        if let Err(e) = self
            .broadcaster
            .to_room(room_id, DomainEvent::CreditsUpdated, json!({"roomId": room_id, "userId": user_id, "balance": deduct.balance}))
            .await
        {
            tracing::error!(error = %e, user_id, "credits-updated broadcast failed");
        }

        if let Err(e) = self.durable.insert_game_history_start(user_id, username, "lowcard").await {
            return Ok(self.fail_start_game(room_id, user_id, username, amount, e).await);
        }
        let db_id = match self.durable.insert_lowcard_game(room_id, amount, user_id).await {
            Ok(id) => id,
            Err(e) => return Ok(self.fail_start_game(room_id, user_id, username, amount, e).await),
        };

        let join_deadline = now_ms() + JOIN_PHASE_DURATION.as_millis() as i64;
        let game = Game {
            id: game_session_id,
            db_id,
            room_id: room_id.to_string(),
            status: GameStatus::Waiting,
            entry_amount: amount,
            pot: amount,
            current_round: 0,
            players: vec![Player::new(user_id, username)],
            started_by: user_id.to_string(),
            started_by_username: username.to_string(),
            created_at: Utc::now(),
            join_deadline,
            countdown_ends_at: None,
            round_deadline: None,
            is_tie_breaker: false,
            was_tie_breaker: false,
            is_round_started: false,
            winner_id: None,
            winner_username: None,
            winnings: None,
            house_fee: None,
            finished_at: None,
        };

        if let Err(e) = self.games.write_and_verify(&game).await {
            return Ok(self.fail_start_game(room_id, user_id, username, amount, e).await);
        }

        if let Err(e) = self.game_state.set_active(room_id, GameType::LowCard).await {
            return Ok(self.fail_start_game(room_id, user_id, username, amount, e).await);
        }
        if let Err(e) = self
            .games
            .write_timer(room_id, &Timer { phase: TimerPhase::Join, expires_at: join_deadline, round_number: 0, created_at: now_ms() })
            .await
        {
            return Ok(self.fail_start_game(room_id, user_id, username, amount, e).await);
        }

        self.broadcaster
            .to_room(room_id, DomainEvent::GameStarted, json!({"roomId": room_id, "startedBy": username, "entryAmount": amount}))
            .await?;

        Ok(CommandOutcome::ok_with(format!("LowCard started by {username} for {amount} COINS. Type !j to join.")))
    }

    /// `joinGame(R, userId, username)` — holds `joinlock` (15s, 5 retries x 100ms).
    pub async fn join_game(&self, room_id: &str, user_id: &str, username: &str) -> CommandOutcome {
        let key = format!("{JOIN_LOCK_PREFIX}:{room_id}");
        let token = match self.locks.acquire_with_retry(&key, JOIN_LOCK_TTL, JOIN_LOCK_RETRY_ATTEMPTS, JOIN_LOCK_RETRY_DELAY).await {
            Ok(Some(t)) => t,
            Ok(None) => return CommandOutcome::busy(),
            Err(e) => {
                tracing::error!(error = %e, "join lock acquire failed");
                return CommandOutcome::busy();
            }
        };

        let outcome = self.join_game_inner(room_id, user_id, username).await;

        if let Err(e) = self.locks.release(&key, &token).await {
            tracing::error!(error = %e, "failed to release join lock");
        }

        outcome.unwrap_or_else(|e| {
            tracing::error!(error = %e, room_id, "joinGame infrastructure fault");
            CommandOutcome::private_error("Unable to join right now, please try again.")
        })
    }

    async fn join_game_inner(&self, room_id: &str, user_id: &str, username: &str) -> EngineResult<CommandOutcome> {
        let Some(mut game) = self.games.read(room_id).await? else {
            return Ok(CommandOutcome::silent_reject());
        };
        if game.status != GameStatus::Waiting {
            return Ok(CommandOutcome::silent_reject());
        }
        if now_ms() > game.join_deadline {
            return Ok(CommandOutcome::private_error("Too late to join, the round has already started."));
        }
        if game.find_player(user_id).is_some() {
            return Ok(CommandOutcome::private_error("You already joined this game."));
        }

        let game_session_id = game.id.clone();
        let deduct = self
            .ledger
            .deduct(user_id, game.entry_amount, username, &format!("LowCard bet - Room {room_id}"), &game_session_id)
            .await?;
        if !deduct.success {
            return Ok(CommandOutcome::private_error("Not enough credits."));
        }
        if let Err(e) = self
            .broadcaster
            .to_room(room_id, DomainEvent::CreditsUpdated, json!({"roomId": room_id, "userId": user_id, "balance": deduct.balance}))
            .await
        {
            tracing::error!(error = %e, user_id, "credits-updated broadcast failed");
        }

        game.players.push(Player::new(user_id, username));
        game.recompute_pot();
        self.games.write(&game).await?;

        self.broadcaster
            .to_room(room_id, DomainEvent::PlayerJoined, json!({"roomId": room_id, "userId": user_id, "username": username, "pot": game.pot}))
            .await?;

        Ok(CommandOutcome::ok_with(format!("{username} joined! Pot is now {} COINS.", game.pot)))
    }

    /// `beginGame(R)` — invoked by the Timer Poller; holds `joinlock`.
    pub async fn begin_game(&self, room_id: &str) -> CommandOutcome {
        let key = format!("{JOIN_LOCK_PREFIX}:{room_id}");
        let token = match self.locks.acquire(&key, JOIN_LOCK_TTL).await {
            Ok(Some(t)) => t,
            Ok(None) => return CommandOutcome::busy(),
            Err(e) => {
                tracing::error!(error = %e, "join lock acquire failed");
                return CommandOutcome::busy();
            }
        };

        let outcome = self.begin_game_inner(room_id).await;

        if let Err(e) = self.locks.release(&key, &token).await {
            tracing::error!(error = %e, "failed to release join lock");
        }

        outcome.unwrap_or_else(|e| {
            tracing::error!(error = %e, room_id, "beginGame infrastructure fault");
            CommandOutcome::silent_reject()
        })
    }

    async fn begin_game_inner(&self, room_id: &str) -> EngineResult<CommandOutcome> {
        let Some(mut game) = self.games.read(room_id).await? else {
            return Ok(CommandOutcome::silent_reject());
        };
        // idempotence guard: a second firing on the same expired join timer is a no-op.
        if game.status != GameStatus::Waiting {
            return Ok(CommandOutcome::silent_reject());
        }

        if game.players.len() < MIN_PLAYERS {
            self.refund_players(room_id, &game.players, game.entry_amount, &format!("LowCard Refund - Not Enough Players (Room {room_id})")).await;
            self.cleanup_room(room_id).await?;
            self.broadcaster
                .to_room(room_id, DomainEvent::Cancelled, json!({"roomId": room_id, "reason": "not_enough_players"}))
                .await?;
            return Ok(CommandOutcome::ok_with("Not enough players joined, game cancelled and credits refunded."));
        }

        self.deck.reset(room_id).await?;
        game.status = GameStatus::Playing;
        game.current_round = 1;
        for p in game.players.iter_mut() {
            p.has_drawn = false;
            p.current_card = None;
        }
        let countdown_ends_at = now_ms() + COUNTDOWN_DURATION.as_millis() as i64;
        let round_deadline = countdown_ends_at + ROUND_DURATION.as_millis() as i64;
        game.countdown_ends_at = Some(countdown_ends_at);
        game.round_deadline = Some(round_deadline);
        game.is_round_started = true;
        self.games.write(&game).await?;
        self.games
            .write_timer(room_id, &Timer { phase: TimerPhase::Countdown, expires_at: countdown_ends_at, round_number: 1, created_at: now_ms() })
            .await?;

        self.broadcaster
            .to_room(room_id, DomainEvent::Countdown, json!({"roomId": room_id, "playerCount": game.players.len()}))
            .await?;

        Ok(CommandOutcome::ok())
    }

    /// `drawCardForPlayer(R, userId, username)` — holds `drawlock`.
    pub async fn draw_card_for_player(&self, room_id: &str, user_id: &str, username: &str) -> CommandOutcome {
        let key = format!("{DRAW_LOCK_PREFIX}:{room_id}");
        let token = match self.locks.acquire(&key, DRAW_LOCK_TTL).await {
            Ok(Some(t)) => t,
            Ok(None) => return CommandOutcome::busy(),
            Err(e) => {
                tracing::error!(error = %e, "draw lock acquire failed");
                return CommandOutcome::busy();
            }
        };

        let outcome = self.draw_card_for_player_inner(room_id, user_id, username).await;

        if let Err(e) = self.locks.release(&key, &token).await {
            tracing::error!(error = %e, "failed to release draw lock");
        }

        outcome.unwrap_or_else(|e| {
            tracing::error!(error = %e, room_id, "drawCardForPlayer infrastructure fault");
            CommandOutcome::busy()
        })
    }

    async fn draw_card_for_player_inner(&self, room_id: &str, user_id: &str, username: &str) -> EngineResult<CommandOutcome> {
        let Some(mut game) = self.games.read(room_id).await? else {
            return Ok(CommandOutcome::silent_reject());
        };
        if game.status != GameStatus::Playing {
            return Ok(CommandOutcome::silent_reject());
        }
        let Some(countdown_ends_at) = game.countdown_ends_at else {
            return Ok(CommandOutcome::silent_reject());
        };
        // draw before countdownEndsAt is rejected silently.
        if now_ms() < countdown_ends_at {
            return Ok(CommandOutcome::silent_reject());
        }
        let Some(player) = game.find_player(user_id) else {
            return Ok(CommandOutcome::silent_reject());
        };
        if player.is_eliminated || player.has_drawn {
            return Ok(CommandOutcome::silent_reject());
        }
        if game.is_tie_breaker && !player.in_tie_breaker {
            return Ok(CommandOutcome::silent_reject());
        }

        let card = self.deck.draw(room_id).await?;
        if let Some(p) = game.find_player_mut(user_id) {
            p.current_card = Some(card);
            p.has_drawn = true;
        }
        self.games.write(&game).await?;

        self.broadcaster
            .to_room(room_id, DomainEvent::Draw, json!({"roomId": room_id, "userId": user_id, "card": card.code()}))
            .await?;

        if game.in_scope().into_iter().all(|p| p.has_drawn) {
            if let Err(e) = self.tally_round(room_id, false).await {
                tracing::error!(error = %e, room_id, "tally_round after final draw failed");
            }
        }

        Ok(CommandOutcome::ok_with(format!("{username} draws: [CARD:{}]", card.code())))
    }

    /// `autoDrawForTimeout(R)` — no lock; called only by the Timer Poller,
    /// which serializes itself per room via [`Self::claim_timer`].
    pub async fn auto_draw_for_timeout(&self, room_id: &str) -> EngineResult<()> {
        let Some(mut game) = self.games.read(room_id).await? else {
            return Ok(());
        };
        if game.status != GameStatus::Playing {
            return Ok(());
        }

        let undrawn: Vec<String> = game.in_scope().into_iter().filter(|p| !p.has_drawn).map(|p| p.user_id.clone()).collect();
        if undrawn.is_empty() {
            return Ok(());
        }

        for user_id in undrawn {
            let card = self.deck.draw(room_id).await?;
            let username = game.find_player(&user_id).map(|p| p.username.clone()).unwrap_or_default();
            if let Some(p) = game.find_player_mut(&user_id) {
                p.current_card = Some(card);
                p.has_drawn = true;
            }
            self.broadcaster
                .to_room(room_id, DomainEvent::ChatMessage, json!({"text": format!("Bot draws - {username}: [CARD:{}]", card.code())}))
                .await?;
        }
        self.games.write(&game).await?;
        Ok(())
    }

    /// `tallyRound(R, isTimedOut)` — no lock (phase-bound).
    pub async fn tally_round(&self, room_id: &str, is_timed_out: bool) -> EngineResult<CommandOutcome> {
        let Some(mut game) = self.games.read(room_id).await? else {
            return Ok(CommandOutcome::silent_reject());
        };
        if game.status != GameStatus::Playing {
            return Ok(CommandOutcome::silent_reject());
        }

        let scope_ids: Vec<String> = game.in_scope().into_iter().map(|p| p.user_id.clone()).collect();
        let mut min_value: Option<u8> = None;
        for id in &scope_ids {
            if let Some(card) = game.find_player(id).and_then(|p| p.current_card) {
                min_value = Some(min_value.map_or(card.value, |m| m.min(card.value)));
            }
        }
        let Some(min_value) = min_value else {
            // nobody in scope has drawn yet; a stray/duplicate poller tick, no-op.
            return Ok(CommandOutcome::silent_reject());
        };

        let losers: Vec<String> = scope_ids
            .iter()
            .filter(|id| game.find_player(id).and_then(|p| p.current_card).map(|c| c.value) == Some(min_value))
            .cloned()
            .collect();

        let was_tie_breaker = game.was_tie_breaker;
        let timeout_note = if is_timed_out { " (round timed out)" } else { "" };

        if losers.len() == 1 {
            let loser_id = losers[0].clone();
            let loser_name = game.find_player(&loser_id).map(|p| p.username.clone()).unwrap_or_default();
            if let Some(p) = game.find_player_mut(&loser_id) {
                p.is_eliminated = true;
            }
            game.is_tie_breaker = false;
            game.was_tie_breaker = false;
            for p in game.players.iter_mut() {
                p.in_tie_breaker = false;
            }

            let remaining = game.non_eliminated().count();
            let prefix = if was_tie_breaker { "Tie broken! " } else { "" };

            if remaining < 2 {
                self.games.write(&game).await?;
                return self.finish_game(room_id, &format!("{prefix}{loser_name} is eliminated.{timeout_note}")).await;
            }

            game.current_round += 1;
            for p in game.players.iter_mut().filter(|p| !p.is_eliminated) {
                p.has_drawn = false;
                p.current_card = None;
            }
            let countdown_ends_at = now_ms() + COUNTDOWN_DURATION.as_millis() as i64;
            let round_deadline = countdown_ends_at + ROUND_DURATION.as_millis() as i64;
            game.countdown_ends_at = Some(countdown_ends_at);
            game.round_deadline = Some(round_deadline);
            game.is_round_started = false;
            self.games.write(&game).await?;
            self.games
                .write_timer(room_id, &Timer { phase: TimerPhase::Countdown, expires_at: countdown_ends_at, round_number: game.current_round, created_at: now_ms() })
                .await?;

            self.broadcaster
                .to_room(room_id, DomainEvent::RoundTallied, json!({"roomId": room_id, "eliminated": loser_id, "round": game.current_round}))
                .await?;
            self.broadcaster
                .to_room(room_id, DomainEvent::ChatMessage, json!({"text": format!("{prefix}{loser_name} drew the lowest card and is eliminated.{timeout_note}")}))
                .await?;
            Ok(CommandOutcome::ok())
        } else {
            game.is_tie_breaker = true;
            game.was_tie_breaker = true;
            for p in game.players.iter_mut() {
                p.in_tie_breaker = losers.contains(&p.user_id) && !p.is_eliminated;
                if p.in_tie_breaker {
                    p.has_drawn = false;
                    p.current_card = None;
                }
            }
            game.current_round += 1;
            let countdown_ends_at = now_ms() + COUNTDOWN_DURATION.as_millis() as i64;
            let round_deadline = countdown_ends_at + ROUND_DURATION.as_millis() as i64;
            game.countdown_ends_at = Some(countdown_ends_at);
            game.round_deadline = Some(round_deadline);
            game.is_round_started = false;
            self.games.write(&game).await?;
            self.games
                .write_timer(room_id, &Timer { phase: TimerPhase::Countdown, expires_at: countdown_ends_at, round_number: game.current_round, created_at: now_ms() })
                .await?;

            let names: Vec<String> = losers.iter().filter_map(|id| game.find_player(id).map(|p| p.username.clone())).collect();
            self.broadcaster
                .to_room(room_id, DomainEvent::RoundTallied, json!({"roomId": room_id, "tie": names, "round": game.current_round}))
                .await?;
            Ok(CommandOutcome::ok())
        }
    }

    /// `finishGame` (internal): settles the pot, pays the winner, tears the room down.
    async fn finish_game(&self, room_id: &str, note: &str) -> EngineResult<CommandOutcome> {
        let Some(mut game) = self.games.read(room_id).await? else {
            return Ok(CommandOutcome::silent_reject());
        };

        let winner = game.non_eliminated().next().map(|p| (p.user_id.clone(), p.username.clone()));
        let pot = game.pot;
        let house_fee = pot * HOUSE_FEE_PERCENT as i64 / 100;
        let winnings = pot - house_fee;

        if let Some((winner_id, winner_username)) = &winner {
            let balance = self.ledger.credit(winner_id, winnings, winner_username, &format!("LowCard win - Room {room_id}")).await?;
            if let Err(e) = self
                .broadcaster
                .to_room(room_id, DomainEvent::CreditsUpdated, json!({"roomId": room_id, "userId": winner_id, "balance": balance}))
                .await
            {
                tracing::error!(error = %e, user_id = %winner_id, "credits-updated broadcast failed");
            }
            self.durable.insert_game_history_win(winner_id, winner_username, "lowcard", winnings).await?;
        }

        let summary = LowCardFinishSummary {
            pot,
            winner_id: winner.as_ref().map(|(id, _)| id.clone()),
            winner_username: winner.as_ref().map(|(_, name)| name.clone()),
            house_fee,
            player_count: game.players.len() as i64,
        };
        self.durable.finish_lowcard_game(game.db_id, summary.clone()).await?;
        self.durable.insert_lowcard_history(game.db_id, summary).await?;

        if let Some(merchant_id) = self.merchant.active_merchant_for(&game.started_by).await? {
            let commission = house_fee * MERCHANT_COMMISSION_PERCENT as i64 / 100;
            if let Err(e) = self.merchant.pay_commission(&merchant_id, commission).await {
                tracing::error!(error = %e, "CRITICAL: merchant commission payout failed");
            }
        }

        game.status = GameStatus::Finished;
        game.winner_id = winner.as_ref().map(|(id, _)| id.clone());
        game.winner_username = winner.as_ref().map(|(_, name)| name.clone());
        game.winnings = Some(winnings);
        game.house_fee = Some(house_fee);
        game.finished_at = Some(Utc::now());

        self.cleanup_room(room_id).await?;

        self.broadcaster
            .to_room(
                room_id,
                DomainEvent::Finished,
                json!({"roomId": room_id, "winnerId": game.winner_id, "winnerUsername": game.winner_username, "winnings": winnings, "houseFee": house_fee, "note": note}),
            )
            .await?;

        Ok(CommandOutcome::ok_with(note.to_string()))
    }

    /// `cancelByStarter(R, userId)`: only while `waiting`, only by `startedBy`.
    pub async fn cancel_by_starter(&self, room_id: &str, user_id: &str) -> EngineResult<CommandOutcome> {
        let Some(game) = self.games.read(room_id).await? else {
            return Ok(CommandOutcome::silent_reject());
        };
        if game.status != GameStatus::Waiting {
            return Ok(CommandOutcome::silent_reject());
        }
        if game.started_by != user_id {
            return Ok(CommandOutcome::private_error("Only the game starter can cancel."));
        }

        self.refund_players(room_id, &game.players, game.entry_amount, &format!("LowCard Refund - Cancelled (Room {room_id})")).await;
        self.cleanup_room(room_id).await?;
        self.broadcaster
            .to_room(room_id, DomainEvent::Cancelled, json!({"roomId": room_id, "reason": "cancelled"}))
            .await?;

        Ok(CommandOutcome::ok_with("Game cancelled, credits refunded."))
    }

    /// `stopGame(R)`: allowed only while `waiting`.
    pub async fn stop_game(&self, room_id: &str) -> EngineResult<CommandOutcome> {
        let Some(game) = self.games.read(room_id).await? else {
            return Ok(CommandOutcome::silent_reject());
        };
        if game.status != GameStatus::Waiting {
            return Ok(CommandOutcome::silent_reject());
        }

        self.refund_players(room_id, &game.players, game.entry_amount, &format!("LowCard Refund - Stopped (Room {room_id})")).await;
        self.cleanup_room(room_id).await?;
        self.broadcaster
            .to_room(room_id, DomainEvent::Cancelled, json!({"roomId": room_id, "reason": "stopped"}))
            .await?;

        Ok(CommandOutcome::ok_with("Game stopped, credits refunded."))
    }

    /// `resetGame(R, byUsername)`: unconditional.
    pub async fn reset_game(&self, room_id: &str, by_username: &str) -> EngineResult<CommandOutcome> {
        let Some(game) = self.games.read(room_id).await? else {
            return Ok(CommandOutcome::silent_reject());
        };

        let survivors: Vec<Player> = game.players.iter().filter(|p| !p.is_eliminated).cloned().collect();
        self.refund_players(room_id, &survivors, game.entry_amount, &format!("LowCard Refund - Reset by {by_username} (Room {room_id})")).await;
        self.cleanup_room(room_id).await?;
        self.broadcaster
            .to_room(room_id, DomainEvent::Cancelled, json!({"roomId": room_id, "reason": "reset"}))
            .await?;

        Ok(CommandOutcome::ok_with("Game reset."))
    }

    // -- test seams: force wall-clock-gated fields past their deadline
    // without sleeping real time in unit tests. --

    #[cfg(test)]
    pub async fn test_force_countdown_now(&self, room_id: &str) -> EngineResult<()> {
        if let Some(mut game) = self.games.read(room_id).await? {
            game.countdown_ends_at = Some(now_ms() - 1);
            self.games.write(&game).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn test_force_join_deadline_passed(&self, room_id: &str) -> EngineResult<()> {
        if let Some(mut game) = self.games.read(room_id).await? {
            game.join_deadline = now_ms() - 1;
            self.games.write(&game).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn test_force_created_at_stale(&self, room_id: &str) -> EngineResult<()> {
        if let Some(mut game) = self.games.read(room_id).await? {
            game.created_at = Utc::now() - chrono::Duration::seconds(41);
            self.games.write(&game).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::LoggingBroadcaster;
    use crate::constants::{DECK_KEY_PREFIX, TIMER_KEY_PREFIX, TIMER_KEY_SUFFIX};
    use crate::deck::{Card, Suit};
    use crate::ledger::NullMerchantTagHook;
    use crate::store::durable::InMemoryDurableStore;
    use crate::store::keyed::InMemoryKeyedStore;
    use std::time::Duration;

    type TestEngine = LowCardEngine<InMemoryKeyedStore, InMemoryDurableStore, NullMerchantTagHook, LoggingBroadcaster>;

    fn build() -> (Arc<TestEngine>, Arc<InMemoryKeyedStore>, Arc<InMemoryDurableStore>) {
        let keyed = InMemoryKeyedStore::new();
        let durable = InMemoryDurableStore::new();
        let engine = Arc::new(LowCardEngine::new(
            keyed.clone(),
            durable.clone(),
            Arc::new(NullMerchantTagHook),
            Arc::new(LoggingBroadcaster::new()),
        ));
        (engine, keyed, durable)
    }

    /// Overwrites the room's deck so draws come out, in order, exactly as
    /// `draw_order` specifies (the deck pops from the tail, so the stored
    /// order is the reverse). Stands in for injected-RNG determinism.
    async fn set_deck(keyed: &InMemoryKeyedStore, room_id: &str, draw_order: Vec<Card>) {
        let mut stored = draw_order;
        stored.reverse();
        let raw = serde_json::to_string(&stored).unwrap();
        keyed.set_ttl(&format!("{DECK_KEY_PREFIX}:{room_id}"), &raw, Duration::from_secs(3600)).await.unwrap();
    }

    async fn expire_join_timer(keyed: &InMemoryKeyedStore, room_id: &str) {
        keyed.delete(&format!("{TIMER_KEY_PREFIX}:{room_id}:{TIMER_KEY_SUFFIX}")).await.unwrap();
    }

    #[tokio::test]
    async fn three_player_game_eliminates_down_to_one_winner() {
        let (engine, keyed, durable) = build();
        durable.seed_credits("alice", 100).await;
        durable.seed_credits("bob", 100).await;
        durable.seed_credits("carol", 100).await;

        assert!(engine.start_game("r1", "alice", "Alice", Some(10)).await.success);
        assert!(engine.join_game("r1", "bob", "Bob").await.success);
        assert!(engine.join_game("r1", "carol", "Carol").await.success);

        assert!(engine.begin_game("r1").await.success);
        engine.test_force_countdown_now("r1").await.unwrap();

        set_deck(
            &keyed,
            "r1",
            vec![
                Card { value: 5, suit: Suit::Hearts },
                Card { value: 9, suit: Suit::Diamonds },
                Card { value: 13, suit: Suit::Spades },
            ],
        )
        .await;
        engine.draw_card_for_player("r1", "alice", "Alice").await;
        engine.draw_card_for_player("r1", "bob", "Bob").await;
        engine.draw_card_for_player("r1", "carol", "Carol").await;

        // the last draw closes the round on its own; no explicit tally call needed.
        let game = engine.read_game("r1").await.unwrap().unwrap();
        assert!(game.find_player("alice").unwrap().is_eliminated);
        assert_eq!(game.current_round, 2);

        engine.test_force_countdown_now("r1").await.unwrap();
        set_deck(
            &keyed,
            "r1",
            vec![Card { value: 4, suit: Suit::Clubs }, Card { value: 7, suit: Suit::Hearts }],
        )
        .await;
        engine.draw_card_for_player("r1", "bob", "Bob").await;
        engine.draw_card_for_player("r1", "carol", "Carol").await;

        assert!(engine.read_game("r1").await.unwrap().is_none());
        assert_eq!(durable.get_credits("alice").await.unwrap(), 90);
        assert_eq!(durable.get_credits("bob").await.unwrap(), 90);
        assert_eq!(durable.get_credits("carol").await.unwrap(), 117);
    }

    #[tokio::test]
    async fn tied_low_card_triggers_tie_breaker_round() {
        let (engine, keyed, durable) = build();
        durable.seed_credits("alice", 100).await;
        durable.seed_credits("bob", 100).await;
        durable.seed_credits("carol", 100).await;

        engine.start_game("r2", "alice", "Alice", Some(20)).await;
        engine.join_game("r2", "bob", "Bob").await;
        engine.join_game("r2", "carol", "Carol").await;
        engine.begin_game("r2").await;
        engine.test_force_countdown_now("r2").await.unwrap();

        set_deck(
            &keyed,
            "r2",
            vec![
                Card { value: 5, suit: Suit::Hearts },
                Card { value: 5, suit: Suit::Diamonds },
                Card { value: 9, suit: Suit::Clubs },
            ],
        )
        .await;
        engine.draw_card_for_player("r2", "alice", "Alice").await;
        engine.draw_card_for_player("r2", "bob", "Bob").await;
        engine.draw_card_for_player("r2", "carol", "Carol").await;

        let game = engine.read_game("r2").await.unwrap().unwrap();
        assert!(game.is_tie_breaker);
        assert!(game.find_player("alice").unwrap().in_tie_breaker);
        assert!(game.find_player("bob").unwrap().in_tie_breaker);
        assert!(!game.find_player("carol").unwrap().in_tie_breaker);

        engine.test_force_countdown_now("r2").await.unwrap();
        set_deck(
            &keyed,
            "r2",
            vec![Card { value: 6, suit: Suit::Spades }, Card { value: 8, suit: Suit::Hearts }],
        )
        .await;
        engine.draw_card_for_player("r2", "alice", "Alice").await;
        engine.draw_card_for_player("r2", "bob", "Bob").await;

        let game = engine.read_game("r2").await.unwrap().unwrap();
        assert!(game.find_player("alice").unwrap().is_eliminated);
        assert!(!game.is_tie_breaker);
        assert_eq!(game.current_round, 3);

        engine.test_force_countdown_now("r2").await.unwrap();
        set_deck(
            &keyed,
            "r2",
            vec![Card { value: 10, suit: Suit::Clubs }, Card { value: 9, suit: Suit::Spades }],
        )
        .await;
        engine.draw_card_for_player("r2", "bob", "Bob").await;
        engine.draw_card_for_player("r2", "carol", "Carol").await;

        assert!(engine.read_game("r2").await.unwrap().is_none());
        assert_eq!(durable.get_credits("bob").await.unwrap(), 134);
    }

    #[tokio::test]
    async fn join_deadline_with_one_player_refunds_and_cancels() {
        let (engine, _keyed, durable) = build();
        durable.seed_credits("alice", 100).await;
        engine.start_game("r3", "alice", "Alice", Some(5)).await;

        let outcome = engine.begin_game("r3").await;
        assert!(outcome.success);
        assert_eq!(durable.get_credits("alice").await.unwrap(), 100);
        assert!(engine.read_game("r3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn same_player_cannot_join_twice() {
        let (engine, _keyed, durable) = build();
        durable.seed_credits("alice", 100).await;
        durable.seed_credits("bob", 100).await;
        engine.start_game("r5", "alice", "Alice", Some(10)).await;

        let (a, b) = tokio::join!(engine.join_game("r5", "bob", "Bob"), engine.join_game("r5", "bob", "Bob"));
        let successes = [a.success, b.success].iter().filter(|s| **s).count();
        assert_eq!(successes, 1);
        assert_eq!(durable.get_credits("bob").await.unwrap(), 90);
    }

    #[tokio::test]
    async fn cancel_by_non_starter_is_rejected() {
        let (engine, _keyed, durable) = build();
        durable.seed_credits("alice", 100).await;
        durable.seed_credits("bob", 100).await;
        engine.start_game("r6", "alice", "Alice", Some(10)).await;
        engine.join_game("r6", "bob", "Bob").await;

        let outcome = engine.cancel_by_starter("r6", "bob").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.message.as_deref(), Some("Only the game starter can cancel."));
    }

    #[tokio::test]
    async fn zero_entry_amount_is_rejected() {
        let (engine, _keyed, durable) = build();
        durable.seed_credits("alice", 100).await;
        let outcome = engine.start_game("b1", "alice", "Alice", Some(0)).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn entry_amount_over_max_is_rejected_in_normal_room() {
        let (engine, _keyed, durable) = build();
        durable.seed_credits("alice", 2_000_000_000).await;
        let outcome = engine.start_game("b2", "alice", "Alice", Some(1_000_000_000)).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn join_after_deadline_is_rejected() {
        let (engine, _keyed, durable) = build();
        durable.seed_credits("alice", 100).await;
        durable.seed_credits("bob", 100).await;
        engine.start_game("b3", "alice", "Alice", Some(10)).await;
        engine.test_force_join_deadline_passed("b3").await.unwrap();

        let outcome = engine.join_game("b3", "bob", "Bob").await;
        assert!(!outcome.success);
        assert_eq!(durable.get_credits("bob").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn draw_before_countdown_is_rejected_silently() {
        let (engine, _keyed, durable) = build();
        durable.seed_credits("alice", 100).await;
        durable.seed_credits("bob", 100).await;
        engine.start_game("b4", "alice", "Alice", Some(10)).await;
        engine.join_game("b4", "bob", "Bob").await;
        engine.begin_game("b4").await;

        let outcome = engine.draw_card_for_player("b4", "alice", "Alice").await;
        assert!(!outcome.success);
        assert!(outcome.silent);
    }

    #[tokio::test]
    async fn second_start_while_waiting_is_rejected() {
        let (engine, _keyed, durable) = build();
        durable.seed_credits("alice", 100).await;
        durable.seed_credits("bob", 100).await;
        engine.start_game("b5", "alice", "Alice", Some(10)).await;

        let outcome = engine.start_game("b5", "bob", "Bob", Some(10)).await;
        assert!(!outcome.success);
        assert_eq!(durable.get_credits("bob").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn stuck_waiting_game_is_autocleaned_on_next_start() {
        let (engine, keyed, durable) = build();
        durable.seed_credits("alice", 100).await;
        durable.seed_credits("bob", 100).await;
        engine.start_game("b6", "alice", "Alice", Some(10)).await;

        expire_join_timer(&keyed, "b6").await;
        engine.test_force_created_at_stale("b6").await.unwrap();

        let outcome = engine.start_game("b6", "bob", "Bob", Some(10)).await;
        assert!(outcome.success);
        assert_eq!(durable.get_credits("alice").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn has_drawn_flag_resets_every_round() {
        let (engine, keyed, durable) = build();
        durable.seed_credits("alice", 100).await;
        durable.seed_credits("bob", 100).await;
        durable.seed_credits("carol", 100).await;
        engine.start_game("r3rt", "alice", "Alice", Some(10)).await;
        engine.join_game("r3rt", "bob", "Bob").await;
        engine.join_game("r3rt", "carol", "Carol").await;
        engine.begin_game("r3rt").await;
        engine.test_force_countdown_now("r3rt").await.unwrap();

        set_deck(
            &keyed,
            "r3rt",
            vec![
                Card { value: 5, suit: Suit::Hearts },
                Card { value: 9, suit: Suit::Diamonds },
                Card { value: 13, suit: Suit::Spades },
            ],
        )
        .await;
        engine.draw_card_for_player("r3rt", "alice", "Alice").await;
        engine.draw_card_for_player("r3rt", "bob", "Bob").await;
        engine.draw_card_for_player("r3rt", "carol", "Carol").await;

        let game = engine.read_game("r3rt").await.unwrap().unwrap();
        for p in game.in_scope() {
            assert!(!p.has_drawn);
            assert!(p.current_card.is_none());
        }
    }

    #[tokio::test]
    async fn last_draw_in_a_round_tallies_without_waiting_for_the_timer() {
        let (engine, keyed, durable) = build();
        durable.seed_credits("alice", 100).await;
        durable.seed_credits("bob", 100).await;
        engine.start_game("r7", "alice", "Alice", Some(10)).await;
        engine.join_game("r7", "bob", "Bob").await;
        engine.begin_game("r7").await;
        engine.test_force_countdown_now("r7").await.unwrap();

        set_deck(&keyed, "r7", vec![Card { value: 4, suit: Suit::Clubs }, Card { value: 9, suit: Suit::Hearts }]).await;
        engine.draw_card_for_player("r7", "alice", "Alice").await;
        engine.draw_card_for_player("r7", "bob", "Bob").await;

        // two players, one elimination away from a winner: the round is
        // fully decided and the room torn down by the draw itself.
        assert!(engine.read_game("r7").await.unwrap().is_none());
        assert_eq!(durable.get_credits("bob").await.unwrap(), 108);

        // a stray poller tick that still fires afterward is a harmless no-op.
        let outcome = engine.tally_round("r7", false).await.unwrap();
        assert!(!outcome.success);
    }
}
