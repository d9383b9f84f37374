//! The LowCard game snapshot and its persistence in the keyed store, plus
//! the phase timer (`room:{R}:lowcard:timer`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::{GAME_KEY_PREFIX, GAME_SNAPSHOT_TTL, TIMER_KEY_PREFIX, TIMER_KEY_SUFFIX, TIMER_TTL};
use crate::deck::Card;
use crate::error::{EngineError, EngineResult};
use crate::store::keyed::KeyedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Waiting,
    Playing,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub user_id: String,
    pub username: String,
    pub is_eliminated: bool,
    pub has_drawn: bool,
    pub current_card: Option<Card>,
    pub in_tie_breaker: bool,
}

impl Player {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            is_eliminated: false,
            has_drawn: false,
            current_card: None,
            in_tie_breaker: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub db_id: i64,
    pub room_id: String,
    pub status: GameStatus,
    pub entry_amount: i64,
    pub pot: i64,
    pub current_round: u32,
    pub players: Vec<Player>,
    pub started_by: String,
    pub started_by_username: String,
    pub created_at: DateTime<Utc>,
    pub join_deadline: i64,
    pub countdown_ends_at: Option<i64>,
    pub round_deadline: Option<i64>,
    pub is_tie_breaker: bool,
    pub was_tie_breaker: bool,
    pub is_round_started: bool,
    pub winner_id: Option<String>,
    pub winner_username: Option<String>,
    pub winnings: Option<i64>,
    pub house_fee: Option<i64>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Game {
    /// pot == entryAmount * player count.
    pub fn recompute_pot(&mut self) {
        self.pot = self.entry_amount * self.players.len() as i64;
    }

    pub fn find_player(&self, user_id: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.user_id == user_id)
    }

    pub fn find_player_mut(&mut self, user_id: &str) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn non_eliminated(&self) -> impl Iterator<Item = &Player> {
        self.players.iter().filter(|p| !p.is_eliminated)
    }

    /// Players "in scope" for the current round: all non-eliminated players
    /// normally, or just the tied players during a tie-breaker.
    pub fn in_scope(&self) -> Vec<&Player> {
        if self.is_tie_breaker {
            self.players.iter().filter(|p| !p.is_eliminated && p.in_tie_breaker).collect()
        } else {
            self.players.iter().filter(|p| !p.is_eliminated).collect()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerPhase {
    Join,
    Countdown,
    Round,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer {
    pub phase: TimerPhase,
    pub expires_at: i64,
    pub round_number: u32,
    pub created_at: i64,
}

pub fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as i64
}

pub struct GameStore<S: KeyedStore> {
    store: Arc<S>,
}

impl<S: KeyedStore> GameStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    fn game_key(room_id: &str) -> String {
        format!("{GAME_KEY_PREFIX}:{room_id}")
    }

    fn timer_key(room_id: &str) -> String {
        format!("{TIMER_KEY_PREFIX}:{room_id}:{TIMER_KEY_SUFFIX}")
    }

    pub async fn read(&self, room_id: &str) -> EngineResult<Option<Game>> {
        match self.store.get(&Self::game_key(room_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn write(&self, game: &Game) -> EngineResult<()> {
        let raw = serde_json::to_string(game)?;
        self.store.set_ttl(&Self::game_key(&game.room_id), &raw, GAME_SNAPSHOT_TTL).await
    }

    /// Write, then read back and compare. Used only on initial creation,
    /// where an undetected write failure would otherwise strand a deducted
    /// entry fee with no snapshot to refund from.
    pub async fn write_and_verify(&self, game: &Game) -> EngineResult<()> {
        self.write(game).await?;
        let read_back = self.read(&game.room_id).await?;
        match read_back {
            Some(g) if g.id == game.id => Ok(()),
            _ => Err(EngineError::VerificationFailed),
        }
    }

    pub async fn delete(&self, room_id: &str) -> EngineResult<()> {
        self.store.delete(&Self::game_key(room_id)).await
    }

    pub async fn read_timer(&self, room_id: &str) -> EngineResult<Option<Timer>> {
        match self.store.get(&Self::timer_key(room_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn write_timer(&self, room_id: &str, timer: &Timer) -> EngineResult<()> {
        let raw = serde_json::to_string(timer)?;
        self.store.set_ttl(&Self::timer_key(room_id), &raw, TIMER_TTL).await
    }

    pub async fn clear_timer(&self, room_id: &str) -> EngineResult<()> {
        self.store.delete(&Self::timer_key(room_id)).await
    }

    /// Atomic "delete only if the timer still matches `expected`" — lets a
    /// poller claim exclusive right to process one expiry even when no lock
    /// is held for the dispatch itself.
    pub async fn claim_timer(&self, room_id: &str, expected: &Timer) -> EngineResult<bool> {
        let raw = serde_json::to_string(expected)?;
        self.store.compare_and_delete(&Self::timer_key(room_id), &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::keyed::InMemoryKeyedStore;

    fn sample_game(room_id: &str) -> Game {
        Game {
            id: "g1".to_string(),
            db_id: 1,
            room_id: room_id.to_string(),
            status: GameStatus::Waiting,
            entry_amount: 10,
            pot: 10,
            current_round: 0,
            players: vec![Player::new("alice", "Alice")],
            started_by: "alice".to_string(),
            started_by_username: "Alice".to_string(),
            created_at: Utc::now(),
            join_deadline: now_ms() + 30_000,
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
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let store = GameStore::new(InMemoryKeyedStore::new());
        let game = sample_game("r1");
        store.write(&game).await.unwrap();
        let read = store.read("r1").await.unwrap().unwrap();
        assert_eq!(read.id, "g1");
        assert_eq!(read.players.len(), 1);
    }

    #[tokio::test]
    async fn write_and_verify_succeeds_when_readback_matches() {
        let store = GameStore::new(InMemoryKeyedStore::new());
        let game = sample_game("r2");
        store.write_and_verify(&game).await.unwrap();
    }

    #[tokio::test]
    async fn delete_removes_snapshot_and_timer_independently() {
        let store = GameStore::new(InMemoryKeyedStore::new());
        let game = sample_game("r3");
        store.write(&game).await.unwrap();
        store
            .write_timer("r3", &Timer { phase: TimerPhase::Join, expires_at: now_ms() + 1000, round_number: 0, created_at: now_ms() })
            .await
            .unwrap();

        store.delete("r3").await.unwrap();
        assert!(store.read("r3").await.unwrap().is_none());
        assert!(store.read_timer("r3").await.unwrap().is_some());

        store.clear_timer("r3").await.unwrap();
        assert!(store.read_timer("r3").await.unwrap().is_none());
    }

    #[test]
    fn recompute_pot_equals_entry_amount_times_player_count() {
        let mut game = sample_game("r4");
        game.players.push(Player::new("bob", "Bob"));
        game.recompute_pot();
        assert_eq!(game.pot, game.entry_amount * game.players.len() as i64);
    }
}
