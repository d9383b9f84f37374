//! Durable Store: the relational store holding `users.credits`,
//! `credit_logs`, `game_history`, and the LowCard-specific tables. The core
//! only ever calls the operations below — never raw SQL from engine code.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::EngineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    GameBet,
    GameWin,
    GameRefund,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::GameBet => "game_bet",
            TransactionType::GameWin => "game_win",
            TransactionType::GameRefund => "game_refund",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreditLogEntry {
    pub user_id: String,
    pub username: String,
    pub amount: i64,
    pub transaction_type: TransactionType,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct LowCardGameRow {
    pub db_id: i64,
    pub room_id: String,
    pub entry_amount: i64,
    pub started_by: String,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct LowCardFinishSummary {
    pub pot: i64,
    pub winner_id: Option<String>,
    pub winner_username: Option<String>,
    pub house_fee: i64,
    pub player_count: i64,
}

/// The durable SQL surface. A trait so engine tests run against
/// [`InMemoryDurableStore`] without a live Postgres instance.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get_credits(&self, user_id: &str) -> EngineResult<i64>;

    /// Conditional decrement: succeeds only if `credits >= amount`. Returns
    /// the new balance on success, `None` if the row wasn't updated.
    async fn conditional_deduct(&self, user_id: &str, amount: i64) -> EngineResult<Option<i64>>;

    /// Unconditional increment, returns the new balance.
    async fn credit(&self, user_id: &str, amount: i64) -> EngineResult<i64>;

    async fn insert_credit_log(&self, entry: CreditLogEntry) -> EngineResult<()>;

    /// Row written at game start: `result=lose, reward=0`.
    async fn insert_game_history_start(&self, user_id: &str, username: &str, game: &str) -> EngineResult<()>;

    /// Row written at finish for the winner: `result=win, reward=winnings`.
    async fn insert_game_history_win(&self, user_id: &str, username: &str, game: &str, reward: i64) -> EngineResult<()>;

    /// Insert a `lowcard_games` row in `waiting` status, returns its db id.
    async fn insert_lowcard_game(&self, room_id: &str, entry_amount: i64, started_by: &str) -> EngineResult<i64>;

    async fn finish_lowcard_game(&self, db_id: i64, summary: LowCardFinishSummary) -> EngineResult<()>;

    async fn insert_lowcard_history(&self, db_id: i64, summary: LowCardFinishSummary) -> EngineResult<()>;

    async fn room_name(&self, room_id: &str) -> EngineResult<Option<String>>;
}

pub struct PostgresDurableStore {
    pool: sqlx::PgPool,
}

impl PostgresDurableStore {
    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        let pool = sqlx::PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl DurableStore for PostgresDurableStore {
    async fn get_credits(&self, user_id: &str) -> EngineResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT credits FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    async fn conditional_deduct(&self, user_id: &str, amount: i64) -> EngineResult<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE users SET credits = credits - $1 WHERE id = $2 AND credits >= $1 RETURNING credits",
        )
        .bind(amount)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn credit(&self, user_id: &str, amount: i64) -> EngineResult<i64> {
        let row: (i64,) = sqlx::query_as(
            "UPDATE users SET credits = credits + $1 WHERE id = $2 RETURNING credits",
        )
        .bind(amount)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn insert_credit_log(&self, entry: CreditLogEntry) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO credit_logs (user_id, username, amount, transaction_type, description, timestamp) \
             VALUES ($1, $2, $3, $4, $5, now())",
        )
        .bind(entry.user_id)
        .bind(entry.username)
        .bind(entry.amount)
        .bind(entry.transaction_type.as_str())
        .bind(entry.description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_game_history_start(&self, user_id: &str, username: &str, game: &str) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO game_history (user_id, username, game, result, reward, created_at) \
             VALUES ($1, $2, $3, 'lose', 0, now())",
        )
        .bind(user_id)
        .bind(username)
        .bind(game)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_game_history_win(&self, user_id: &str, username: &str, game: &str, reward: i64) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO game_history (user_id, username, game, result, reward, created_at) \
             VALUES ($1, $2, $3, 'win', $4, now())",
        )
        .bind(user_id)
        .bind(username)
        .bind(game)
        .bind(reward)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_lowcard_game(&self, room_id: &str, entry_amount: i64, started_by: &str) -> EngineResult<i64> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO lowcard_games (room_id, entry_amount, started_by, status, created_at) \
             VALUES ($1, $2, $3, 'waiting', now()) RETURNING id",
        )
        .bind(room_id)
        .bind(entry_amount)
        .bind(started_by)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn finish_lowcard_game(&self, db_id: i64, summary: LowCardFinishSummary) -> EngineResult<()> {
        sqlx::query(
            "UPDATE lowcard_games SET status = 'finished', pot = $1, winner_id = $2, house_fee = $3, player_count = $4 \
             WHERE id = $5",
        )
        .bind(summary.pot)
        .bind(summary.winner_id)
        .bind(summary.house_fee)
        .bind(summary.player_count)
        .bind(db_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_lowcard_history(&self, db_id: i64, summary: LowCardFinishSummary) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO lowcard_history (game_id, pot, winner_id, winner_username, house_fee, player_count, finished_at) \
             VALUES ($1, $2, $3, $4, $5, $6, now())",
        )
        .bind(db_id)
        .bind(summary.pot)
        .bind(summary.winner_id)
        .bind(summary.winner_username)
        .bind(summary.house_fee)
        .bind(summary.player_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn room_name(&self, room_id: &str) -> EngineResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT name FROM rooms WHERE id = $1")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }
}

/// In-memory fake used by engine tests.
pub struct InMemoryDurableStore {
    pub credits: Mutex<HashMap<String, i64>>,
    pub logs: Mutex<Vec<CreditLogEntry>>,
    pub room_names: Mutex<HashMap<String, String>>,
    pub next_game_id: Mutex<i64>,
    pub games: Mutex<HashMap<i64, LowCardGameRow>>,
    pub history: Mutex<Vec<LowCardFinishSummary>>,
}

impl InMemoryDurableStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            credits: Mutex::new(HashMap::new()),
            logs: Mutex::new(Vec::new()),
            room_names: Mutex::new(HashMap::new()),
            next_game_id: Mutex::new(1),
            games: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        })
    }

    pub async fn seed_credits(&self, user_id: &str, amount: i64) {
        self.credits.lock().await.insert(user_id.to_string(), amount);
    }

    pub async fn seed_room_name(&self, room_id: &str, name: &str) {
        self.room_names.lock().await.insert(room_id.to_string(), name.to_string());
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get_credits(&self, user_id: &str) -> EngineResult<i64> {
        Ok(*self.credits.lock().await.get(user_id).unwrap_or(&0))
    }

    async fn conditional_deduct(&self, user_id: &str, amount: i64) -> EngineResult<Option<i64>> {
        let mut credits = self.credits.lock().await;
        let balance = credits.entry(user_id.to_string()).or_insert(0);
        if *balance >= amount {
            *balance -= amount;
            Ok(Some(*balance))
        } else {
            Ok(None)
        }
    }

    async fn credit(&self, user_id: &str, amount: i64) -> EngineResult<i64> {
        let mut credits = self.credits.lock().await;
        let balance = credits.entry(user_id.to_string()).or_insert(0);
        *balance += amount;
        Ok(*balance)
    }

    async fn insert_credit_log(&self, entry: CreditLogEntry) -> EngineResult<()> {
        self.logs.lock().await.push(entry);
        Ok(())
    }

    async fn insert_game_history_start(&self, _user_id: &str, _username: &str, _game: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn insert_game_history_win(&self, _user_id: &str, _username: &str, _game: &str, _reward: i64) -> EngineResult<()> {
        Ok(())
    }

    async fn insert_lowcard_game(&self, room_id: &str, entry_amount: i64, started_by: &str) -> EngineResult<i64> {
        let mut next_id = self.next_game_id.lock().await;
        let id = *next_id;
        *next_id += 1;
        self.games.lock().await.insert(
            id,
            LowCardGameRow {
                db_id: id,
                room_id: room_id.to_string(),
                entry_amount,
                started_by: started_by.to_string(),
                status: "waiting".to_string(),
            },
        );
        Ok(id)
    }

    async fn finish_lowcard_game(&self, db_id: i64, _summary: LowCardFinishSummary) -> EngineResult<()> {
        if let Some(row) = self.games.lock().await.get_mut(&db_id) {
            row.status = "finished".to_string();
        }
        Ok(())
    }

    async fn insert_lowcard_history(&self, _db_id: i64, summary: LowCardFinishSummary) -> EngineResult<()> {
        self.history.lock().await.push(summary);
        Ok(())
    }

    async fn room_name(&self, room_id: &str) -> EngineResult<Option<String>> {
        Ok(self.room_names.lock().await.get(room_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conditional_deduct_rejects_insufficient_balance() {
        let store = InMemoryDurableStore::new();
        store.seed_credits("u1", 10).await;
        assert_eq!(store.conditional_deduct("u1", 5).await.unwrap(), Some(5));
        assert_eq!(store.conditional_deduct("u1", 10).await.unwrap(), None);
        assert_eq!(store.get_credits("u1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn credit_is_unconditional() {
        let store = InMemoryDurableStore::new();
        assert_eq!(store.credit("u1", 20).await.unwrap(), 20);
        assert_eq!(store.credit("u1", 5).await.unwrap(), 25);
    }
}
