//! Restart Recovery: boot-time sweep that refunds every player stranded in a
//! LowCard game that was still `waiting` or `playing` when the previous
//! process died, then tears the room down.

use std::sync::Arc;

use crate::broadcaster::Broadcaster;
use crate::constants::GAME_KEY_PREFIX;
use crate::error::EngineResult;
use crate::ledger::MerchantTagHook;
use crate::lowcard::state::GameStatus;
use crate::lowcard::LowCardEngine;
use crate::store::durable::DurableStore;
use crate::store::keyed::KeyedStore;

/// DiceBot/FlagBot key patterns are swept too, even though neither has an
/// engine behind it — the sweep finds nothing there and logs a warning
/// rather than silently ignoring it.
const DICEBOT_PATTERN: &str = "dicebot:game:*";
const FLAGBOT_PATTERN: &str = "flagbot:room:*:bets";

pub struct RestartRecovery<K, D, M, B>
where
    K: KeyedStore,
    D: DurableStore,
    M: MerchantTagHook,
    B: Broadcaster,
{
    engine: Arc<LowCardEngine<K, D, M, B>>,
}

impl<K, D, M, B> RestartRecovery<K, D, M, B>
where
    K: KeyedStore,
    D: DurableStore,
    M: MerchantTagHook,
    B: Broadcaster,
{
    pub fn new(engine: Arc<LowCardEngine<K, D, M, B>>) -> Self {
        Self { engine }
    }

    /// Runs once at boot. Idempotent: a second run after the first
    /// already refunded and cleaned up everything finds nothing left to do,
    /// since a recovered room no longer has a `lowcard:game:{R}` key.
    pub async fn run(&self) -> EngineResult<usize> {
        let mut recovered = 0;
        let pattern = format!("{GAME_KEY_PREFIX}:*");
        for key in self.engine.keyed().keys(&pattern).await? {
            let Some(room_id) = key.strip_prefix(&format!("{GAME_KEY_PREFIX}:")) else { continue };
            if self.recover_room(room_id).await? {
                recovered += 1;
            }
        }

        for pattern in [DICEBOT_PATTERN, FLAGBOT_PATTERN] {
            let stray = self.engine.keyed().keys(pattern).await?;
            if !stray.is_empty() {
                tracing::warn!(pattern, count = stray.len(), "stray DiceBot/FlagBot keys found with no recovery handler");
            }
        }

        tracing::info!(recovered, "restart recovery sweep complete");
        Ok(recovered)
    }

    async fn recover_room(&self, room_id: &str) -> EngineResult<bool> {
        let Some(game) = self.engine.read_game(room_id).await? else {
            return Ok(false);
        };
        if !matches!(game.status, GameStatus::Waiting | GameStatus::Playing) {
            return Ok(false);
        }

        tracing::warn!(room_id, player_count = game.players.len(), "recovering stranded LowCard game on restart");
        self.engine.refund_for_restart(room_id, &game).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::LoggingBroadcaster;
    use crate::ledger::NullMerchantTagHook;
    use crate::store::durable::InMemoryDurableStore;
    use crate::store::keyed::InMemoryKeyedStore;

    type TestEngine = LowCardEngine<InMemoryKeyedStore, InMemoryDurableStore, NullMerchantTagHook, LoggingBroadcaster>;

    fn build() -> (Arc<TestEngine>, Arc<InMemoryDurableStore>) {
        let keyed = InMemoryKeyedStore::new();
        let durable = InMemoryDurableStore::new();
        let engine = Arc::new(LowCardEngine::new(
            keyed,
            durable.clone(),
            Arc::new(NullMerchantTagHook),
            Arc::new(LoggingBroadcaster::new()),
        ));
        (engine, durable)
    }

    #[tokio::test]
    async fn refunds_stranded_waiting_game_and_cleans_up() {
        let (engine, durable) = build();
        durable.seed_credits("alice", 100).await;
        engine.start_game("r1", "alice", "Alice", Some(10)).await;
        assert_eq!(durable.get_credits("alice").await.unwrap(), 90);

        let recovery = RestartRecovery::new(engine.clone());
        let recovered = recovery.run().await.unwrap();

        assert_eq!(recovered, 1);
        assert_eq!(durable.get_credits("alice").await.unwrap(), 100);
        assert!(engine.read_game("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let (engine, durable) = build();
        durable.seed_credits("alice", 100).await;
        engine.start_game("r1", "alice", "Alice", Some(10)).await;

        let recovery = RestartRecovery::new(engine.clone());
        recovery.run().await.unwrap();
        let second = recovery.run().await.unwrap();

        assert_eq!(second, 0);
        assert_eq!(durable.get_credits("alice").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn finished_game_is_left_alone() {
        let (engine, durable) = build();
        durable.seed_credits("alice", 100).await;
        durable.seed_credits("bob", 100).await;
        engine.start_game("r1", "alice", "Alice", Some(10)).await;
        engine.join_game("r1", "bob", "Bob").await;
        engine.cancel_by_starter("r1", "alice").await.unwrap();

        let recovery = RestartRecovery::new(engine.clone());
        let recovered = recovery.run().await.unwrap();
        assert_eq!(recovered, 0);
    }
}
