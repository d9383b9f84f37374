//! Ledger: the single source of truth for `users.credits`. Every engine
//! error path routes through it; the engine never deducts without a
//! compensating refund path.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::CREDITS_KEY_PREFIX;
use crate::error::EngineResult;
use crate::store::durable::{CreditLogEntry, DurableStore, TransactionType};
use crate::store::keyed::KeyedStore;

/// Result of [`MerchantTagHook::consume_for_game`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TaggedConsumeResult {
    pub success: bool,
    pub used_tagged_credits: i64,
    /// Amount still owed against the regular balance after tagged credits
    /// were applied.
    pub remaining_amount: i64,
}

/// Merchant-tag commission accounting, treated as an opaque ledger hook.
#[async_trait]
pub trait MerchantTagHook: Send + Sync {
    async fn tagged_balance(&self, user_id: &str) -> EngineResult<i64>;

    async fn consume_for_game(
        &self,
        user_id: &str,
        game: &str,
        amount: i64,
        game_session_id: &str,
    ) -> EngineResult<TaggedConsumeResult>;

    /// Whether `user_id` (typically a room's starter) has an active merchant
    /// tag, used to route the 10% house-fee commission at game finish.
    async fn active_merchant_for(&self, user_id: &str) -> EngineResult<Option<String>>;

    /// Pay `amount` of commission to `merchant_id`.
    async fn pay_commission(&self, merchant_id: &str, amount: i64) -> EngineResult<()>;
}

/// No merchant tagging configured: every bet is paid in full from the
/// regular balance, and no commission is ever routed. This is the production
/// default until the merchant-tag subsystem (out of scope here) is wired in.
pub struct NullMerchantTagHook;

#[async_trait]
impl MerchantTagHook for NullMerchantTagHook {
    async fn tagged_balance(&self, _user_id: &str) -> EngineResult<i64> {
        Ok(0)
    }

    async fn consume_for_game(
        &self,
        _user_id: &str,
        _game: &str,
        amount: i64,
        _game_session_id: &str,
    ) -> EngineResult<TaggedConsumeResult> {
        Ok(TaggedConsumeResult { success: true, used_tagged_credits: 0, remaining_amount: amount })
    }

    async fn active_merchant_for(&self, _user_id: &str) -> EngineResult<Option<String>> {
        Ok(None)
    }

    async fn pay_commission(&self, _merchant_id: &str, _amount: i64) -> EngineResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeductOutcome {
    pub success: bool,
    pub balance: i64,
    pub used_tagged_credits: bool,
}

pub struct Ledger<D: DurableStore, K: KeyedStore, M: MerchantTagHook> {
    durable: Arc<D>,
    keyed: Arc<K>,
    merchant: Arc<M>,
}

impl<D: DurableStore, K: KeyedStore, M: MerchantTagHook> Ledger<D, K, M> {
    pub fn new(durable: Arc<D>, keyed: Arc<K>, merchant: Arc<M>) -> Self {
        Self { durable, keyed, merchant }
    }

    fn cache_key(user_id: &str) -> String {
        format!("{CREDITS_KEY_PREFIX}:{user_id}")
    }

    /// Deducts `amount` from `user_id`'s balance, routing through any active
    /// merchant tag first.
    pub async fn deduct(
        &self,
        user_id: &str,
        amount: i64,
        username: &str,
        reason: &str,
        game_session_id: &str,
    ) -> EngineResult<DeductOutcome> {
        let tagged_balance = self.merchant.tagged_balance(user_id).await?;
        let mut remaining = amount;
        let mut used_tagged = false;

        if tagged_balance > 0 {
            let consumed = self.merchant.consume_for_game(user_id, "lowcard", amount, game_session_id).await?;
            if consumed.success {
                used_tagged = consumed.used_tagged_credits > 0;
                remaining = consumed.remaining_amount;
            }
        }

        if remaining <= 0 {
            self.durable
                .insert_credit_log(CreditLogEntry {
                    user_id: user_id.to_string(),
                    username: username.to_string(),
                    amount: -amount,
                    transaction_type: TransactionType::GameBet,
                    description: format!("{reason} (Tagged Credits)"),
                })
                .await?;
            let balance = self.durable.get_credits(user_id).await?;
            return Ok(DeductOutcome { success: true, balance, used_tagged_credits: true });
        }

        let Some(new_balance) = self.durable.conditional_deduct(user_id, remaining).await? else {
            return Ok(DeductOutcome { success: false, balance: self.durable.get_credits(user_id).await?, used_tagged_credits: used_tagged });
        };

        self.keyed
            .set_ttl(&Self::cache_key(user_id), &new_balance.to_string(), Duration::from_secs(300))
            .await?;
        self.durable
            .insert_credit_log(CreditLogEntry {
                user_id: user_id.to_string(),
                username: username.to_string(),
                amount: -remaining,
                transaction_type: TransactionType::GameBet,
                description: reason.to_string(),
            })
            .await?;

        Ok(DeductOutcome { success: true, balance: new_balance, used_tagged_credits: used_tagged })
    }

    /// Credits `amount` to `user_id`'s balance unconditionally.
    pub async fn credit(&self, user_id: &str, amount: i64, username: &str, reason: &str) -> EngineResult<i64> {
        let new_balance = self.durable.credit(user_id, amount).await?;
        self.keyed
            .set_ttl(&Self::cache_key(user_id), &new_balance.to_string(), Duration::from_secs(300))
            .await?;
        let transaction_type = if reason.to_lowercase().contains("refund") {
            TransactionType::GameRefund
        } else {
            TransactionType::GameWin
        };
        self.durable
            .insert_credit_log(CreditLogEntry {
                user_id: user_id.to_string(),
                username: username.to_string(),
                amount,
                transaction_type,
                description: reason.to_string(),
            })
            .await?;
        Ok(new_balance)
    }

    /// Cache-aside balance read.
    pub async fn read_balance(&self, user_id: &str) -> EngineResult<i64> {
        if let Some(cached) = self.keyed.get(&Self::cache_key(user_id)).await? {
            if let Ok(parsed) = cached.parse() {
                return Ok(parsed);
            }
        }
        let balance = self.durable.get_credits(user_id).await?;
        self.keyed.set_ttl(&Self::cache_key(user_id), &balance.to_string(), Duration::from_secs(300)).await?;
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::durable::InMemoryDurableStore;
    use crate::store::keyed::InMemoryKeyedStore;

    fn ledger() -> Ledger<InMemoryDurableStore, InMemoryKeyedStore, NullMerchantTagHook> {
        Ledger::new(InMemoryDurableStore::new(), InMemoryKeyedStore::new(), Arc::new(NullMerchantTagHook))
    }

    #[tokio::test]
    async fn deduct_succeeds_and_writes_through_cache() {
        let ledger = ledger();
        ledger.durable.seed_credits("alice", 100).await;

        let outcome = ledger.deduct("alice", 10, "alice", "LowCard bet", "session-1").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.balance, 90);
        assert_eq!(ledger.read_balance("alice").await.unwrap(), 90);
        assert_eq!(ledger.durable.logs.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn deduct_fails_on_insufficient_balance() {
        let ledger = ledger();
        ledger.durable.seed_credits("bob", 5).await;
        let outcome = ledger.deduct("bob", 10, "bob", "LowCard bet", "session-1").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(ledger.durable.get_credits("bob").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn credit_tags_refund_vs_win() {
        let ledger = ledger();
        ledger.credit("carol", 17, "carol", "LowCard win").await.unwrap();
        ledger.credit("carol", 10, "carol", "LowCard Refund - cancelled").await.unwrap();
        let logs = ledger.durable.logs.lock().await;
        assert_eq!(logs[0].transaction_type.as_str(), "game_win");
        assert_eq!(logs[1].transaction_type.as_str(), "game_refund");
    }

    #[tokio::test]
    async fn read_balance_is_cache_aside() {
        let ledger = ledger();
        ledger.durable.seed_credits("dave", 42).await;
        assert_eq!(ledger.read_balance("dave").await.unwrap(), 42);
        // Mutate the durable row directly; cached read should still win until
        // a write refreshes it (cache may be stale up to 300s).
        ledger.durable.seed_credits("dave", 99).await;
        assert_eq!(ledger.read_balance("dave").await.unwrap(), 42);
    }
}
