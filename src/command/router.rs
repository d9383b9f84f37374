//! Command Router: classifies a chat line into admin / scoped play /
//! lifecycle buckets and dispatches LowCard commands to the engine.
//! DiceBot and FlagBot remain opaque `GameType` variants — their scoped play
//! commands are recognized here so they don't leak through to LowCard's
//! lifecycle bucket, but have no handler behind them.

use std::sync::Arc;

use crate::broadcaster::Broadcaster;
use crate::constants::DEFAULT_MIN_ENTRY;
use crate::events::CommandOutcome;
use crate::game_state::GameType;
use crate::ledger::MerchantTagHook;
use crate::lowcard::LowCardEngine;
use crate::store::durable::DurableStore;
use crate::store::keyed::KeyedStore;

pub struct CommandRouter<K, D, M, B>
where
    K: KeyedStore,
    D: DurableStore,
    M: MerchantTagHook,
    B: Broadcaster,
{
    lowcard: Arc<LowCardEngine<K, D, M, B>>,
}

impl<K, D, M, B> CommandRouter<K, D, M, B>
where
    K: KeyedStore,
    D: DurableStore,
    M: MerchantTagHook,
    B: Broadcaster,
{
    pub fn new(lowcard: Arc<LowCardEngine<K, D, M, B>>) -> Self {
        Self { lowcard }
    }

    /// Routes one chat line. `None` means the command was unrecognized (or
    /// belongs to a sibling game with no handler) and is dropped silently.
    pub async fn route(&self, room_id: &str, user_id: &str, username: &str, raw: &str, is_admin: bool) -> Option<CommandOutcome> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return None;
        }

        if let Some(rest) = normalized.strip_prefix("/bot ").or_else(|| normalized.strip_prefix("/add bot ")) {
            return Some(self.route_admin(room_id, rest, is_admin).await);
        }

        if is_scoped_play_command(&normalized) {
            // DiceBot/FlagBot affinity check would live here; neither has an
            // implementation behind it.
            return None;
        }

        self.route_lifecycle(room_id, user_id, username, &normalized).await
    }

    async fn route_admin(&self, room_id: &str, rest: &str, is_admin: bool) -> CommandOutcome {
        if !is_admin {
            return CommandOutcome::private_error("Only a room admin can manage bots.");
        }

        let mut parts = rest.split_whitespace();
        let game = parts.next().unwrap_or("");
        let action = parts.next().unwrap_or("");

        match (game, action) {
            ("lowcard", "add") => {
                let amount = parts.next().and_then(|a| a.parse().ok()).unwrap_or(DEFAULT_MIN_ENTRY);
                self.lowcard.enable_bot(room_id, amount).await.unwrap_or_else(infra_fault)
            }
            ("lowcard", "remove") => self.lowcard.disable_bot(room_id).await.unwrap_or_else(infra_fault),
            // `stop` is tried against both LowCard and FlagBot; only LowCard
            // has an implementation to try it against here.
            (_, "stop") => self.lowcard.disable_bot(room_id).await.unwrap_or_else(infra_fault),
            _ => CommandOutcome::silent_reject(),
        }
    }

    async fn route_lifecycle(&self, room_id: &str, user_id: &str, username: &str, normalized: &str) -> Option<CommandOutcome> {
        let active = self.lowcard.active_game_type(room_id).await.ok().flatten();
        let targets_lowcard = match active {
            Some(GameType::LowCard) => true,
            Some(_) => false,
            None => self.lowcard.bot_active(room_id).await.unwrap_or(false),
        };
        if !targets_lowcard {
            return None;
        }

        if let Some(rest) = normalized.strip_prefix("!start") {
            let amount = rest.trim().parse::<i64>().ok();
            return Some(self.lowcard.start_game(room_id, user_id, username, amount).await);
        }

        match normalized {
            "!j" | "!join" => Some(self.lowcard.join_game(room_id, user_id, username).await),
            "!cancel" => Some(self.lowcard.cancel_by_starter(room_id, user_id).await.unwrap_or_else(infra_fault)),
            // `!n` / `!stop` both abort a game still in the waiting lobby.
            "!n" | "!stop" => Some(self.lowcard.stop_game(room_id).await.unwrap_or_else(infra_fault)),
            "!reset" | "!rezet" => Some(self.lowcard.reset_game(room_id, username).await.unwrap_or_else(infra_fault)),
            _ => None,
        }
    }
}

fn is_scoped_play_command(normalized: &str) -> bool {
    matches!(normalized, "!d" | "!r" | "!roll" | "!fg" | "!lock") || normalized.starts_with("!b ")
}

fn infra_fault<E: std::fmt::Display>(e: E) -> CommandOutcome {
    tracing::error!(error = %e, "command router infrastructure fault");
    CommandOutcome::private_error("Something went wrong, please try again.")
}
