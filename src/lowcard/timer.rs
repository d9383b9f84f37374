//! Timer Poller: the sole authority for wall-clock transitions.

use std::sync::Arc;
use std::time::Duration;

use super::engine::LowCardEngine;
use super::state::{now_ms, TimerPhase};
use crate::broadcaster::Broadcaster;
use crate::constants::{TIMER_KEY_PREFIX, TIMER_KEY_SUFFIX};
use crate::error::EngineResult;
use crate::ledger::MerchantTagHook;
use crate::store::durable::DurableStore;
use crate::store::keyed::KeyedStore;

pub struct TimerPoller<K, D, M, B>
where
    K: KeyedStore,
    D: DurableStore,
    M: MerchantTagHook,
    B: Broadcaster,
{
    engine: Arc<LowCardEngine<K, D, M, B>>,
}

impl<K, D, M, B> TimerPoller<K, D, M, B>
where
    K: KeyedStore,
    D: DurableStore,
    M: MerchantTagHook,
    B: Broadcaster,
{
    pub fn new(engine: Arc<LowCardEngine<K, D, M, B>>) -> Self {
        Self { engine }
    }

    /// Runs the tick loop forever. Callers spawn this on its own task and
    /// race it against a shutdown signal (see `main.rs`).
    pub async fn run(&self, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick_once().await {
                tracing::error!(error = %e, "timer poller tick failed");
            }
        }
    }

    /// One scan of `room:*:lowcard:timer`, exposed separately from
    /// [`Self::run`] so tests can drive individual ticks.
    pub async fn tick_once(&self) -> EngineResult<()> {
        let pattern = format!("{TIMER_KEY_PREFIX}:*:{TIMER_KEY_SUFFIX}");
        let keys = self.engine.keyed().keys(&pattern).await?;

        for key in keys {
            let Some(room_id) = extract_room_id(&key) else { continue };
            let Some(timer) = self.engine.read_timer(&room_id).await? else { continue };
            if timer.expires_at > now_ms() {
                continue;
            }

            match self.engine.claim_timer(&room_id, &timer).await {
                Ok(true) => {}
                Ok(false) => continue, // another replica's poller already claimed this expiry
                Err(e) => {
                    tracing::error!(error = %e, room_id, "failed to claim expired timer");
                    continue;
                }
            }

            match timer.phase {
                TimerPhase::Join => {
                    let outcome = self.engine.begin_game(&room_id).await;
                    if !outcome.success {
                        tracing::warn!(room_id, message = ?outcome.message, "beginGame did not succeed");
                    }
                }
                TimerPhase::Countdown => {
                    if let Some(game) = self.engine.read_game(&room_id).await? {
                        if let Some(round_deadline) = game.round_deadline {
                            self.engine.write_round_timer(&room_id, round_deadline, game.current_round).await?;
                            self.engine.broadcast_round_started(&room_id, game.current_round).await?;
                        }
                    }
                }
                TimerPhase::Round => {
                    self.engine.auto_draw_for_timeout(&room_id).await?;
                    self.engine.tally_round(&room_id, true).await?;
                }
            }
        }
        Ok(())
    }
}

fn extract_room_id(key: &str) -> Option<String> {
    let rest = key.strip_prefix(&format!("{TIMER_KEY_PREFIX}:"))?;
    let room_id = rest.strip_suffix(&format!(":{TIMER_KEY_SUFFIX}"))?;
    Some(room_id.to_string())
}
