//! Game State Manager: per-room "which game type is active" directory.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::constants::ACTIVE_GAME_KEY_PREFIX;
use crate::error::EngineResult;
use crate::store::keyed::KeyedStore;

/// The sibling games DiceBot and FlagBot are out of scope for this engine
/// beyond this directory entry and the Command Router's bot-active checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameType {
    DiceBot,
    LowCard,
    FlagBot,
}

impl GameType {
    pub fn as_str(self) -> &'static str {
        match self {
            GameType::DiceBot => "dicebot",
            GameType::LowCard => "lowcard",
            GameType::FlagBot => "flagbot",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "dicebot" => Some(GameType::DiceBot),
            "lowcard" => Some(GameType::LowCard),
            "flagbot" => Some(GameType::FlagBot),
            _ => None,
        }
    }
}

pub struct GameStateManager<S: KeyedStore> {
    store: Arc<S>,
}

impl<S: KeyedStore> GameStateManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    fn key(room_id: &str) -> String {
        format!("{ACTIVE_GAME_KEY_PREFIX}:{room_id}")
    }

    pub async fn active_game(&self, room_id: &str) -> EngineResult<Option<GameType>> {
        Ok(self.store.get(&Self::key(room_id)).await?.and_then(|v| GameType::parse(&v)))
    }

    pub async fn set_active(&self, room_id: &str, game: GameType) -> EngineResult<()> {
        self.store.set(&Self::key(room_id), game.as_str()).await
    }

    pub async fn clear(&self, room_id: &str) -> EngineResult<()> {
        self.store.delete(&Self::key(room_id)).await
    }
}
