//! Deck Service: a shuffled 52-card deck persisted per room in the keyed
//! store.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{DECK_KEY_PREFIX, DECK_TTL};
use crate::error::{EngineError, EngineResult};
use crate::store::keyed::KeyedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Suit {
    Hearts,
    Diamonds,
    Clubs,
    Spades,
}

impl Suit {
    fn code(self) -> char {
        match self {
            Suit::Hearts => 'h',
            Suit::Diamonds => 'd',
            Suit::Clubs => 'c',
            Suit::Spades => 's',
        }
    }
}

/// A single card. `value` ranges 2..14 inclusive (Jack=11 .. Ace=14).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub value: u8,
    pub suit: Suit,
}

impl Card {
    /// Short rendering token, e.g. `5h`, `Ah`, `Tc`.
    pub fn code(&self) -> String {
        let rank = match self.value {
            11 => "J".to_string(),
            12 => "Q".to_string(),
            13 => "K".to_string(),
            14 => "A".to_string(),
            v => v.to_string(),
        };
        format!("{rank}{}", self.suit.code())
    }

    pub fn image(&self) -> String {
        format!("{}.png", self.code())
    }
}

fn full_deck() -> Vec<Card> {
    let suits = [Suit::Hearts, Suit::Diamonds, Suit::Clubs, Suit::Spades];
    let mut deck = Vec::with_capacity(52);
    for &suit in &suits {
        for value in 2..=14 {
            deck.push(Card { value, suit });
        }
    }
    deck
}

pub struct DeckService<S: KeyedStore> {
    store: Arc<S>,
}

impl<S: KeyedStore> DeckService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    fn key(room_id: &str) -> String {
        format!("{DECK_KEY_PREFIX}:{room_id}")
    }

    /// Builds a freshly shuffled 52-card deck and persists it.
    pub async fn reset(&self, room_id: &str) -> EngineResult<()> {
        let mut deck = full_deck();
        deck.shuffle(&mut rand::thread_rng());
        self.write(room_id, &deck).await
    }

    /// Pops a card from the tail of the room's deck, regenerating the deck
    /// first if it's missing or empty.
    pub async fn draw(&self, room_id: &str) -> EngineResult<Card> {
        let mut deck = self.read(room_id).await?;
        if deck.is_empty() {
            deck = full_deck();
            deck.shuffle(&mut rand::thread_rng());
        }
        let card = deck.pop().expect("deck just regenerated to 52 cards");
        self.write(room_id, &deck).await?;
        Ok(card)
    }

    pub async fn delete(&self, room_id: &str) -> EngineResult<()> {
        self.store.delete(&Self::key(room_id)).await
    }

    async fn read(&self, room_id: &str) -> EngineResult<Vec<Card>> {
        match self.store.get(&Self::key(room_id)).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(EngineError::from),
            None => Ok(Vec::new()),
        }
    }

    async fn write(&self, room_id: &str, deck: &[Card]) -> EngineResult<()> {
        let raw = serde_json::to_string(deck)?;
        self.store.set_ttl(&Self::key(room_id), &raw, DECK_TTL).await
    }
}
