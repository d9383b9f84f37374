//! Broadcaster contract — consumed by the engine, implemented over the
//! keyed store's pub/sub channels. Abstracts "fan a signal out" behind an
//! `async_trait` so the engine never depends on a concrete transport.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::EngineResult;
use crate::events::DomainEvent;
use crate::store::keyed::KeyedStore;

pub const CHAT_MESSAGE_CHANNEL: &str = "game:chat:message";
pub const CREDITS_UPDATE_CHANNEL: &str = "game:credits:update";
pub const PRIVATE_MESSAGE_CHANNEL: &str = "game:private:message";

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Emit to a specific room.
    async fn to_room(&self, room_id: &str, event: DomainEvent, payload: Value) -> EngineResult<()>;

    /// Emit without room scoping (rarely used; kept for parity with the
    /// `broadcaster.emit(event, payload)` shape).
    async fn emit(&self, event: DomainEvent, payload: Value) -> EngineResult<()>;
}

/// Production broadcaster: publishes to the keyed store's pub/sub channels.
///
/// `chat:message` events additionally cross-publish to `game:chat:message`,
/// `credits:updated` to `game:credits:update`, and any payload carrying
/// `{"type": "private"}` to `game:private:message`.
pub struct RedisBroadcaster<S: KeyedStore> {
    store: Arc<S>,
}

impl<S: KeyedStore> RedisBroadcaster<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn cross_publish(&self, room_id: &str, event: DomainEvent, payload: &Value) -> EngineResult<()> {
        match event {
            DomainEvent::ChatMessage => {
                let out = serde_json::json!({ "roomId": room_id, "messageData": payload });
                self.store.publish(CHAT_MESSAGE_CHANNEL, &out.to_string()).await?;
            }
            DomainEvent::CreditsUpdated => {
                self.store.publish(CREDITS_UPDATE_CHANNEL, &payload.to_string()).await?;
            }
            _ => {}
        }
        if payload.get("type").and_then(Value::as_str) == Some("private") {
            let out = serde_json::json!({ "roomId": room_id, "messageData": payload });
            self.store.publish(PRIVATE_MESSAGE_CHANNEL, &out.to_string()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<S: KeyedStore> Broadcaster for RedisBroadcaster<S> {
    async fn to_room(&self, room_id: &str, event: DomainEvent, payload: Value) -> EngineResult<()> {
        let channel = format!("room:{room_id}:{}", event.as_wire_name());
        self.store.publish(&channel, &payload.to_string()).await?;
        self.cross_publish(room_id, event, &payload).await
    }

    async fn emit(&self, event: DomainEvent, payload: Value) -> EngineResult<()> {
        self.store.publish(event.as_wire_name(), &payload.to_string()).await
    }
}

/// In-memory test double that records every emitted event for assertions.
#[derive(Default)]
pub struct LoggingBroadcaster {
    pub events: Mutex<Vec<(String, DomainEvent, Value)>>,
}

impl LoggingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn drain(&self) -> Vec<(String, DomainEvent, Value)> {
        std::mem::take(&mut *self.events.lock().await)
    }
}

#[async_trait]
impl Broadcaster for LoggingBroadcaster {
    async fn to_room(&self, room_id: &str, event: DomainEvent, payload: Value) -> EngineResult<()> {
        self.events.lock().await.push((room_id.to_string(), event, payload));
        Ok(())
    }

    async fn emit(&self, event: DomainEvent, payload: Value) -> EngineResult<()> {
        self.events.lock().await.push((String::new(), event, payload));
        Ok(())
    }
}
