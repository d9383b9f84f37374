//! Per-Room Serializer: an in-memory FIFO queue per room so `game:command`
//! pub/sub deliveries are handled in order, one room at a time, while
//! distinct rooms make progress fully in parallel.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::broadcaster::Broadcaster;
use crate::command::router::CommandRouter;
use crate::events::IncomingCommand;
use crate::ledger::MerchantTagHook;
use crate::store::durable::DurableStore;
use crate::store::keyed::KeyedStore;

/// Drives one worker task per room, spawned lazily on the first enqueue and
/// torn down once its queue drains. Only one worker ever runs per room at a
/// time — see the claim/release dance in [`Self::drain`].
pub struct RoomSerializer<K, D, M, B>
where
    K: KeyedStore,
    D: DurableStore,
    M: MerchantTagHook,
    B: Broadcaster,
{
    router: Arc<CommandRouter<K, D, M, B>>,
    queues: DashMap<String, Mutex<VecDeque<IncomingCommand>>>,
    workers: DashMap<String, ()>,
}

impl<K, D, M, B> RoomSerializer<K, D, M, B>
where
    K: KeyedStore + 'static,
    D: DurableStore + 'static,
    M: MerchantTagHook + 'static,
    B: Broadcaster + 'static,
{
    pub fn new(router: Arc<CommandRouter<K, D, M, B>>) -> Arc<Self> {
        Arc::new(Self { router, queues: DashMap::new(), workers: DashMap::new() })
    }

    /// Appends `command` to its room's queue. Spawns the room's drain
    /// worker if one isn't already running.
    pub fn enqueue(self: &Arc<Self>, command: IncomingCommand) {
        let room_id = command.room_id.clone();
        self.queues.entry(room_id.clone()).or_insert_with(|| Mutex::new(VecDeque::new())).lock().unwrap().push_back(command);

        if self.workers.insert(room_id.clone(), ()).is_none() {
            let this = self.clone();
            tokio::spawn(async move { this.drain(room_id).await });
        }
    }

    /// Drains this room's queue to empty, then gives up worker ownership.
    /// Re-checks for work that arrived in the gap between the last pop and
    /// releasing ownership, to guarantee the queue is never left non-empty
    /// with no worker responsible for it.
    async fn drain(self: Arc<Self>, room_id: String) {
        loop {
            let next = self.queues.get(&room_id).and_then(|q| q.lock().unwrap().pop_front());
            let Some(cmd) = next else {
                self.workers.remove(&room_id);
                let still_pending = self.queues.get(&room_id).map(|q| !q.lock().unwrap().is_empty()).unwrap_or(false);
                if still_pending && self.workers.insert(room_id.clone(), ()).is_none() {
                    continue;
                }
                self.queues.remove(&room_id);
                return;
            };

            let outcome = self.router.route(&cmd.room_id, &cmd.user_id, &cmd.username, &cmd.message, cmd.is_admin).await;
            if let Some(outcome) = outcome {
                if !outcome.success {
                    tracing::debug!(room_id = %cmd.room_id, user_id = %cmd.user_id, message = ?outcome.message, "command rejected");
                }
            }
        }
    }

    #[cfg(test)]
    pub fn queue_len(&self, room_id: &str) -> usize {
        self.queues.get(room_id).map(|q| q.lock().unwrap().len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::LoggingBroadcaster;
    use crate::ledger::NullMerchantTagHook;
    use crate::lowcard::LowCardEngine;
    use crate::store::durable::InMemoryDurableStore;
    use crate::store::keyed::InMemoryKeyedStore;
    use std::time::Duration;

    type TestEngine = LowCardEngine<InMemoryKeyedStore, InMemoryDurableStore, NullMerchantTagHook, LoggingBroadcaster>;

    fn build() -> (Arc<RoomSerializer<InMemoryKeyedStore, InMemoryDurableStore, NullMerchantTagHook, LoggingBroadcaster>>, Arc<InMemoryDurableStore>) {
        let keyed = InMemoryKeyedStore::new();
        let durable = InMemoryDurableStore::new();
        let engine: Arc<TestEngine> = Arc::new(LowCardEngine::new(
            keyed,
            durable.clone(),
            Arc::new(NullMerchantTagHook),
            Arc::new(LoggingBroadcaster::new()),
        ));
        let router = Arc::new(CommandRouter::new(engine));
        (RoomSerializer::new(router), durable)
    }

    fn cmd(room_id: &str, user_id: &str, username: &str, message: &str, is_admin: bool) -> IncomingCommand {
        IncomingCommand {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            username: username.to_string(),
            message: message.to_string(),
            socket_id: None,
            is_admin,
        }
    }

    #[tokio::test]
    async fn commands_for_one_room_are_handled_in_order() {
        let (serializer, durable) = build();
        durable.seed_credits("alice", 100).await;
        durable.seed_credits("bob", 100).await;

        serializer.enqueue(cmd("r1", "alice", "Alice", "/bot lowcard add", true));
        serializer.enqueue(cmd("r1", "alice", "Alice", "!start 10", false));
        serializer.enqueue(cmd("r1", "bob", "Bob", "!j", false));

        // give the spawned worker a chance to drain all three.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(durable.get_credits("bob").await.unwrap(), 90);
        assert_eq!(serializer.queue_len("r1"), 0);
    }

    #[tokio::test]
    async fn distinct_rooms_do_not_block_each_other() {
        let (serializer, durable) = build();
        durable.seed_credits("alice", 100).await;
        durable.seed_credits("carol", 100).await;

        serializer.enqueue(cmd("r1", "alice", "Alice", "/bot lowcard add", true));
        serializer.enqueue(cmd("r2", "carol", "Carol", "/bot lowcard add", true));
        tokio::time::sleep(Duration::from_millis(50)).await;

        serializer.enqueue(cmd("r1", "alice", "Alice", "!start 10", false));
        serializer.enqueue(cmd("r2", "carol", "Carol", "!start 10", false));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(durable.get_credits("alice").await.unwrap(), 90);
        assert_eq!(durable.get_credits("carol").await.unwrap(), 90);
    }
}
