//! Process entrypoint: wires the stores, runs Restart Recovery once, then
//! spawns the Timer Poller and the `game:command` listener that feeds the
//! Per-Room Serializer.

use std::sync::Arc;

use futures_util::StreamExt;

use chatgame_engine::broadcaster::RedisBroadcaster;
use chatgame_engine::command::{CommandRouter, RoomSerializer};
use chatgame_engine::config::Config;
use chatgame_engine::constants::GAME_COMMAND_CHANNEL;
use chatgame_engine::events::IncomingCommand;
use chatgame_engine::ledger::NullMerchantTagHook;
use chatgame_engine::lowcard::{LowCardEngine, TimerPoller};
use chatgame_engine::recovery::RestartRecovery;
use chatgame_engine::store::durable::PostgresDurableStore;
use chatgame_engine::store::keyed::RedisKeyedStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(redis_url = %config.redis_url, poll_interval = ?config.poll_interval, "starting chatgame-engine");

    let keyed = Arc::new(
        RedisKeyedStore::connect(&config.redis_url)
            .await
            .expect("failed to connect to Redis"),
    );
    let durable = Arc::new(
        PostgresDurableStore::connect(&config.database_url)
            .await
            .expect("failed to connect to Postgres"),
    );
    let merchant = Arc::new(NullMerchantTagHook);
    let broadcaster = Arc::new(RedisBroadcaster::new(keyed.clone()));

    let engine = Arc::new(LowCardEngine::new(keyed.clone(), durable, merchant, broadcaster));

    let recovery = RestartRecovery::new(engine.clone());
    match recovery.run().await {
        Ok(count) => tracing::info!(count, "restart recovery sweep finished"),
        Err(e) => tracing::error!(error = %e, "restart recovery sweep failed"),
    }

    if config.timer_poller_enabled {
        let poller = TimerPoller::new(engine.clone());
        let tick = config.poll_interval;
        tokio::spawn(async move {
            poller.run(tick).await;
        });
    } else {
        tracing::warn!("timer poller disabled via config");
    }

    let router = Arc::new(CommandRouter::new(engine));
    let serializer = RoomSerializer::new(router);
    let listener = tokio::spawn(listen_for_commands(config.redis_url.clone(), serializer));

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
    }
    listener.abort();
}

/// Subscribes to [`GAME_COMMAND_CHANNEL`] and feeds every decoded
/// [`IncomingCommand`] into the Per-Room Serializer. Runs on its own raw
/// pub/sub connection since [`chatgame_engine::store::keyed::KeyedStore`]
/// only exposes publish, not subscribe.
async fn listen_for_commands<K, D, M, B>(
    redis_url: String,
    serializer: Arc<RoomSerializer<K, D, M, B>>,
) where
    K: chatgame_engine::store::keyed::KeyedStore + 'static,
    D: chatgame_engine::store::durable::DurableStore + 'static,
    M: chatgame_engine::ledger::MerchantTagHook + 'static,
    B: chatgame_engine::broadcaster::Broadcaster + 'static,
{
    loop {
        match run_command_listener(&redis_url, &serializer).await {
            Ok(()) => tracing::warn!("command listener stream ended, reconnecting"),
            Err(e) => tracing::error!(error = %e, "command listener errored, reconnecting"),
        }
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    }
}

async fn run_command_listener<K, D, M, B>(
    redis_url: &str,
    serializer: &Arc<RoomSerializer<K, D, M, B>>,
) -> redis::RedisResult<()>
where
    K: chatgame_engine::store::keyed::KeyedStore + 'static,
    D: chatgame_engine::store::durable::DurableStore + 'static,
    M: chatgame_engine::ledger::MerchantTagHook + 'static,
    B: chatgame_engine::broadcaster::Broadcaster + 'static,
{
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_connection().await?.into_pubsub();
    pubsub.subscribe(GAME_COMMAND_CHANNEL).await?;

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = msg.get_payload()?;
        match serde_json::from_str::<IncomingCommand>(&payload) {
            Ok(command) => serializer.enqueue(command),
            Err(e) => tracing::warn!(error = %e, payload, "failed to decode incoming command"),
        }
    }
    Ok(())
}
