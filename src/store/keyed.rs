//! Keyed Store: low-latency store with atomic compare-and-set/delete, TTL,
//! key enumeration, and pub/sub.
//!
//! The trait is the seam the engine programs against; `RedisKeyedStore` is
//! the production adapter, and `InMemoryKeyedStore` is the fake used by
//! engine tests.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::EngineResult;

#[async_trait]
pub trait KeyedStore: Send + Sync {
    /// Atomic "set if absent" with TTL. Returns `true` if this call created
    /// the key (lock/bot-record acquisition semantics).
    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool>;

    async fn get(&self, key: &str) -> EngineResult<Option<String>>;

    /// Unconditional set with TTL, refreshed on every mutation.
    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<()>;

    /// Unconditional set with no expiry. For directory entries that must
    /// persist until explicitly cleared rather than decay on their own.
    async fn set(&self, key: &str, value: &str) -> EngineResult<()>;

    async fn delete(&self, key: &str) -> EngineResult<()>;

    /// Atomic "delete only if current value equals `expected`" — required so
    /// a TTL-expired lock re-acquired by someone else is never released by
    /// the stale holder.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> EngineResult<bool>;

    async fn keys(&self, pattern: &str) -> EngineResult<Vec<String>>;

    async fn publish(&self, channel: &str, payload: &str) -> EngineResult<()>;
}

pub struct RedisKeyedStore {
    conn: ConnectionManager,
    delete_if_match_script: redis::Script,
}

impl RedisKeyedStore {
    pub async fn connect(redis_url: &str) -> EngineResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            delete_if_match_script: redis::Script::new(
                r"
                if redis.call('get', KEYS[1]) == ARGV[1] then
                    return redis.call('del', KEYS[1])
                else
                    return 0
                end
                ",
            ),
        })
    }
}

#[async_trait]
impl KeyedStore for RedisKeyedStore {
    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool> {
        let mut conn = self.conn.clone();
        let ok: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, Option<String>>(&mut conn)
            .await?
            .is_some();
        Ok(ok)
    }

    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> EngineResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .delete_if_match_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn keys(&self, pattern: &str) -> EngineResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.keys(pattern).await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> EngineResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-memory fake of the Keyed Store, used by engine/lock/ledger tests.
pub struct InMemoryKeyedStore {
    data: Mutex<HashMap<String, Entry>>,
    pub published: Mutex<Vec<(String, String)>>,
}

impl InMemoryKeyedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { data: Mutex::new(HashMap::new()), published: Mutex::new(Vec::new()) })
    }

    fn is_live(e: &Entry) -> bool {
        match e.expires_at {
            Some(t) => t > Instant::now(),
            None => true,
        }
    }
}

#[async_trait]
impl KeyedStore for InMemoryKeyedStore {
    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool> {
        let mut data = self.data.lock().await;
        if let Some(existing) = data.get(key) {
            if Self::is_live(existing) {
                return Ok(false);
            }
        }
        data.insert(
            key.to_string(),
            Entry { value: value.to_string(), expires_at: Some(Instant::now() + ttl) },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let data = self.data.lock().await;
        Ok(data.get(key).filter(|e| Self::is_live(e)).map(|e| e.value.clone()))
    }

    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<()> {
        let mut data = self.data.lock().await;
        data.insert(
            key.to_string(),
            Entry { value: value.to_string(), expires_at: Some(Instant::now() + ttl) },
        );
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        let mut data = self.data.lock().await;
        data.insert(key.to_string(), Entry { value: value.to_string(), expires_at: None });
        Ok(())
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        self.data.lock().await.remove(key);
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> EngineResult<bool> {
        let mut data = self.data.lock().await;
        match data.get(key) {
            Some(e) if Self::is_live(e) && e.value == expected => {
                data.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys(&self, pattern: &str) -> EngineResult<Vec<String>> {
        let data = self.data.lock().await;
        let prefix = pattern.trim_end_matches('*');
        Ok(data
            .iter()
            .filter(|(_, e)| Self::is_live(e))
            .map(|(k, _)| k.clone())
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> EngineResult<()> {
        self.published.lock().await.push((channel.to_string(), payload.to_string()));
        Ok(())
    }
}
