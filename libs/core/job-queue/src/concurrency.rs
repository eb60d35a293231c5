//! Per-key admission control for in-flight jobs.
//!
//! A [`ConcurrencyManager`] maps each message to a caller-defined key (tenant,
//! build id, ...) and caps how many jobs sharing that key run at once. Counters
//! live in a [`CounterStore`] so every worker process sees the same numbers.
//!
//! `can_process_job` + `start_job` is cooperative admission: two workers can
//! both pass the check before either increments. `try_start_job` closes that
//! gap with a single conditional increment.

use crate::error::{QueueError, QueueResult};
use crate::message::Message;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Shared counter storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value, `None` if the key was never written
    async fn get(&self, key: &str) -> QueueResult<Option<i64>>;

    async fn set(&self, key: &str, value: i64) -> QueueResult<()>;

    /// Atomic increment, returns the new value
    async fn increment(&self, key: &str) -> QueueResult<i64>;

    /// Atomic decrement, returns the new value
    async fn decrement(&self, key: &str) -> QueueResult<i64>;

    /// Atomically increment only while the value is below `limit`.
    ///
    /// Returns whether the increment happened.
    async fn increment_below(&self, key: &str, limit: i64) -> QueueResult<bool>;
}

/// Maps a message to its concurrency key
pub trait ConcurrencyKey: Send + Sync {
    fn concurrency_key(&self, message: &Message) -> String;
}

impl<F> ConcurrencyKey for F
where
    F: Fn(&Message) -> String + Send + Sync,
{
    fn concurrency_key(&self, message: &Message) -> String {
        self(message)
    }
}

/// Caps simultaneously running jobs per key
#[derive(Clone)]
pub struct ConcurrencyManager {
    store: Arc<dyn CounterStore>,
    key: Arc<dyn ConcurrencyKey>,
    limit: u32,
}

impl ConcurrencyManager {
    /// Create a manager allowing `limit` concurrent jobs per key.
    ///
    /// A limit of zero would never admit anything and is rejected.
    pub fn new(
        store: Arc<dyn CounterStore>,
        key: impl ConcurrencyKey + 'static,
        limit: u32,
    ) -> QueueResult<Self> {
        if limit == 0 {
            return Err(QueueError::config("concurrency limit must be at least 1"));
        }

        Ok(Self {
            store,
            key: Arc::new(key),
            limit,
        })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn key_for(&self, message: &Message) -> String {
        self.key.concurrency_key(message)
    }

    /// Whether the message's key is below the limit; absent counters start at zero
    pub async fn can_process_job(&self, message: &Message) -> QueueResult<bool> {
        let key = self.key_for(message);

        let current = match self.store.get(&key).await? {
            Some(current) => current,
            None => {
                self.store.set(&key, 0).await?;
                0
            }
        };

        Ok(current < i64::from(self.limit))
    }

    /// Count the message as running
    pub async fn start_job(&self, message: &Message) -> QueueResult<i64> {
        self.store.increment(&self.key_for(message)).await
    }

    /// Count the message as finished.
    ///
    /// Must pair with an earlier `start_job`; an unpaired call drives the counter below zero.
    pub async fn finish_job(&self, message: &Message) -> QueueResult<i64> {
        self.store.decrement(&self.key_for(message)).await
    }

    /// Check and start in one atomic step; `false` means the key is at its limit
    pub async fn try_start_job(&self, message: &Message) -> QueueResult<bool> {
        let key = self.key_for(message);
        let admitted = self.store.increment_below(&key, i64::from(self.limit)).await?;
        debug!(key = %key, limit = self.limit, admitted, "Concurrency admission");
        Ok(admitted)
    }
}

/// Lua script behind [`RedisCounterStore::increment_below`]
const INCREMENT_BELOW_SCRIPT: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current < tonumber(ARGV[1]) then
    redis.call('INCR', KEYS[1])
    return 1
end
return 0
";

/// Counters stored as plain Redis integers
#[derive(Clone)]
pub struct RedisCounterStore {
    redis: ConnectionManager,
}

impl RedisCounterStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> QueueResult<Option<i64>> {
        let mut conn = self.redis.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: i64) -> QueueResult<()> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn increment(&self, key: &str) -> QueueResult<i64> {
        let mut conn = self.redis.clone();
        Ok(conn.incr(key, 1).await?)
    }

    async fn decrement(&self, key: &str) -> QueueResult<i64> {
        let mut conn = self.redis.clone();
        Ok(conn.decr(key, 1).await?)
    }

    async fn increment_below(&self, key: &str, limit: i64) -> QueueResult<bool> {
        let mut conn = self.redis.clone();
        let script = redis::Script::new(INCREMENT_BELOW_SCRIPT);
        let result: i32 = script.key(key).arg(limit).invoke_async(&mut conn).await?;
        Ok(result == 1)
    }
}

/// Process-local counters, for single-process deployments and tests
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<String, i64>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str) -> QueueResult<Option<i64>> {
        Ok(self.counters.lock().await.get(key).copied())
    }

    async fn set(&self, key: &str, value: i64) -> QueueResult<()> {
        self.counters.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn increment(&self, key: &str) -> QueueResult<i64> {
        let mut counters = self.counters.lock().await;
        let value = counters.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn decrement(&self, key: &str) -> QueueResult<i64> {
        let mut counters = self.counters.lock().await;
        let value = counters.entry(key.to_string()).or_insert(0);
        *value -= 1;
        Ok(*value)
    }

    async fn increment_below(&self, key: &str, limit: i64) -> QueueResult<bool> {
        let mut counters = self.counters.lock().await;
        let value = counters.entry(key.to_string()).or_insert(0);
        if *value < limit {
            *value += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
