//! Redis-backed counter store (shared across worker processes).
//!
//! - Counters and gauges are plain integer keys (`INCRBY`, `SET`, `GET`)
//! - Locks use `SET key owner NX PX ttl`
//! - Extend and release compare the owner token inside a Lua script so a
//!   worker can never touch a lock another worker took over after expiry

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::debug;
use uuid::Uuid;

use super::{CounterStore, StoreError, ttl_millis};

/// Default key prefix for every key this store touches.
const DEFAULT_KEY_PREFIX: &str = "leadflow:";

mod scripts {
    use redis::Script;

    /// Delete the lock only if we still own it.
    pub fn release() -> Script {
        Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        )
    }

    /// Reset the lock expiry only if we still own it.
    pub fn extend() -> Script {
        Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('PEXPIRE', KEYS[1], ARGV[2])
            end
            return 0
            "#,
        )
    }
}

#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    key_prefix: String,
    owner: String,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .field("owner", &self.owner)
            .finish()
    }
}

fn command_error(e: redis::RedisError) -> StoreError {
    StoreError::Command(e.to_string())
}

impl RedisCounterStore {
    /// Connect to Redis (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            owner: Uuid::now_v7().to_string(),
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(self.key(key), delta).await.map_err(command_error)?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(self.key(key)).await.map_err(command_error)?;
        Ok(value.unwrap_or(0))
    }

    async fn set_gauge(&self, key: &str, value: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.key(key), value).await.map_err(command_error)?;
        Ok(())
    }

    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let ms = ttl_millis(ttl)?;
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(&self.owner)
            .arg("NX")
            .arg("PX")
            .arg(ms)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        let acquired = reply.is_some();
        debug!(lock = %key, owner = %self.owner, acquired, "lock acquire attempted");
        Ok(acquired)
    }

    async fn extend_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let ms = ttl_millis(ttl)?;
        let mut conn = self.conn.clone();
        let extended: i64 = scripts::extend()
            .key(self.key(key))
            .arg(&self.owner)
            .arg(ms)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(extended == 1)
    }

    async fn release_lock(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let released: i64 = scripts::release()
            .key(self.key(key))
            .arg(&self.owner)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(released == 1)
    }
}
