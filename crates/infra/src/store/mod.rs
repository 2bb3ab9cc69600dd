//! Shared counter, gauge and lock store.
//!
//! Queue metrics and the cycle lock live here so every worker process sees
//! the same values. Redis backs production; the in-memory store has identical
//! semantics for tests and single-process runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use self::in_memory::InMemoryCounterStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisCounterStore;

/// Counter/lock store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store command error: {0}")]
    Command(String),
    #[error("invalid lock ttl: {0:?}")]
    InvalidTtl(Duration),
}

/// Store abstraction for counters, gauges and expiring locks.
///
/// Locks are owned by the store instance that acquired them: only that
/// instance can extend or release them, and they are not re-entrant.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `delta` to a counter and return the new value.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Current value of a counter or gauge (0 when absent).
    async fn get(&self, key: &str) -> Result<i64, StoreError>;

    /// Overwrite a gauge.
    async fn set_gauge(&self, key: &str, value: i64) -> Result<(), StoreError>;

    /// Atomically take the lock if nobody holds it.
    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Push the expiry of a lock this instance holds. False if it was lost.
    async fn extend_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Release a lock this instance holds. False if it was not held.
    async fn release_lock(&self, key: &str) -> Result<bool, StoreError>;
}

#[async_trait]
impl<T: CounterStore + ?Sized> CounterStore for Arc<T> {
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        (**self).increment(key, delta).await
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        (**self).get(key).await
    }

    async fn set_gauge(&self, key: &str, value: i64) -> Result<(), StoreError> {
        (**self).set_gauge(key, value).await
    }

    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).try_acquire_lock(key, ttl).await
    }

    async fn extend_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).extend_lock(key, ttl).await
    }

    async fn release_lock(&self, key: &str) -> Result<bool, StoreError> {
        (**self).release_lock(key).await
    }
}

pub(crate) fn ttl_millis(ttl: Duration) -> Result<u64, StoreError> {
    let ms = u64::try_from(ttl.as_millis()).map_err(|_| StoreError::InvalidTtl(ttl))?;
    if ms == 0 {
        return Err(StoreError::InvalidTtl(ttl));
    }
    Ok(ms)
}
