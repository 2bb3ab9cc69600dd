//! In-process counter store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use super::{CounterStore, StoreError, ttl_millis};

#[derive(Debug)]
struct LockEntry {
    owner: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, i64>,
    locks: HashMap<String, LockEntry>,
}

/// In-memory counter store.
///
/// Clones made with [`InMemoryCounterStore::peer`] share the same values but
/// hold a different owner token, which is how two worker processes look to
/// each other.
#[derive(Debug, Clone)]
pub struct InMemoryCounterStore {
    state: Arc<Mutex<State>>,
    owner: String,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            owner: Uuid::now_v7().to_string(),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Another handle on the same data with its own lock owner token.
    pub fn peer(&self) -> Self {
        Self {
            state: self.state.clone(),
            owner: Uuid::now_v7().to_string(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

fn live_lock<'a>(state: &'a mut State, key: &str, now: Instant) -> Option<&'a mut LockEntry> {
    if state.locks.get(key).is_some_and(|l| l.expires_at <= now) {
        state.locks.remove(key);
    }
    state.locks.get_mut(key)
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut state = self.state();
        let value = state.values.entry(key.to_string()).or_insert(0);
        *value = value.saturating_add(delta);
        Ok(*value)
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.state().values.get(key).copied().unwrap_or(0))
    }

    async fn set_gauge(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.state().values.insert(key.to_string(), value);
        Ok(())
    }

    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        ttl_millis(ttl)?;
        let now = Instant::now();
        let mut state = self.state();
        if live_lock(&mut state, key, now).is_some() {
            return Ok(false);
        }
        state.locks.insert(
            key.to_string(),
            LockEntry {
                owner: self.owner.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn extend_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        ttl_millis(ttl)?;
        let now = Instant::now();
        let mut state = self.state();
        match live_lock(&mut state, key, now) {
            Some(lock) if lock.owner == self.owner => {
                lock.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state();
        let held = live_lock(&mut state, key, now).is_some_and(|lock| lock.owner == self.owner);
        if held {
            state.locks.remove(key);
        }
        Ok(held)
    }
}
