//! Queue metrics backed by the shared counter store.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use leadflow_observability::metrics::DESCRIPTORS;
use leadflow_observability::MetricsSnapshot;

use crate::store::{CounterStore, StoreError};

/// Writes and reads the registered queue metrics.
///
/// Writes never fail the caller: a store error is logged and dropped, so
/// telemetry cannot change the outcome of the work it measures.
#[derive(Clone)]
pub struct QueueMetrics {
    store: Arc<dyn CounterStore>,
}

impl std::fmt::Debug for QueueMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMetrics").finish_non_exhaustive()
    }
}

impl QueueMetrics {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub async fn incr(&self, name: &'static str, delta: i64) {
        if delta == 0 {
            return;
        }
        if let Err(e) = self.store.increment(name, delta).await {
            warn!(metric = name, delta, error = %e, "metric increment failed");
        }
    }

    pub async fn set(&self, name: &'static str, value: i64) {
        if let Err(e) = self.store.set_gauge(name, value).await {
            warn!(metric = name, value, error = %e, "gauge update failed");
        }
    }

    pub async fn get(&self, name: &str) -> Result<i64, StoreError> {
        self.store.get(name).await
    }

    /// Read every registered metric.
    pub async fn snapshot(&self) -> Result<MetricsSnapshot, StoreError> {
        let mut snapshot = MetricsSnapshot::new(Utc::now());
        for descriptor in DESCRIPTORS {
            snapshot.record(descriptor.name, self.store.get(descriptor.name).await?);
        }
        Ok(snapshot)
    }
}
