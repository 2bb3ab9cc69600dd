//! Infrastructure layer: retry, counter store, batching and the cycle scheduler.

pub mod adapters;
pub mod config;
pub mod followup;
pub mod metrics;
pub mod ports;
pub mod retry;
pub mod store;

pub use config::{ConfigError, EngineConfig};
pub use followup::{
    BatchConfig, BatchReconciler, CycleError, CycleReport, Scheduler, SchedulerConfig,
    SchedulerHandle, SchedulerStatus,
};
pub use metrics::QueueMetrics;
pub use ports::{
    Alert, AlertNotifier, AlertSeverity, CommunicationProvider, Delivery, LeadSource,
    PersistenceError, ProviderError,
};
pub use retry::{RetryError, RetryPolicy, RetryRunner};
pub use store::{CounterStore, InMemoryCounterStore, StoreError};
