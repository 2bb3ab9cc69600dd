//! Follow-up engine: task units, batch reconciliation and the cycle scheduler.

pub mod reconciler;
pub mod report;
pub mod scheduler;
pub mod task_unit;

pub use reconciler::{
    Batch, BatchConfig, BatchReconciler, FlushError, FlushLedger, FlushReason, WaitMonitorHandle,
};
pub use report::{CyclePhase, CycleReport, MAX_CONSECUTIVE_FAILURES, SchedulerStatus};
pub use scheduler::{Clock, CycleError, Scheduler, SchedulerConfig, SchedulerHandle};
pub use task_unit::{TaskUnit, TaskUnitExecutor};
