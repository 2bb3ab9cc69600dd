//! Cycle reports and scheduler health.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use leadflow_core::{CycleId, Outcome};

/// Where the scheduler is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    #[default]
    Idle,
    Locked,
    Fetching,
    Dispatching,
    Collecting,
    Flushing,
}

/// Summary of one scheduler cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle_id: CycleId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Another worker held the cycle lock; nothing ran.
    pub skipped_by_lock: bool,
    pub due: usize,
    pub dispatched: usize,
    pub sent: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub panicked: usize,
    pub deferred: usize,
    pub skipped: usize,
    /// Entries the lead store accepted this cycle (including carried-over ones).
    pub flushed: usize,
    /// Entries kept for the next cycle after a failed write.
    pub retained: usize,
    pub batches: u32,
    pub over_threshold: bool,
    pub lock_lost: bool,
}

impl CycleReport {
    pub fn new(cycle_id: CycleId, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id,
            started_at,
            finished_at: started_at,
            ..Default::default()
        }
    }

    pub fn skipped_by_lock(cycle_id: CycleId, started_at: DateTime<Utc>) -> Self {
        Self {
            skipped_by_lock: true,
            ..Self::new(cycle_id, started_at)
        }
    }

    /// Count one produced status update.
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.sent += 1,
            Outcome::Deferred => self.deferred += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::TimedOut => {
                self.timed_out += 1;
                self.failed += 1;
            }
            Outcome::TransientFailure | Outcome::TerminalFailure => self.failed += 1,
        }
    }

    /// Updates produced this cycle, whatever their outcome.
    pub fn produced(&self) -> usize {
        self.sent + self.failed + self.deferred + self.skipped
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>, elapsed: Duration) {
        self.finished_at = finished_at;
        self.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    }

    pub fn summary(&self) -> String {
        if self.skipped_by_lock {
            return format!("cycle {} skipped: lock held by another worker", self.cycle_id);
        }
        format!(
            "cycle {}: {} due, {} sent, {} failed ({} timed out), {} deferred, {} flushed in {} batch(es), {} retained, {} ms",
            self.cycle_id,
            self.due,
            self.sent,
            self.failed,
            self.timed_out,
            self.deferred,
            self.flushed,
            self.batches,
            self.retained,
            self.duration_ms
        )
    }
}

/// Live scheduler state, shared with the handle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub phase: CyclePhase,
    pub started_at: Option<DateTime<Utc>>,
    pub cycles_run: u64,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// Due-count threshold the health check compares against.
    pub queue_alert_threshold: Option<usize>,
}

/// Consecutive failed cycles after which the scheduler reports unhealthy.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

impl SchedulerStatus {
    /// Health check for readiness endpoints.
    ///
    /// Unhealthy when the loop is not running, nothing completed within
    /// `max_staleness`, the last cycles kept failing, the queue is over twice
    /// its alert threshold, or the last cycle attempted sends and none landed.
    pub fn is_healthy(&self, now: DateTime<Utc>, max_staleness: Duration) -> bool {
        if !self.running {
            return false;
        }
        let staleness = chrono::Duration::from_std(max_staleness).unwrap_or(chrono::Duration::MAX);
        let reference = self.last_completed_at.or(self.started_at);
        if reference.is_some_and(|at| now - at > staleness) {
            return false;
        }
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            return false;
        }
        if let Some(report) = &self.last_report {
            if let Some(threshold) = self.queue_alert_threshold {
                if report.due > threshold.saturating_mul(2) {
                    return false;
                }
            }
            if report.sent == 0 && report.failed > 0 {
                return false;
            }
        }
        true
    }
}
