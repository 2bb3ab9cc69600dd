//! Queue metric catalogue and point-in-time snapshots.
//!
//! Values live in the shared counter store; this module only names them and
//! gives consumers a format-agnostic view.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const PENDING_LEADS: &str = "leadflow_pending_leads";
pub const RETRIES_TOTAL: &str = "leadflow_retries_total";
pub const RETRY_EXHAUSTED_TOTAL: &str = "leadflow_retry_exhausted_total";
pub const LEADS_SENT_TOTAL: &str = "leadflow_leads_sent_total";
pub const LEADS_FAILED_TOTAL: &str = "leadflow_leads_failed_total";
pub const LEADS_DEFERRED_TOTAL: &str = "leadflow_leads_deferred_total";
pub const BATCHES_FLUSHED_TOTAL: &str = "leadflow_batches_flushed_total";
pub const FLUSH_ERRORS_TOTAL: &str = "leadflow_flush_errors_total";
pub const CYCLES_TOTAL: &str = "leadflow_cycles_total";
pub const CYCLES_SKIPPED_TOTAL: &str = "leadflow_cycles_skipped_total";
pub const CYCLE_TIMEOUTS_TOTAL: &str = "leadflow_cycle_timeouts_total";
pub const LAST_CYCLE_UNIX: &str = "leadflow_last_cycle_unix";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic, only ever incremented.
    Counter,
    /// Point-in-time value, set or adjusted.
    Gauge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricDescriptor {
    pub name: &'static str,
    pub kind: MetricKind,
    pub help: &'static str,
}

const fn counter(name: &'static str, help: &'static str) -> MetricDescriptor {
    MetricDescriptor {
        name,
        kind: MetricKind::Counter,
        help,
    }
}

const fn gauge(name: &'static str, help: &'static str) -> MetricDescriptor {
    MetricDescriptor {
        name,
        kind: MetricKind::Gauge,
        help,
    }
}

/// Every registered queue metric.
pub const DESCRIPTORS: &[MetricDescriptor] = &[
    gauge(PENDING_LEADS, "Leads dispatched in the current cycle and not yet flushed"),
    counter(RETRIES_TOTAL, "Retries scheduled for external calls"),
    counter(RETRY_EXHAUSTED_TOTAL, "External calls that failed after their final attempt"),
    counter(LEADS_SENT_TOTAL, "Leads contacted successfully"),
    counter(LEADS_FAILED_TOTAL, "Leads whose follow-up failed or timed out"),
    counter(LEADS_DEFERRED_TOTAL, "Due leads deferred to the next contact window"),
    counter(BATCHES_FLUSHED_TOTAL, "Status batches written to the lead store"),
    counter(FLUSH_ERRORS_TOTAL, "Status chunks that could not be written"),
    counter(CYCLES_TOTAL, "Scheduler cycles completed"),
    counter(CYCLES_SKIPPED_TOTAL, "Cycles skipped because another worker held the lock"),
    counter(CYCLE_TIMEOUTS_TOTAL, "Cycles that hit their deadline with work outstanding"),
    gauge(LAST_CYCLE_UNIX, "Unix time of the last completed cycle"),
];

pub fn descriptor(name: &str) -> Option<&'static MetricDescriptor> {
    DESCRIPTORS.iter().find(|d| d.name == name)
}

/// Values of every registered metric at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub captured_at: DateTime<Utc>,
    pub values: BTreeMap<&'static str, i64>,
}

impl MetricsSnapshot {
    pub fn new(captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            values: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, name: &'static str, value: i64) {
        self.values.insert(name, value);
    }

    /// Value of a metric; absent metrics read as zero.
    pub fn get(&self, name: &str) -> i64 {
        self.values.get(name).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_are_unique_and_prefixed() {
        let mut names: Vec<_> = DESCRIPTORS.iter().map(|d| d.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), DESCRIPTORS.len());
        assert!(names.iter().all(|n| n.starts_with("leadflow_")));
        assert_eq!(descriptor(PENDING_LEADS).map(|d| d.kind), Some(MetricKind::Gauge));
        assert_eq!(descriptor(RETRIES_TOTAL).map(|d| d.kind), Some(MetricKind::Counter));
    }

    #[test]
    fn snapshot_reads_missing_values_as_zero() {
        let mut snapshot = MetricsSnapshot::new(Utc::now());
        snapshot.record(LEADS_SENT_TOTAL, 4);
        assert_eq!(snapshot.get(LEADS_SENT_TOTAL), 4);
        assert_eq!(snapshot.get(LEADS_FAILED_TOTAL), 0);

        let json = snapshot.to_json();
        assert_eq!(json["values"][LEADS_SENT_TOTAL], 4);
    }
}
