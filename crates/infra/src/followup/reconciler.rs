//! Batch reconciler: folds per-lead status updates into bounded writes.
//!
//! Task units report concurrently; the reconciler keeps one open batch per
//! cycle and flushes it when it is full, when it has waited too long, or when
//! the scheduler says the cycle is complete. Each flush is written in chunks,
//! every chunk under its own retry. Entries of a chunk that still fails are
//! kept and written ahead of the next cycle's updates.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use leadflow_core::{BatchId, CycleId, Outcome, StatusUpdate, UpdateKey};
use leadflow_observability::metrics::{
    BATCHES_FLUSHED_TOTAL, FLUSH_ERRORS_TOTAL, LEADS_DEFERRED_TOTAL, LEADS_FAILED_TOTAL,
    LEADS_SENT_TOTAL, PENDING_LEADS,
};

use crate::metrics::QueueMetrics;
use crate::ports::{LeadSource, PersistenceError};
use crate::retry::{RetryError, RetryPolicy, RetryRunner};

/// Batch reconciler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Entries that close a batch on their own.
    pub max_batch_size: usize,
    /// Longest a non-empty batch may stay open.
    pub max_wait: Duration,
    /// Entries per persistence request.
    pub chunk_size: usize,
    /// How often the wait monitor checks the open batch.
    pub monitor_tick: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_wait: Duration::from_secs(30),
            chunk_size: 500,
            monitor_tick: Duration::from_secs(1),
        }
    }
}

impl BatchConfig {
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }
}

/// Why a batch was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlushReason {
    SizeThreshold,
    WaitElapsed,
    CycleComplete,
}

/// A flushed batch. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    pub id: BatchId,
    pub cycle_id: Option<CycleId>,
    pub reason: FlushReason,
    pub updates: Vec<StatusUpdate>,
    /// Entries the lead store accepted.
    pub written: usize,
    /// Entries kept for the next cycle after their chunk failed.
    pub retained: usize,
    pub flushed_at: DateTime<Utc>,
}

impl Batch {
    fn empty(cycle_id: Option<CycleId>, reason: FlushReason) -> Self {
        Self {
            id: BatchId::new(),
            cycle_id,
            reason,
            updates: Vec::new(),
            written: 0,
            retained: 0,
            flushed_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FlushError {
    #[error("batch {batch_id}: {failed_chunks} chunk(s) failed, {retained} entries retained: {source}")]
    Persistence {
        batch_id: BatchId,
        failed_chunks: usize,
        retained: usize,
        written: usize,
        #[source]
        source: RetryError<PersistenceError>,
    },
}

/// What the reconciler did during one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushLedger {
    pub batches: u32,
    pub written: usize,
    pub retained: usize,
    pub duplicates_dropped: usize,
    pub flush_errors: u32,
}

#[derive(Debug, Default)]
struct BatchState {
    cycle_id: Option<CycleId>,
    expected: usize,
    received: usize,
    open: Vec<StatusUpdate>,
    opened_at: Option<Instant>,
    seen: HashSet<UpdateKey>,
    carried: Vec<StatusUpdate>,
    ledger: FlushLedger,
    /// Last failed flush of the cycle, whoever started it.
    failure: Option<FlushError>,
}

impl BatchState {
    fn push(&mut self, update: StatusUpdate) {
        if self.open.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.open.push(update);
    }

    fn ready_reason(&self, config: &BatchConfig) -> Option<FlushReason> {
        if self.open.is_empty() {
            return None;
        }
        if self.open.len() >= config.max_batch_size {
            return Some(FlushReason::SizeThreshold);
        }
        if self.expected > 0 && self.received >= self.expected {
            return Some(FlushReason::CycleComplete);
        }
        match self.opened_at {
            Some(opened) if opened.elapsed() >= config.max_wait => Some(FlushReason::WaitElapsed),
            _ => None,
        }
    }
}

/// Collects status updates and writes them to the lead store in batches.
pub struct BatchReconciler<L> {
    source: Arc<L>,
    config: BatchConfig,
    retry: RetryRunner,
    write_policy: RetryPolicy,
    metrics: QueueMetrics,
    state: Mutex<BatchState>,
    /// Serializes flushes so a forced flush waits for one already writing.
    flush_gate: Mutex<()>,
}

impl<L: LeadSource + 'static> BatchReconciler<L> {
    pub fn new(
        source: Arc<L>,
        config: BatchConfig,
        retry: RetryRunner,
        write_policy: RetryPolicy,
        metrics: QueueMetrics,
    ) -> Self {
        Self {
            source,
            config,
            retry,
            write_policy,
            metrics,
            state: Mutex::new(BatchState::default()),
            flush_gate: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Start a cycle expecting `expected` updates.
    ///
    /// Entries retained from an earlier failed write lead the new batch.
    pub async fn open_cycle(&self, cycle_id: CycleId, expected: usize) {
        let mut state = self.state.lock().await;
        if !state.open.is_empty() {
            warn!(
                cycle_id = %cycle_id,
                leftover = state.open.len(),
                "previous cycle left unflushed entries; carrying them over"
            );
            let leftover = std::mem::take(&mut state.open);
            state.carried.extend(leftover);
        }
        state.cycle_id = Some(cycle_id);
        state.expected = expected;
        state.received = 0;
        state.seen.clear();
        state.ledger = FlushLedger::default();
        state.failure = None;
        state.opened_at = None;

        let carried = std::mem::take(&mut state.carried);
        if !carried.is_empty() {
            info!(cycle_id = %cycle_id, carried = carried.len(), "retrying retained status updates");
            for update in carried {
                state.push(update);
            }
        }
    }

    /// Add one update; flushes and returns the batch when it fills up.
    pub async fn submit(&self, update: StatusUpdate) -> Result<Option<Batch>, FlushError> {
        {
            let mut state = self.state.lock().await;
            if !state.seen.insert(update.key()) {
                debug!(lead_id = %update.lead_id, cycle_id = %update.cycle_id, "duplicate status update dropped");
                state.ledger.duplicates_dropped += 1;
                return Ok(None);
            }
            if state.cycle_id == Some(update.cycle_id) {
                state.received += 1;
            }
            state.push(update);
            if state.open.len() < self.config.max_batch_size {
                return Ok(None);
            }
        }
        self.flush(FlushReason::SizeThreshold).await
    }

    /// Flush if the open batch is full, complete, or has waited too long.
    pub async fn flush_if_ready(&self) -> Result<Option<Batch>, FlushError> {
        let reason = {
            let state = self.state.lock().await;
            state.ready_reason(&self.config)
        };
        match reason {
            Some(reason) => self.flush(reason).await,
            None => Ok(None),
        }
    }

    /// Flush whatever is open. Returns an empty batch when nothing was pending.
    pub async fn force_flush(&self) -> Result<Batch, FlushError> {
        let cycle_id = self.state.lock().await.cycle_id;
        Ok(self
            .flush(FlushReason::CycleComplete)
            .await?
            .unwrap_or_else(|| Batch::empty(cycle_id, FlushReason::CycleComplete)))
    }

    /// Number of entries waiting in the open batch.
    pub async fn pending(&self) -> usize {
        self.state.lock().await.open.len()
    }

    /// Flush statistics for the current cycle, resetting them.
    pub async fn take_ledger(&self) -> FlushLedger {
        std::mem::take(&mut self.state.lock().await.ledger)
    }

    /// Most recent flush failure of the current cycle, including ones hit by
    /// the wait monitor. Clears it.
    pub async fn take_failure(&self) -> Option<FlushError> {
        self.state.lock().await.failure.take()
    }

    async fn flush(&self, reason: FlushReason) -> Result<Option<Batch>, FlushError> {
        let _gate = self.flush_gate.lock().await;

        let (updates, cycle_id) = {
            let mut state = self.state.lock().await;
            if state.open.is_empty() {
                return Ok(None);
            }
            state.opened_at = None;
            (std::mem::take(&mut state.open), state.cycle_id)
        };

        let batch_id = BatchId::new();
        info!(
            batch_id = %batch_id,
            cycle_id = ?cycle_id.map(|c| c.to_string()),
            size = updates.len(),
            reason = ?reason,
            "flushing status batch"
        );

        let chunk_size = self.config.chunk_size.max(1);
        let mut written = 0usize;
        let mut retained = Vec::new();
        let mut failed_chunks = 0usize;
        let mut last_error = None;

        for (index, chunk) in updates.chunks(chunk_size).enumerate() {
            let op_name = format!("apply_batch[{index}]");
            let result = self
                .retry
                .execute(&op_name, &self.write_policy, || self.source.apply_batch(chunk))
                .await;

            match result {
                Ok(()) => {
                    written += chunk.len();
                    self.record_written(chunk, cycle_id).await;
                }
                Err(e) => {
                    error!(
                        batch_id = %batch_id,
                        chunk = index,
                        entries = chunk.len(),
                        error = %e,
                        "status chunk write failed; retaining entries"
                    );
                    self.metrics.incr(FLUSH_ERRORS_TOTAL, 1).await;
                    failed_chunks += 1;
                    retained.extend_from_slice(chunk);
                    last_error = Some(e);
                }
            }
        }

        self.metrics.incr(BATCHES_FLUSHED_TOTAL, 1).await;

        let retained_count = retained.len();
        {
            let mut state = self.state.lock().await;
            state.ledger.batches += 1;
            state.ledger.written += written;
            state.ledger.retained += retained_count;
            state.ledger.flush_errors += failed_chunks as u32;
            state.carried.extend(retained);
        }

        if let Some(source) = last_error {
            let error = FlushError::Persistence {
                batch_id,
                failed_chunks,
                retained: retained_count,
                written,
                source,
            };
            self.state.lock().await.failure = Some(error.clone());
            return Err(error);
        }

        Ok(Some(Batch {
            id: batch_id,
            cycle_id,
            reason,
            updates,
            written,
            retained: retained_count,
            flushed_at: Utc::now(),
        }))
    }

    async fn record_written(&self, chunk: &[StatusUpdate], cycle_id: Option<CycleId>) {
        let mut sent = 0;
        let mut failed = 0;
        let mut deferred = 0;
        let mut current = 0;
        for update in chunk {
            match update.outcome {
                Outcome::Success => sent += 1,
                Outcome::Deferred => deferred += 1,
                o if o.is_failure() => failed += 1,
                _ => {}
            }
            if Some(update.cycle_id) == cycle_id {
                current += 1;
            }
        }
        self.metrics.incr(LEADS_SENT_TOTAL, sent).await;
        self.metrics.incr(LEADS_FAILED_TOTAL, failed).await;
        self.metrics.incr(LEADS_DEFERRED_TOTAL, deferred).await;
        self.metrics.incr(PENDING_LEADS, -current).await;
    }

    /// Spawn the background task that flushes batches left open too long.
    pub fn spawn_wait_monitor(self: &Arc<Self>) -> WaitMonitorHandle {
        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();
        let reconciler = self.clone();
        let tick = reconciler.config.monitor_tick.max(Duration::from_millis(1));

        let join = tokio::spawn(async move {
            debug!("batch wait monitor started");
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = interval.tick() => {
                        match reconciler.flush_if_ready().await {
                            Ok(Some(batch)) => {
                                debug!(batch_id = %batch.id, size = batch.len(), reason = ?batch.reason, "monitor flushed batch");
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "monitor flush failed"),
                        }
                    }
                }
            }
            debug!("batch wait monitor stopped");
        });

        WaitMonitorHandle { shutdown, join }
    }
}

/// Handle to stop the wait monitor.
#[derive(Debug)]
pub struct WaitMonitorHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl WaitMonitorHandle {
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.join.await;
    }
}
