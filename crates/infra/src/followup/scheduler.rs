//! Cycle scheduler: lock, fetch, fan out, collect, flush.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use leadflow_core::{CycleId, Outcome, StatusUpdate};
use leadflow_observability::metrics::{
    CYCLE_TIMEOUTS_TOTAL, CYCLES_SKIPPED_TOTAL, CYCLES_TOTAL, LAST_CYCLE_UNIX, PENDING_LEADS,
};

use super::reconciler::{BatchReconciler, FlushError};
use super::report::{CyclePhase, CycleReport, SchedulerStatus};
use super::task_unit::{TaskUnit, TaskUnitExecutor};
use crate::config::EngineConfig;
use crate::metrics::QueueMetrics;
use crate::ports::{Alert, AlertNotifier, CommunicationProvider, LeadSource, PersistenceError};
use crate::retry::{RetryError, RetryPolicy, RetryRunner};
use crate::store::{CounterStore, StoreError};

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Name for logging
    pub name: String,
    /// Time between cycle starts
    pub cadence: Duration,
    /// Deadline for collecting task results
    pub cycle_timeout: Duration,
    /// Task units running at once
    pub max_parallelism: usize,
    /// Store key of the cross-worker cycle lock
    pub lock_key: String,
    /// Lock expiry; renewed every `lock_ttl / 3` while a cycle runs
    pub lock_ttl: Duration,
    /// Due count above which the cycle raises a queue alert
    pub queue_alert_threshold: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "followup-scheduler".to_string(),
            cadence: Duration::from_secs(5 * 60),
            cycle_timeout: Duration::from_secs(4 * 60),
            max_parallelism: 10,
            lock_key: "followup:cycle-lock".to_string(),
            lock_ttl: Duration::from_secs(10 * 60),
            queue_alert_threshold: Some(100),
        }
    }
}

impl SchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = timeout;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_max_parallelism(mut self, max: usize) -> Self {
        self.max_parallelism = max;
        self
    }

    pub fn with_queue_alert_threshold(mut self, threshold: Option<usize>) -> Self {
        self.queue_alert_threshold = threshold;
        self
    }
}

/// Cycle-level failure.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("fetching due leads failed: {0}")]
    Fetch(#[source] RetryError<PersistenceError>),
    /// The cycle ran, but some status updates could not be written.
    #[error("flushing status updates failed: {source}")]
    Flush {
        report: Box<CycleReport>,
        #[source]
        source: FlushError,
    },
    #[error("counter store failed: {0}")]
    Store(#[from] StoreError),
}

/// Source of "now" for a cycle.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Drives follow-up cycles.
pub struct Scheduler<L, P> {
    config: SchedulerConfig,
    source: Arc<L>,
    executor: TaskUnitExecutor<P>,
    reconciler: Arc<BatchReconciler<L>>,
    store: Arc<dyn CounterStore>,
    metrics: QueueMetrics,
    retry: RetryRunner,
    fetch_policy: RetryPolicy,
    notifier: Option<Arc<dyn AlertNotifier>>,
    status: Arc<RwLock<SchedulerStatus>>,
    clock: Clock,
}

impl<L, P> Scheduler<L, P>
where
    L: LeadSource + 'static,
    P: CommunicationProvider + 'static,
{
    pub fn new(
        engine: &EngineConfig,
        source: Arc<L>,
        provider: Arc<P>,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        let metrics = QueueMetrics::new(store.clone());
        let retry = RetryRunner::new(metrics.clone());
        let policy = Arc::new(engine.stage_policy.clone());

        let executor = TaskUnitExecutor::new(
            provider,
            policy,
            retry.clone(),
            engine.provider_retry.clone(),
        )
        .with_contact_window(engine.contact_window);

        let reconciler = Arc::new(BatchReconciler::new(
            source.clone(),
            engine.batch.clone(),
            retry.clone(),
            engine.persistence_retry.clone(),
            metrics.clone(),
        ));

        let status = SchedulerStatus {
            queue_alert_threshold: engine.scheduler.queue_alert_threshold,
            ..Default::default()
        };

        Self {
            config: engine.scheduler.clone(),
            source,
            executor,
            reconciler,
            store,
            metrics,
            retry,
            fetch_policy: engine.persistence_retry.clone(),
            notifier: None,
            status: Arc::new(RwLock::new(status)),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn reconciler(&self) -> &Arc<BatchReconciler<L>> {
        &self.reconciler
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    pub fn status(&self) -> SchedulerStatus {
        read_status(&self.status)
    }

    fn set_phase(&self, phase: CyclePhase) {
        write_status(&self.status, |s| s.phase = phase);
    }

    async fn notify(&self, alert: Alert) {
        if let Some(notifier) = &self.notifier {
            notifier.alert(alert).await;
        }
    }

    /// Run one cycle and record its outcome in the scheduler status.
    ///
    /// A cycle skipped because another worker holds the lock is `Ok` with
    /// [`CycleReport::skipped_by_lock`] set.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let cycle_id = CycleId::new();
        let span = info_span!("cycle", cycle_id = %cycle_id, scheduler = %self.config.name);
        let result = self.guarded_cycle(cycle_id).instrument(span).await;
        self.record_outcome(cycle_id, &result).await;
        result
    }

    async fn guarded_cycle(&self, cycle_id: CycleId) -> Result<CycleReport, CycleError> {
        let started = tokio::time::Instant::now();
        let now = (self.clock)();

        let acquired = self
            .store
            .try_acquire_lock(&self.config.lock_key, self.config.lock_ttl)
            .await?;
        if !acquired {
            info!("cycle lock held by another worker, skipping");
            self.metrics.incr(CYCLES_SKIPPED_TOTAL, 1).await;
            let mut report = CycleReport::skipped_by_lock(cycle_id, now);
            report.finish((self.clock)(), started.elapsed());
            return Ok(report);
        }
        self.set_phase(CyclePhase::Locked);

        let lock_lost = Arc::new(Notify::new());
        let renewal = self.spawn_lock_renewal(lock_lost.clone());

        let result = self.locked_cycle(cycle_id, now).await;

        renewal.abort();
        let lost = tokio::time::timeout(Duration::ZERO, lock_lost.notified())
            .await
            .is_ok();
        match self.store.release_lock(&self.config.lock_key).await {
            Ok(true) => debug!("cycle lock released"),
            Ok(false) => warn!("cycle lock already gone at release"),
            Err(e) => error!(error = %e, "cycle lock release failed; it will expire"),
        }
        self.set_phase(CyclePhase::Idle);

        let finished = (self.clock)();
        match result {
            Ok(mut report) => {
                report.lock_lost = lost;
                report.finish(finished, started.elapsed());
                Ok(report)
            }
            Err(CycleError::Flush { mut report, source }) => {
                report.lock_lost = lost;
                report.finish(finished, started.elapsed());
                Err(CycleError::Flush { report, source })
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_lock_renewal(&self, lost: Arc<Notify>) -> JoinHandle<()> {
        let store = self.store.clone();
        let key = self.config.lock_key.clone();
        let ttl = self.config.lock_ttl;
        let every = (ttl / 3).max(Duration::from_millis(1));

        tokio::spawn(
            async move {
                loop {
                    tokio::time::sleep(every).await;
                    match store.extend_lock(&key, ttl).await {
                        Ok(true) => debug!("cycle lock renewed"),
                        Ok(false) => {
                            warn!("cycle lock lost before the cycle finished");
                            lost.notify_one();
                            break;
                        }
                        Err(e) => warn!(error = %e, "cycle lock renewal failed"),
                    }
                }
            }
            .in_current_span(),
        )
    }

    async fn locked_cycle(
        &self,
        cycle_id: CycleId,
        now: DateTime<Utc>,
    ) -> Result<CycleReport, CycleError> {
        let mut report = CycleReport::new(cycle_id, now);

        self.set_phase(CyclePhase::Fetching);
        let leads = self
            .retry
            .execute("fetch_due", &self.fetch_policy, || self.source.fetch_due(now))
            .await
            .map_err(CycleError::Fetch)?;

        report.due = leads.len();
        info!(due = leads.len(), "cycle started");
        self.reconciler.open_cycle(cycle_id, leads.len()).await;
        self.metrics.set(PENDING_LEADS, leads.len() as i64).await;

        if let Some(threshold) = self.config.queue_alert_threshold {
            if leads.len() > threshold {
                report.over_threshold = true;
                warn!(due = leads.len(), threshold, "follow-up queue over alert threshold");
                self.notify(
                    Alert::warning(
                        "follow-up queue over threshold",
                        format!("{} leads due, threshold {}", leads.len(), threshold),
                    )
                    .for_cycle(cycle_id),
                )
                .await;
            }
        }

        self.set_phase(CyclePhase::Dispatching);
        let permits = self.config.max_parallelism.clamp(1, Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut tasks = JoinSet::new();
        let mut outstanding = HashMap::with_capacity(leads.len());

        for lead in leads {
            let unit = TaskUnit::new(cycle_id, lead);
            let executor = self.executor.clone();
            let semaphore = semaphore.clone();
            let task_unit = unit.clone();
            let handle = tasks.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await;
                    executor.run(&task_unit, now).await
                }
                .in_current_span(),
            );
            outstanding.insert(handle.id(), unit);
        }
        report.dispatched = outstanding.len();

        self.set_phase(CyclePhase::Collecting);
        let mut flush_error = None;
        let deadline = tokio::time::Instant::now() + self.config.cycle_timeout;
        let mut timed_out = false;

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next_with_id()).await {
                Ok(None) => break,
                Ok(Some(Ok((id, update)))) => {
                    outstanding.remove(&id);
                    self.submit(update, &mut report, &mut flush_error).await;
                }
                Ok(Some(Err(join_error))) => {
                    if let Some(unit) = outstanding.remove(&join_error.id()) {
                        let update = self.panicked(&unit, &join_error.to_string(), now, &mut report);
                        self.submit(update, &mut report, &mut flush_error).await;
                    }
                }
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            warn!(outstanding = outstanding.len(), "cycle deadline reached, abandoning task units");
            tasks.abort_all();
            while let Some(joined) = tasks.join_next_with_id().await {
                match joined {
                    Ok((id, update)) => {
                        outstanding.remove(&id);
                        self.submit(update, &mut report, &mut flush_error).await;
                    }
                    Err(join_error) if join_error.is_panic() => {
                        if let Some(unit) = outstanding.remove(&join_error.id()) {
                            let update =
                                self.panicked(&unit, &join_error.to_string(), now, &mut report);
                            self.submit(update, &mut report, &mut flush_error).await;
                        }
                    }
                    Err(_) => {}
                }
            }

            let mut abandoned: Vec<_> = outstanding.into_values().collect();
            abandoned.sort_by(|a, b| a.lead.id.cmp(&b.lead.id));
            for unit in abandoned {
                let update = self.executor.failed(
                    &unit,
                    Outcome::TimedOut,
                    format!("abandoned at the {:?} cycle deadline", self.config.cycle_timeout),
                    now,
                );
                self.submit(update, &mut report, &mut flush_error).await;
            }
            self.metrics.incr(CYCLE_TIMEOUTS_TOTAL, 1).await;
        }

        self.set_phase(CyclePhase::Flushing);
        if let Err(e) = self.reconciler.force_flush().await {
            flush_error = Some(e);
        }
        // Failures of flushes started by the wait monitor only show up here.
        if let Some(e) = self.reconciler.take_failure().await {
            flush_error.get_or_insert(e);
        }

        let ledger = self.reconciler.take_ledger().await;
        report.flushed = ledger.written;
        report.retained = ledger.retained;
        report.batches = ledger.batches;

        info!(
            dispatched = report.dispatched,
            sent = report.sent,
            failed = report.failed,
            timed_out = report.timed_out,
            deferred = report.deferred,
            flushed = report.flushed,
            retained = report.retained,
            "cycle finished"
        );

        match flush_error {
            Some(source) => Err(CycleError::Flush {
                report: Box::new(report),
                source,
            }),
            None => Ok(report),
        }
    }

    fn panicked(
        &self,
        unit: &TaskUnit,
        detail: &str,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> StatusUpdate {
        error!(lead_id = %unit.lead.id, error = %detail, "task unit panicked");
        report.panicked += 1;
        self.executor
            .failed(unit, Outcome::TerminalFailure, format!("task unit panicked: {detail}"), now)
    }

    async fn submit(
        &self,
        update: StatusUpdate,
        report: &mut CycleReport,
        flush_error: &mut Option<FlushError>,
    ) {
        debug!(lead_id = %update.lead_id, outcome = %update.outcome, "task unit reported");
        report.record(update.outcome);
        match self.reconciler.submit(update).await {
            Ok(Some(batch)) => debug!(batch_id = %batch.id, size = batch.len(), "size-threshold flush"),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "mid-cycle flush failed");
                flush_error.get_or_insert(e);
            }
        }
    }

    async fn record_outcome(&self, cycle_id: CycleId, result: &Result<CycleReport, CycleError>) {
        let finished = (self.clock)();

        match result {
            Ok(report) if report.skipped_by_lock => {
                write_status(&self.status, |s| s.last_report = Some(report.clone()));
            }
            Ok(report) => {
                self.metrics.incr(CYCLES_TOTAL, 1).await;
                self.metrics.set(LAST_CYCLE_UNIX, finished.timestamp()).await;
                write_status(&self.status, |s| {
                    s.cycles_run += 1;
                    s.last_completed_at = Some(finished);
                    s.last_report = Some(report.clone());
                    s.last_error = None;
                    s.consecutive_failures = 0;
                });
                self.notify(
                    Alert::info("follow-up cycle summary", report.summary())
                        .for_cycle(cycle_id)
                        .with_context(serde_json::to_value(report).unwrap_or_default()),
                )
                .await;
            }
            Err(e) => {
                error!(cycle_id = %cycle_id, error = %e, "cycle failed");
                let report = match e {
                    CycleError::Flush { report, .. } => Some((**report).clone()),
                    _ => None,
                };
                if report.is_some() {
                    self.metrics.incr(CYCLES_TOTAL, 1).await;
                    self.metrics.set(LAST_CYCLE_UNIX, finished.timestamp()).await;
                }
                write_status(&self.status, |s| {
                    s.last_error = Some(e.to_string());
                    s.consecutive_failures += 1;
                    if let Some(report) = report.clone() {
                        s.cycles_run += 1;
                        s.last_completed_at = Some(finished);
                        s.last_report = Some(report);
                    }
                });
                let title = match e {
                    CycleError::Fetch(_) => "lead fetch failed",
                    CycleError::Flush { .. } => "status flush failed",
                    CycleError::Store(_) => "counter store unavailable",
                };
                self.notify(Alert::critical(title, e.to_string()).for_cycle(cycle_id))
                    .await;
            }
        }
    }

    /// Run cycles on the configured cadence until shut down.
    pub fn spawn(self) -> SchedulerHandle {
        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();
        let status = self.status.clone();
        let scheduler = Arc::new(self);

        write_status(&status, |s| {
            s.running = true;
            s.started_at = Some((scheduler.clock)());
        });

        let join = tokio::spawn(async move {
            let name = scheduler.config.name.clone();
            info!(scheduler = %name, cadence_secs = scheduler.config.cadence.as_secs(), "scheduler started");

            let monitor = scheduler.reconciler.spawn_wait_monitor();
            let cadence = scheduler.config.cadence.max(Duration::from_millis(1));
            let mut interval = tokio::time::interval(cadence);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = stop.notified() => {
                        info!(scheduler = %name, "scheduler received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        match scheduler.run_cycle().await {
                            Ok(report) => debug!(scheduler = %name, summary = %report.summary(), "cycle complete"),
                            Err(e) => debug!(scheduler = %name, error = %e, "cycle returned an error"),
                        }
                    }
                }
            }

            monitor.shutdown().await;
            write_status(&scheduler.status, |s| {
                s.running = false;
                s.phase = CyclePhase::Idle;
            });
            info!(scheduler = %name, "scheduler stopped");
        });

        SchedulerHandle {
            shutdown,
            join,
            status,
        }
    }
}

fn read_status(status: &RwLock<SchedulerStatus>) -> SchedulerStatus {
    status
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn write_status(status: &RwLock<SchedulerStatus>, f: impl FnOnce(&mut SchedulerStatus)) {
    let mut guard = status.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard);
}

/// Handle to control a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
    status: Arc<RwLock<SchedulerStatus>>,
}

impl SchedulerHandle {
    /// Stop after the in-flight cycle and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.join.await;
    }

    pub fn status(&self) -> SchedulerStatus {
        read_status(&self.status)
    }

    pub fn is_healthy(&self, now: DateTime<Utc>, max_staleness: Duration) -> bool {
        self.status().is_healthy(now, max_staleness)
    }
}
