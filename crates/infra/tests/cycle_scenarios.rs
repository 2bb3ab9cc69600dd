//! Whole-cycle scenarios against in-memory collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use leadflow_core::{Action, Channel, Lead, LeadId, Outcome, Stage};
use leadflow_infra::adapters::InMemoryLeadSource;
use leadflow_infra::followup::CycleError;
use leadflow_infra::{
    Alert, AlertNotifier, AlertSeverity, CommunicationProvider, CounterStore, Delivery,
    EngineConfig, InMemoryCounterStore, LeadSource, ProviderError, QueueMetrics, RetryPolicy,
    Scheduler, StoreError,
};
use leadflow_infra::followup::BatchConfig;
use leadflow_observability::metrics::{
    CYCLE_TIMEOUTS_TOTAL, CYCLES_SKIPPED_TOTAL, CYCLES_TOTAL, FLUSH_ERRORS_TOTAL,
    LEADS_DEFERRED_TOTAL, LEADS_FAILED_TOTAL, LEADS_SENT_TOTAL, PENDING_LEADS,
};

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Terminal,
    Hang,
    Panic,
    Slow(Duration),
}

/// Delivers to every lead except the scripted ones.
#[derive(Default)]
struct ScriptedProvider {
    script: HashMap<String, Behavior>,
}

impl ScriptedProvider {
    fn with(mut self, lead: &str, behavior: Behavior) -> Self {
        self.script.insert(lead.to_string(), behavior);
        self
    }
}

#[async_trait]
impl CommunicationProvider for ScriptedProvider {
    async fn send(&self, lead: &Lead, action: &Action) -> Result<Delivery, ProviderError> {
        match self.script.get(lead.id.as_str()) {
            Some(Behavior::Terminal) => Err(ProviderError::Terminal("recipient rejected".into())),
            Some(Behavior::Hang) => std::future::pending().await,
            Some(Behavior::Panic) => panic!("template rendering bug"),
            Some(Behavior::Slow(delay)) => {
                tokio::time::sleep(*delay).await;
                Ok(Delivery {
                    kind: action.kind,
                    message_id: format!("msg-{}", lead.id),
                })
            }
            None => Ok(Delivery {
                kind: action.kind,
                message_id: format!("msg-{}", lead.id),
            }),
        }
    }
}

#[derive(Default)]
struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    fn severities(&self) -> Vec<AlertSeverity> {
        self.alerts.lock().unwrap().iter().map(|a| a.severity).collect()
    }
}

#[async_trait]
impl AlertNotifier for RecordingNotifier {
    async fn alert(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

/// Wednesday, inside business hours.
fn morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 20, 10, 0, 0).unwrap()
}

fn evening() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 20, 20, 0, 0).unwrap()
}

fn lead(id: &str) -> Lead {
    Lead::new(
        LeadId::new(id).unwrap(),
        id,
        Channel::Email,
        morning() - chrono::Duration::hours(1),
    )
    .with_email(format!("{id}@example.com"))
}

fn engine() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.scheduler = config
        .scheduler
        .with_cycle_timeout(Duration::from_secs(5))
        .with_max_parallelism(4);
    config.provider_retry = RetryPolicy::fixed(3, Duration::from_millis(100));
    config.persistence_retry = RetryPolicy::fixed(3, Duration::from_millis(100));
    config
}

struct Harness {
    scheduler: Scheduler<InMemoryLeadSource, ScriptedProvider>,
    source: Arc<InMemoryLeadSource>,
    store: Arc<InMemoryCounterStore>,
    notifier: Arc<RecordingNotifier>,
}

impl Harness {
    fn new(config: EngineConfig, leads: Vec<Lead>, provider: ScriptedProvider) -> Self {
        Self::at(config, leads, provider, morning)
    }

    fn at(
        config: EngineConfig,
        leads: Vec<Lead>,
        provider: ScriptedProvider,
        clock: fn() -> DateTime<Utc>,
    ) -> Self {
        let source = Arc::new(InMemoryLeadSource::with_leads(leads));
        let store = InMemoryCounterStore::arc();
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = Scheduler::new(&config, source.clone(), Arc::new(provider), store.clone())
            .with_notifier(notifier.clone())
            .with_clock(Arc::new(clock));
        Self {
            scheduler,
            source,
            store,
            notifier,
        }
    }

    async fn metric(&self, name: &str) -> i64 {
        QueueMetrics::new(self.store.clone()).get(name).await.unwrap()
    }
}

#[tokio::test]
async fn every_due_lead_gets_exactly_one_update() {
    let leads: Vec<_> = (0..25).map(|n| lead(&format!("lead-{n:02}"))).collect();
    let mut config = engine();
    config.batch = config.batch.with_max_batch_size(10);
    let h = Harness::new(config, leads, ScriptedProvider::default());

    let report = h.scheduler.run_cycle().await.unwrap();

    let updates = h.source.applied_updates();
    assert_eq!(updates.len(), 25);
    let keys: HashSet<_> = updates.iter().map(|u| u.key()).collect();
    assert_eq!(keys.len(), 25);
    assert!(updates.iter().all(|u| u.cycle_id == report.cycle_id));

    assert_eq!((report.due, report.dispatched, report.sent), (25, 25, 25));
    assert_eq!(report.flushed, 25);
    assert_eq!(report.batches, 3);
    assert_eq!(h.metric(LEADS_SENT_TOTAL).await, 25);
    assert_eq!(h.metric(PENDING_LEADS).await, 0);
    assert_eq!(h.metric(CYCLES_TOTAL).await, 1);
}

#[tokio::test(start_paused = true)]
async fn success_terminal_failure_and_hang_all_report() {
    let provider = ScriptedProvider::default()
        .with("bad", Behavior::Terminal)
        .with("stuck", Behavior::Hang);
    let h = Harness::new(engine(), vec![lead("bad"), lead("good"), lead("stuck")], provider);

    let report = h.scheduler.run_cycle().await.unwrap();

    let outcomes: HashMap<_, _> = h
        .source
        .applied_updates()
        .into_iter()
        .map(|u| (u.lead_id.as_str().to_string(), u.outcome))
        .collect();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes["good"], Outcome::Success);
    assert_eq!(outcomes["bad"], Outcome::TerminalFailure);
    assert_eq!(outcomes["stuck"], Outcome::TimedOut);

    assert_eq!((report.sent, report.failed, report.timed_out), (1, 2, 1));
    assert_eq!(h.metric(PENDING_LEADS).await, 0);
    assert_eq!(h.metric(LEADS_FAILED_TOTAL).await, 2);
    assert_eq!(h.metric(CYCLE_TIMEOUTS_TOTAL).await, 1);

    // The cycle lock was released despite the abandoned task.
    let other = h.store.peer();
    assert!(
        other
            .try_acquire_lock(&engine().scheduler.lock_key, Duration::from_secs(60))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn second_worker_skips_while_the_lock_is_held() {
    let h = Harness::new(engine(), vec![lead("a")], ScriptedProvider::default());
    let other_worker = h.store.peer();
    assert!(
        other_worker
            .try_acquire_lock(&engine().scheduler.lock_key, Duration::from_secs(600))
            .await
            .unwrap()
    );

    let report = h.scheduler.run_cycle().await.unwrap();

    assert!(report.skipped_by_lock);
    assert!(h.source.writes().is_empty());
    assert_eq!(h.metric(CYCLES_SKIPPED_TOTAL).await, 1);
    assert_eq!(h.metric(CYCLES_TOTAL).await, 0);
}

#[tokio::test]
async fn panicking_task_unit_becomes_a_failure_update() {
    let provider = ScriptedProvider::default().with("boom", Behavior::Panic);
    let h = Harness::new(engine(), vec![lead("boom"), lead("fine")], provider);

    let report = h.scheduler.run_cycle().await.unwrap();

    assert_eq!((report.sent, report.failed, report.panicked), (1, 1, 1));
    let boom = h
        .source
        .applied_updates()
        .into_iter()
        .find(|u| u.lead_id.as_str() == "boom")
        .unwrap();
    assert_eq!(boom.outcome, Outcome::TerminalFailure);
    assert!(boom.error.unwrap().contains("panicked"));
    assert_eq!(boom.failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_flush_is_written_by_the_next_cycle() {
    let h = Harness::new(engine(), vec![lead("a"), lead("b")], ScriptedProvider::default());
    h.source.fail_next_writes(3);

    let err = h.scheduler.run_cycle().await.unwrap_err();
    let CycleError::Flush { report, .. } = err else {
        panic!("expected a flush error");
    };
    assert_eq!(report.retained, 2);
    assert!(h.source.writes().is_empty());
    assert_eq!(h.metric(FLUSH_ERRORS_TOTAL).await, 1);
    assert_eq!(h.scheduler.status().consecutive_failures, 1);
    assert!(h.notifier.severities().contains(&AlertSeverity::Critical));

    let second = h.scheduler.run_cycle().await.unwrap();

    assert_eq!(second.flushed, 4);
    let cycles: HashSet<_> = h.source.applied_updates().iter().map(|u| u.cycle_id).collect();
    assert!(cycles.contains(&report.cycle_id));
    assert!(cycles.contains(&second.cycle_id));
    assert_eq!(h.source.lead(&LeadId::new("a").unwrap()).unwrap().stage, Stage::Contacted);
    assert_eq!(h.scheduler.status().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn flush_failed_by_the_wait_monitor_fails_the_cycle() {
    let mut config = engine();
    config.batch = BatchConfig {
        max_batch_size: 100,
        max_wait: Duration::from_secs(1),
        chunk_size: 500,
        monitor_tick: Duration::from_millis(100),
    };
    let provider = ScriptedProvider::default().with("slow", Behavior::Slow(Duration::from_secs(3)));
    let h = Harness::new(config, vec![lead("fast"), lead("slow")], provider);
    h.source.fail_next_writes(3);
    let monitor = h.scheduler.reconciler().spawn_wait_monitor();

    let err = h.scheduler.run_cycle().await.unwrap_err();
    monitor.shutdown().await;

    let CycleError::Flush { report, .. } = err else {
        panic!("expected a flush error");
    };
    assert_eq!(report.retained, 1);
    assert_eq!(report.flushed, 1);
    let written: Vec<_> = h
        .source
        .applied_updates()
        .into_iter()
        .map(|u| u.lead_id.as_str().to_string())
        .collect();
    assert_eq!(written, vec!["slow".to_string()]);
    assert_eq!(h.metric(FLUSH_ERRORS_TOTAL).await, 1);
    assert_eq!(h.scheduler.status().consecutive_failures, 1);
    assert!(h.notifier.severities().contains(&AlertSeverity::Critical));

    // The retained update goes out with the next cycle, next to the re-run of its lead.
    let second = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(second.flushed, 2);
    assert_eq!(h.scheduler.status().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn lock_is_renewed_while_a_long_cycle_runs() {
    let mut config = engine();
    config.scheduler = config
        .scheduler
        .with_lock_ttl(Duration::from_secs(6))
        .with_cycle_timeout(Duration::from_secs(20));
    let provider = ScriptedProvider::default().with("slow", Behavior::Slow(Duration::from_secs(15)));
    let h = Harness::new(config.clone(), vec![lead("slow")], provider);
    let other_worker = h.store.peer();
    let key = config.scheduler.lock_key.clone();

    let (cycle, stolen) = tokio::join!(h.scheduler.run_cycle(), async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        other_worker
            .try_acquire_lock(&key, Duration::from_secs(60))
            .await
            .unwrap()
    });

    assert!(!stolen, "lock expired mid-cycle");
    let report = cycle.unwrap();
    assert_eq!(report.sent, 1);
    assert!(!report.lock_lost);
    assert!(other_worker.try_acquire_lock(&key, Duration::from_secs(60)).await.unwrap());
}

/// Grants the lock but refuses every renewal, as if it expired underneath us.
struct ExpiringLockStore {
    inner: InMemoryCounterStore,
}

#[async_trait]
impl CounterStore for ExpiringLockStore {
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.inner.increment(key, delta).await
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        self.inner.get(key).await
    }

    async fn set_gauge(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.inner.set_gauge(key, value).await
    }

    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.inner.try_acquire_lock(key, ttl).await
    }

    async fn extend_lock(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn release_lock(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.release_lock(key).await
    }
}

#[tokio::test(start_paused = true)]
async fn lock_lost_mid_cycle_is_reported() {
    let mut config = engine();
    config.scheduler = config
        .scheduler
        .with_lock_ttl(Duration::from_secs(6))
        .with_cycle_timeout(Duration::from_secs(20));
    let provider = ScriptedProvider::default().with("slow", Behavior::Slow(Duration::from_secs(5)));
    let source = Arc::new(InMemoryLeadSource::with_leads(vec![lead("slow")]));
    let store = Arc::new(ExpiringLockStore {
        inner: InMemoryCounterStore::default(),
    });
    let scheduler = Scheduler::new(&config, source.clone(), Arc::new(provider), store)
        .with_clock(Arc::new(morning));

    let report = scheduler.run_cycle().await.unwrap();

    assert!(report.lock_lost);
    assert_eq!(report.sent, 1);
    assert_eq!(source.applied_updates().len(), 1);
}

#[tokio::test]
async fn replaying_a_flushed_batch_changes_nothing() {
    let h = Harness::new(engine(), vec![lead("a"), lead("b")], ScriptedProvider::default());
    h.scheduler.run_cycle().await.unwrap();
    assert_eq!(h.source.stage_changes(), 2);

    let replay = h.source.applied_updates();
    h.source.apply_batch(&replay).await.unwrap();

    assert_eq!(h.source.stage_changes(), 2);
}

#[tokio::test]
async fn leads_outside_the_contact_window_are_deferred() {
    let mut late = lead("late");
    late.next_action_due = Some(evening() - chrono::Duration::minutes(10));
    let h = Harness::at(engine(), vec![late], ScriptedProvider::default(), evening);

    let report = h.scheduler.run_cycle().await.unwrap();

    assert_eq!(report.deferred, 1);
    let stored = h.source.lead(&LeadId::new("late").unwrap()).unwrap();
    assert_eq!(stored.stage, Stage::New);
    assert_eq!(
        stored.next_action_due,
        Some(Utc.with_ymd_and_hms(2024, 3, 21, 9, 0, 0).unwrap())
    );
    assert_eq!(h.metric(LEADS_DEFERRED_TOTAL).await, 1);
}

#[tokio::test]
async fn queue_over_threshold_raises_a_warning() {
    let mut config = engine();
    config.scheduler = config.scheduler.with_queue_alert_threshold(Some(2));
    let h = Harness::new(
        config,
        vec![lead("a"), lead("b"), lead("c")],
        ScriptedProvider::default(),
    );

    let report = h.scheduler.run_cycle().await.unwrap();

    assert!(report.over_threshold);
    assert_eq!(
        h.notifier.severities(),
        vec![AlertSeverity::Warning, AlertSeverity::Info]
    );
}

#[tokio::test(start_paused = true)]
async fn fetch_failure_is_a_cycle_error_and_releases_the_lock() {
    let h = Harness::new(engine(), vec![lead("a")], ScriptedProvider::default());
    h.source.fail_next_fetches(3);

    let err = h.scheduler.run_cycle().await.unwrap_err();
    assert!(matches!(err, CycleError::Fetch(_)));
    assert_eq!(h.notifier.severities(), vec![AlertSeverity::Critical]);
    assert_eq!(h.scheduler.status().last_error.as_deref(), Some(err.to_string().as_str()));

    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.sent, 1);
}

#[tokio::test(start_paused = true)]
async fn spawned_loop_runs_on_cadence_until_shutdown() {
    let mut config = engine();
    config.scheduler = config.scheduler.with_cadence(Duration::from_secs(60));
    let h = Harness::new(config, vec![lead("a")], ScriptedProvider::default());
    let source = h.source.clone();

    let handle = h.scheduler.spawn();
    tokio::time::sleep(Duration::from_secs(150)).await;

    let status = handle.status();
    assert!(status.running);
    assert!(status.cycles_run >= 2);
    assert!(handle.is_healthy(morning(), Duration::from_secs(3600)));
    handle.shutdown().await;

    // The lead advanced once; later cycles found nothing due.
    let stored = source.lead(&LeadId::new("a").unwrap()).unwrap();
    assert_eq!(stored.stage, Stage::Contacted);
    assert_eq!(source.applied_updates().len(), 1);
}
