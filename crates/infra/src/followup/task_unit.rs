//! Per-lead decide-and-dispatch unit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use leadflow_core::{ContactWindow, CycleId, Lead, Outcome, StagePolicy, StatusUpdate};

use crate::ports::CommunicationProvider;
use crate::retry::{RetryError, RetryPolicy, RetryRunner};

/// One lead's work for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUnit {
    pub cycle_id: CycleId,
    pub lead: Lead,
}

impl TaskUnit {
    pub fn new(cycle_id: CycleId, lead: Lead) -> Self {
        Self { cycle_id, lead }
    }
}

/// Runs task units against a communication provider.
///
/// The executor never touches shared state; everything it decides is in the
/// returned [`StatusUpdate`].
pub struct TaskUnitExecutor<P> {
    provider: Arc<P>,
    policy: Arc<StagePolicy>,
    window: Option<ContactWindow>,
    retry: RetryRunner,
    retry_policy: RetryPolicy,
}

impl<P> Clone for TaskUnitExecutor<P> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            policy: self.policy.clone(),
            window: self.window,
            retry: self.retry.clone(),
            retry_policy: self.retry_policy.clone(),
        }
    }
}

impl<P: CommunicationProvider> TaskUnitExecutor<P> {
    pub fn new(
        provider: Arc<P>,
        policy: Arc<StagePolicy>,
        retry: RetryRunner,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            policy,
            window: None,
            retry,
            retry_policy,
        }
    }

    pub fn with_contact_window(mut self, window: Option<ContactWindow>) -> Self {
        self.window = window;
        self
    }

    pub async fn run(&self, unit: &TaskUnit, now: DateTime<Utc>) -> StatusUpdate {
        let lead = &unit.lead;

        if !lead.is_due(now) {
            debug!(lead_id = %lead.id, cycle_id = %unit.cycle_id, "lead not due, skipping");
            return StatusUpdate::skipped(lead, unit.cycle_id, now);
        }

        let Some(plan) = self.policy.plan(lead) else {
            debug!(lead_id = %lead.id, stage = %lead.stage, "stage has no outreach, unscheduling");
            return StatusUpdate::unscheduled(lead, unit.cycle_id, now);
        };

        if let Some(window) = self.window.filter(|w| !w.contains(now)) {
            let until = window.next_open(now);
            debug!(lead_id = %lead.id, until = %until, "outside contact window, deferring");
            return StatusUpdate::deferred(lead, unit.cycle_id, until, now);
        }

        if plan.is_empty() {
            warn!(lead_id = %lead.id, channel = ?lead.channel, "no reachable contact");
            return self.failed(unit, Outcome::TerminalFailure, "no reachable contact", now);
        }

        let mut delivered = 0u32;
        let mut errors = Vec::new();
        let mut any_terminal = false;

        for action in &plan.actions {
            let op_name = format!("send_{}", action.kind);
            let result = self
                .retry
                .execute(&op_name, &self.retry_policy, || {
                    self.provider.send(lead, action)
                })
                .await;

            match result {
                Ok(delivery) => {
                    debug!(
                        lead_id = %lead.id,
                        kind = %delivery.kind,
                        message_id = %delivery.message_id,
                        "follow-up delivered"
                    );
                    delivered += 1;
                }
                Err(e) => {
                    any_terminal |= matches!(e, RetryError::Terminal { .. });
                    errors.push(format!("{}: {}", action.kind, e));
                }
            }
        }

        if delivered > 0 {
            if !errors.is_empty() {
                warn!(lead_id = %lead.id, errors = ?errors, "partial delivery");
            }
            let transition = self.policy.on_success(lead, now);
            return StatusUpdate::success(lead, unit.cycle_id, transition, delivered, now);
        }

        let outcome = if any_terminal {
            Outcome::TerminalFailure
        } else {
            Outcome::TransientFailure
        };
        self.failed(unit, outcome, errors.join("; "), now)
    }

    /// Failure update for a unit, with the stage policy's escalation applied.
    pub fn failed(
        &self,
        unit: &TaskUnit,
        outcome: Outcome,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> StatusUpdate {
        let transition = self.policy.on_failure(&unit.lead, now);
        if transition.escalated {
            warn!(
                lead_id = %unit.lead.id,
                failures = transition.failure_count,
                "lead escalated to review"
            );
        }
        StatusUpdate::failed(&unit.lead, unit.cycle_id, outcome, transition, error, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::QueueMetrics;
    use crate::ports::{Delivery, ProviderError};
    use crate::store::InMemoryCounterStore;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use leadflow_core::{Action, ActionKind, Channel, LeadId, Stage};
    use std::sync::Mutex;

    /// Provider scripted per delivery kind.
    #[derive(Default)]
    struct ScriptedProvider {
        email: Option<ProviderError>,
        sms: Option<ProviderError>,
        sent: Mutex<Vec<(ActionKind, String)>>,
    }

    #[async_trait]
    impl CommunicationProvider for ScriptedProvider {
        async fn send(&self, _lead: &Lead, action: &Action) -> Result<Delivery, ProviderError> {
            let scripted = match action.kind {
                ActionKind::Email => self.email.clone(),
                ActionKind::Sms => self.sms.clone(),
            };
            if let Some(e) = scripted {
                return Err(e);
            }
            self.sent
                .lock()
                .unwrap()
                .push((action.kind, action.template.clone()));
            Ok(Delivery {
                kind: action.kind,
                message_id: "msg-1".into(),
            })
        }
    }

    fn now() -> DateTime<Utc> {
        // Wednesday, inside business hours.
        Utc.with_ymd_and_hms(2024, 3, 20, 10, 0, 0).unwrap()
    }

    fn unit(channel: Channel) -> TaskUnit {
        let lead = Lead::new(
            LeadId::new("lead-1").unwrap(),
            "Ada",
            channel,
            now() - Duration::minutes(5),
        )
        .with_email("ada@example.com")
        .with_phone("+15550100");
        TaskUnit::new(CycleId::new(), lead)
    }

    fn executor(provider: ScriptedProvider) -> (TaskUnitExecutor<ScriptedProvider>, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let retry = RetryRunner::new(QueueMetrics::new(InMemoryCounterStore::arc()));
        let policy = RetryPolicy::fixed(2, std::time::Duration::from_millis(10));
        (
            TaskUnitExecutor::new(provider.clone(), Arc::new(StagePolicy::default()), retry, policy),
            provider,
        )
    }

    #[tokio::test]
    async fn due_lead_is_contacted_and_advanced() {
        let (executor, provider) = executor(ScriptedProvider::default());
        let update = executor.run(&unit(Channel::Email), now()).await;

        assert_eq!(update.outcome, Outcome::Success);
        assert_eq!(update.stage, Stage::Contacted);
        assert_eq!(update.sent_count, 1);
        assert_eq!(update.next_action_due, Some(now() + Duration::days(2)));
        assert_eq!(
            provider.sent.lock().unwrap().as_slice(),
            &[(ActionKind::Email, "intro".to_string())]
        );
    }

    #[tokio::test]
    async fn lead_not_yet_due_is_skipped() {
        let (executor, provider) = executor(ScriptedProvider::default());
        let mut unit = unit(Channel::Email);
        unit.lead.next_action_due = Some(now() + Duration::hours(1));

        let update = executor.run(&unit, now()).await;
        assert_eq!(update.outcome, Outcome::Skipped);
        assert_eq!(update.stage, Stage::New);
        assert!(provider.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_lead_with_a_stale_due_time_is_unscheduled() {
        let (executor, provider) = executor(ScriptedProvider::default());
        let mut unit = unit(Channel::Email);
        unit.lead = unit.lead.with_stage(Stage::Closed);

        let update = executor.run(&unit, now()).await;
        assert_eq!(update.outcome, Outcome::Skipped);
        assert_eq!(update.stage, Stage::Closed);
        assert_eq!(update.next_action_due, None);
        assert!(provider.sent.lock().unwrap().is_empty());

        unit.lead.apply(&update);
        assert!(!unit.lead.is_due(now()));
    }

    #[tokio::test]
    async fn one_delivered_channel_is_enough() {
        let (executor, _provider) = executor(ScriptedProvider {
            sms: Some(ProviderError::Terminal("bad number".into())),
            ..Default::default()
        });
        let update = executor.run(&unit(Channel::Both), now()).await;

        assert_eq!(update.outcome, Outcome::Success);
        assert_eq!(update.sent_count, 1);
    }

    #[tokio::test]
    async fn terminal_provider_failure_keeps_stage() {
        let (executor, _provider) = executor(ScriptedProvider {
            email: Some(ProviderError::Terminal("mailbox does not exist".into())),
            ..Default::default()
        });
        let update = executor.run(&unit(Channel::Email), now()).await;

        assert_eq!(update.outcome, Outcome::TerminalFailure);
        assert_eq!(update.stage, Stage::New);
        assert_eq!(update.failure_count, 1);
        assert!(update.error.unwrap().contains("mailbox does not exist"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transient_failure_is_reported_as_transient() {
        let (executor, _provider) = executor(ScriptedProvider {
            email: Some(ProviderError::Transient("503".into())),
            ..Default::default()
        });
        let update = executor.run(&unit(Channel::Email), now()).await;
        assert_eq!(update.outcome, Outcome::TransientFailure);
    }

    #[tokio::test]
    async fn missing_contact_details_fail_terminally() {
        let (executor, provider) = executor(ScriptedProvider::default());
        let mut unit = unit(Channel::Sms);
        unit.lead.phone = None;

        let update = executor.run(&unit, now()).await;
        assert_eq!(update.outcome, Outcome::TerminalFailure);
        assert_eq!(update.error.as_deref(), Some("no reachable contact"));
        assert!(provider.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn outside_contact_window_is_deferred() {
        let (executor, provider) = executor(ScriptedProvider::default());
        let executor = executor.with_contact_window(Some(ContactWindow::default()));
        let evening = Utc.with_ymd_and_hms(2024, 3, 20, 20, 0, 0).unwrap();
        let mut unit = unit(Channel::Email);
        unit.lead.next_action_due = Some(evening - Duration::minutes(1));

        let update = executor.run(&unit, evening).await;
        assert_eq!(update.outcome, Outcome::Deferred);
        assert_eq!(
            update.next_action_due,
            Some(Utc.with_ymd_and_hms(2024, 3, 21, 9, 0, 0).unwrap())
        );
        assert!(provider.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_failures_escalate_to_review() {
        let (executor, _provider) = executor(ScriptedProvider {
            email: Some(ProviderError::Terminal("rejected".into())),
            ..Default::default()
        });
        let mut unit = unit(Channel::Email);
        unit.lead.failure_count = 2;

        let update = executor.run(&unit, now()).await;
        assert_eq!(update.stage, Stage::NeedsReview);
        assert_eq!(update.next_action_due, None);
    }
}
