//! Per-lead status updates produced by task units.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{CycleId, LeadId};
use crate::lead::{Lead, Stage};
use crate::policy::{FailureTransition, SuccessTransition};

/// How a task unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Success,
    TransientFailure,
    TerminalFailure,
    /// Abandoned by the cycle deadline.
    TimedOut,
    /// Not due; nothing changed.
    Skipped,
    /// Due but outside the contact window; rescheduled.
    Deferred,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::TransientFailure | Outcome::TerminalFailure | Outcome::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::TransientFailure => "transient-failure",
            Outcome::TerminalFailure => "terminal-failure",
            Outcome::TimedOut => "timed-out",
            Outcome::Skipped => "skipped",
            Outcome::Deferred => "deferred",
        }
    }
}

impl core::fmt::Display for Outcome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idempotency key of a [`StatusUpdate`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UpdateKey {
    pub lead_id: LeadId,
    pub cycle_id: CycleId,
}

/// Result contract of one task unit.
///
/// All status fields are absolute values, not deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub lead_id: LeadId,
    pub cycle_id: CycleId,
    pub outcome: Outcome,
    pub previous_stage: Stage,
    pub stage: Stage,
    pub last_contacted_at: Option<DateTime<Utc>>,
    pub next_action_due: Option<DateTime<Utc>>,
    pub sent_count: u32,
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl StatusUpdate {
    /// Update that leaves every status field as the snapshot had it.
    fn unchanged(lead: &Lead, cycle_id: CycleId, outcome: Outcome, now: DateTime<Utc>) -> Self {
        Self {
            lead_id: lead.id.clone(),
            cycle_id,
            outcome,
            previous_stage: lead.stage,
            stage: lead.stage,
            last_contacted_at: lead.last_contacted_at,
            next_action_due: lead.next_action_due,
            sent_count: lead.sent_count,
            failure_count: lead.failure_count,
            error: None,
            recorded_at: now,
        }
    }

    pub fn success(
        lead: &Lead,
        cycle_id: CycleId,
        transition: SuccessTransition,
        delivered: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            stage: transition.next_stage,
            last_contacted_at: Some(now),
            next_action_due: transition.next_action_due,
            sent_count: lead.sent_count.saturating_add(delivered),
            ..Self::unchanged(lead, cycle_id, Outcome::Success, now)
        }
    }

    /// Failed attempt: the stage only moves when the policy escalates.
    pub fn failed(
        lead: &Lead,
        cycle_id: CycleId,
        outcome: Outcome,
        transition: FailureTransition,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            stage: transition.stage,
            next_action_due: transition.next_action_due,
            failure_count: transition.failure_count,
            error: Some(error.into()),
            ..Self::unchanged(lead, cycle_id, outcome, now)
        }
    }

    pub fn skipped(lead: &Lead, cycle_id: CycleId, now: DateTime<Utc>) -> Self {
        Self::unchanged(lead, cycle_id, Outcome::Skipped, now)
    }

    /// Skipped for good: the stage has no outreach, so the lead stops
    /// coming back as due.
    pub fn unscheduled(lead: &Lead, cycle_id: CycleId, now: DateTime<Utc>) -> Self {
        Self {
            next_action_due: None,
            ..Self::unchanged(lead, cycle_id, Outcome::Skipped, now)
        }
    }

    pub fn deferred(
        lead: &Lead,
        cycle_id: CycleId,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            next_action_due: Some(until),
            ..Self::unchanged(lead, cycle_id, Outcome::Deferred, now)
        }
    }

    pub fn key(&self) -> UpdateKey {
        UpdateKey {
            lead_id: self.lead_id.clone(),
            cycle_id: self.cycle_id,
        }
    }
}
