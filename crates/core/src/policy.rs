//! Stage policy table: which template each stage sends and where it leads.
//!
//! The table is data, not code. Deployments load it from JSON; the default
//! reproduces the standard four-touch sequence.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::action::ActionPlan;
use crate::error::{DomainError, DomainResult};
use crate::lead::{Lead, Stage};

/// One row of the stage table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRule {
    pub stage: Stage,
    pub template: String,
    pub next_stage: Stage,
    /// Seconds until the next follow-up after a successful send.
    /// `None` leaves nothing scheduled.
    #[serde(default)]
    pub delay_secs: Option<u64>,
}

impl StageRule {
    fn new(stage: Stage, template: &str, next_stage: Stage, delay_secs: Option<u64>) -> Self {
        Self {
            stage,
            template: template.to_string(),
            next_stage,
            delay_secs,
        }
    }
}

/// Where a lead goes after a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuccessTransition {
    pub next_stage: Stage,
    pub next_action_due: Option<DateTime<Utc>>,
}

/// Where a lead goes after a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureTransition {
    pub stage: Stage,
    pub failure_count: u32,
    pub next_action_due: Option<DateTime<Utc>>,
    /// The failure threshold was reached and the lead moved to review.
    pub escalated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePolicy {
    pub rules: Vec<StageRule>,
    /// Failures after which a lead leaves automation for manual review.
    #[serde(default = "default_review_after_failures")]
    pub review_after_failures: u32,
    /// Delay before a failed lead becomes due again.
    #[serde(default = "default_failure_retry_delay_secs")]
    pub failure_retry_delay_secs: u64,
}

fn default_review_after_failures() -> u32 {
    3
}

fn default_failure_retry_delay_secs() -> u64 {
    6 * 60 * 60
}

const DAY: u64 = 24 * 60 * 60;

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            rules: vec![
                StageRule::new(Stage::New, "intro", Stage::Contacted, Some(2 * DAY)),
                StageRule::new(Stage::Contacted, "follow-up-1", Stage::FollowUp1, Some(3 * DAY)),
                StageRule::new(Stage::FollowUp1, "follow-up-2", Stage::FollowUp2, Some(7 * DAY)),
                StageRule::new(Stage::FollowUp2, "final", Stage::Closed, None),
            ],
            review_after_failures: default_review_after_failures(),
            failure_retry_delay_secs: default_failure_retry_delay_secs(),
        }
    }
}

impl StagePolicy {
    /// Parse and validate a policy table from JSON.
    pub fn from_json(raw: &str) -> DomainResult<Self> {
        let policy: StagePolicy = serde_json::from_str(raw)
            .map_err(|e| DomainError::invalid_policy(format!("malformed table: {e}")))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.review_after_failures == 0 {
            return Err(DomainError::invalid_policy(
                "review_after_failures must be at least 1",
            ));
        }

        let mut seen = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            if rule.stage.is_terminal() {
                return Err(DomainError::invalid_policy(format!(
                    "stage {} is terminal and cannot send",
                    rule.stage
                )));
            }
            if seen.contains(&rule.stage) {
                return Err(DomainError::invalid_policy(format!(
                    "stage {} has more than one rule",
                    rule.stage
                )));
            }
            if rule.next_stage <= rule.stage {
                return Err(DomainError::invalid_policy(format!(
                    "stage {} must advance, got {}",
                    rule.stage, rule.next_stage
                )));
            }
            if rule.template.trim().is_empty() {
                return Err(DomainError::invalid_policy(format!(
                    "stage {} has an empty template",
                    rule.stage
                )));
            }
            seen.push(rule.stage);
        }
        Ok(())
    }

    pub fn rule_for(&self, stage: Stage) -> Option<&StageRule> {
        self.rules.iter().find(|r| r.stage == stage)
    }

    /// Actions for a lead, or `None` when its stage sends nothing.
    pub fn plan(&self, lead: &Lead) -> Option<ActionPlan> {
        if lead.stage.is_terminal() {
            return None;
        }
        self.rule_for(lead.stage)
            .map(|rule| ActionPlan::for_lead(lead, &rule.template))
    }

    pub fn on_success(&self, lead: &Lead, now: DateTime<Utc>) -> SuccessTransition {
        match self.rule_for(lead.stage) {
            Some(rule) => {
                let next_action_due = if rule.next_stage.is_terminal() {
                    None
                } else {
                    rule.delay_secs.map(|secs| after(now, secs))
                };
                SuccessTransition {
                    next_stage: rule.next_stage,
                    next_action_due,
                }
            }
            None => SuccessTransition {
                next_stage: lead.stage,
                next_action_due: None,
            },
        }
    }

    pub fn on_failure(&self, lead: &Lead, now: DateTime<Utc>) -> FailureTransition {
        let failure_count = lead.failure_count.saturating_add(1);
        if failure_count >= self.review_after_failures {
            return FailureTransition {
                stage: Stage::NeedsReview,
                failure_count,
                next_action_due: None,
                escalated: true,
            };
        }
        FailureTransition {
            stage: lead.stage,
            failure_count,
            next_action_due: Some(after(now, self.failure_retry_delay_secs)),
            escalated: false,
        }
    }
}

/// Upper bound on any configured delay (about 100 years).
const MAX_DELAY_SECS: u64 = 100 * 365 * DAY;

fn after(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    let secs = secs.min(MAX_DELAY_SECS) as i64;
    now.checked_add_signed(Duration::seconds(secs))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
