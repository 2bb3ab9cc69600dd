//! Lead snapshot model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::ActionKind;
use crate::id::LeadId;
use crate::update::StatusUpdate;

/// Follow-up stage of a lead.
///
/// The declaration order is the pipeline order; `NeedsReview` sorts last and
/// is reached only through repeated failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "new")]
    New,
    #[serde(rename = "contacted")]
    Contacted,
    #[serde(rename = "follow-up-1")]
    FollowUp1,
    #[serde(rename = "follow-up-2")]
    FollowUp2,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "needs-review")]
    NeedsReview,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::New,
        Stage::Contacted,
        Stage::FollowUp1,
        Stage::FollowUp2,
        Stage::Closed,
        Stage::NeedsReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::New => "new",
            Stage::Contacted => "contacted",
            Stage::FollowUp1 => "follow-up-1",
            Stage::FollowUp2 => "follow-up-2",
            Stage::Closed => "closed",
            Stage::NeedsReview => "needs-review",
        }
    }

    /// Stages that never produce automated outreach.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Closed | Stage::NeedsReview)
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contact channel preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Both,
}

impl Channel {
    /// Delivery kinds this preference fans out to, in send order.
    pub fn kinds(&self) -> &'static [ActionKind] {
        match self {
            Channel::Email => &[ActionKind::Email],
            Channel::Sms => &[ActionKind::Sms],
            Channel::Both => &[ActionKind::Email, ActionKind::Sms],
        }
    }
}

/// Immutable per-cycle snapshot of a lead record.
///
/// The persistence layer owns the record. The core only reads snapshots and
/// expresses every change as a [`StatusUpdate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    pub stage: Stage,
    pub channel: Channel,
    #[serde(default)]
    pub last_contacted_at: Option<DateTime<Utc>>,
    /// When the next follow-up is due; `None` means nothing is scheduled.
    #[serde(default)]
    pub next_action_due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent_count: u32,
    #[serde(default)]
    pub failure_count: u32,
}

impl Lead {
    /// A brand-new lead, due at `due`.
    pub fn new(id: LeadId, name: impl Into<String>, channel: Channel, due: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            email: None,
            phone: None,
            stage: Stage::New,
            channel,
            last_contacted_at: None,
            next_action_due: Some(due),
            sent_count: 0,
            failure_count: 0,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    /// Address for a delivery kind, if the lead has one.
    pub fn address_for(&self, kind: ActionKind) -> Option<&str> {
        let value = match kind {
            ActionKind::Email => self.email.as_deref(),
            ActionKind::Sms => self.phone.as_deref(),
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }

    /// A lead is due once its next-action timestamp has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_action_due {
            Some(due) => now >= due,
            None => false,
        }
    }

    /// Overwrite the mutable status fields from an update.
    ///
    /// Updates carry absolute values, so applying the same update twice leaves
    /// the record unchanged. Returns `true` when the stage changed.
    pub fn apply(&mut self, update: &StatusUpdate) -> bool {
        let stage_changed = self.stage != update.stage;
        self.stage = update.stage;
        self.last_contacted_at = update.last_contacted_at;
        self.next_action_due = update.next_action_due;
        self.sent_count = update.sent_count;
        self.failure_count = update.failure_count;
        stage_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn lead() -> Lead {
        let due = Utc.with_ymd_and_hms(2024, 3, 20, 9, 0, 0).unwrap();
        Lead::new(LeadId::new("lead-1").unwrap(), "Ada", Channel::Email, due)
    }

    #[test]
    fn due_once_timestamp_has_passed() {
        let lead = lead();
        let due = lead.next_action_due.unwrap();
        assert!(!lead.is_due(due - Duration::seconds(1)));
        assert!(lead.is_due(due));
        assert!(lead.is_due(due + Duration::hours(5)));
    }

    #[test]
    fn unscheduled_lead_is_never_due() {
        let mut lead = lead();
        lead.next_action_due = None;
        assert!(!lead.is_due(Utc::now()));
    }

    #[test]
    fn blank_addresses_are_unreachable() {
        let lead = lead().with_email("  ").with_phone("+15550100");
        assert_eq!(lead.address_for(ActionKind::Email), None);
        assert_eq!(lead.address_for(ActionKind::Sms), Some("+15550100"));
    }

    #[test]
    fn stage_order_follows_the_pipeline() {
        assert!(Stage::New < Stage::Contacted);
        assert!(Stage::FollowUp1 < Stage::FollowUp2);
        assert!(Stage::FollowUp2 < Stage::Closed);
        assert!(Stage::Closed.is_terminal());
        assert!(!Stage::FollowUp1.is_terminal());
    }

    #[test]
    fn stage_serializes_with_kebab_names() {
        let json = serde_json::to_string(&Stage::FollowUp1).unwrap();
        assert_eq!(json, "\"follow-up-1\"");
        let back: Stage = serde_json::from_str("\"needs-review\"").unwrap();
        assert_eq!(back, Stage::NeedsReview);
    }
}
