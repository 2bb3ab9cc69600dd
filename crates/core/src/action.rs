//! Outreach actions selected for a lead.

use serde::{Deserialize, Serialize};

use crate::lead::{Lead, Stage};

/// Delivery mechanism of a single action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Email,
    Sms,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Email => "email",
            ActionKind::Sms => "sms",
        }
    }
}

impl core::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message to send through a communication provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    /// Resolved recipient (email address or phone number).
    pub address: String,
    /// Message template chosen by the stage table.
    pub template: String,
    /// Stage the lead was in when the action was chosen.
    pub stage: Stage,
}

/// The actions chosen for one lead in one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionPlan {
    pub actions: Vec<Action>,
}

impl ActionPlan {
    /// Build the plan for `lead` from its channel preference.
    ///
    /// Channels without a usable address are dropped, so the plan may be empty.
    pub fn for_lead(lead: &Lead, template: &str) -> Self {
        let actions = lead
            .channel
            .kinds()
            .iter()
            .filter_map(|kind| {
                lead.address_for(*kind).map(|address| Action {
                    kind: *kind,
                    address: address.to_string(),
                    template: template.to_string(),
                    stage: lead.stage,
                })
            })
            .collect();
        Self { actions }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }
}
