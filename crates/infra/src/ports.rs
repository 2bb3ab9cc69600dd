//! Contracts for the external collaborators the follow-up engine drives.
//!
//! Lead storage, message transports and alerting all live outside this
//! crate; the engine only sees these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use leadflow_core::{Action, ActionKind, CycleId, Lead, StatusUpdate};

use crate::retry::{Classify, ErrorClass};

/// Communication provider failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Throttling, timeouts, 5xx. Worth retrying.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// Invalid recipient, rejected content. Never retried.
    #[error("terminal provider failure: {0}")]
    Terminal(String),
}

impl Classify for ProviderError {
    fn classify(&self) -> ErrorClass {
        match self {
            ProviderError::Transient(_) => ErrorClass::Transient,
            ProviderError::Terminal(_) => ErrorClass::Terminal,
        }
    }
}

/// Lead source / persistence failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("lead store unavailable: {0}")]
    Unavailable(String),
    #[error("lead store rejected the request: {0}")]
    Rejected(String),
}

impl Classify for PersistenceError {
    fn classify(&self) -> ErrorClass {
        match self {
            PersistenceError::Unavailable(_) => ErrorClass::Transient,
            PersistenceError::Rejected(_) => ErrorClass::Terminal,
        }
    }
}

/// Source of truth for lead records.
#[async_trait]
pub trait LeadSource: Send + Sync {
    /// Leads whose next action is due at or before `before`.
    async fn fetch_due(&self, before: DateTime<Utc>) -> Result<Vec<Lead>, PersistenceError>;

    /// Write status updates.
    ///
    /// Must be idempotent per (lead, cycle): replaying an update that was
    /// already applied changes nothing.
    async fn apply_batch(&self, updates: &[StatusUpdate]) -> Result<(), PersistenceError>;
}

/// Receipt for one delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub kind: ActionKind,
    /// Provider-assigned message id.
    pub message_id: String,
}

/// Outbound email/SMS transport.
#[async_trait]
pub trait CommunicationProvider: Send + Sync {
    async fn send(&self, lead: &Lead, action: &Action) -> Result<Delivery, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub title: String,
    pub detail: String,
    pub cycle_id: Option<CycleId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            detail: detail.into(),
            cycle_id: None,
            context: None,
        }
    }

    pub fn critical(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(AlertSeverity::Critical, title, detail)
    }

    pub fn warning(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(AlertSeverity::Warning, title, detail)
    }

    pub fn info(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(AlertSeverity::Info, title, detail)
    }

    pub fn for_cycle(mut self, cycle_id: CycleId) -> Self {
        self.cycle_id = Some(cycle_id);
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Operator notification channel (chat webhook, pager, log).
///
/// Delivery is best effort; implementations log their own failures.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn alert(&self, alert: Alert);
}
