use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use leadflow_core::{Action, Lead};

use crate::ports::{CommunicationProvider, Delivery, ProviderError};

/// Provider that logs each message instead of sending it.
#[derive(Debug, Default)]
pub struct DryRunProvider {
    sent: AtomicU64,
}

impl DryRunProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CommunicationProvider for DryRunProvider {
    async fn send(&self, lead: &Lead, action: &Action) -> Result<Delivery, ProviderError> {
        let message_id = Uuid::now_v7().to_string();
        info!(
            lead_id = %lead.id,
            kind = %action.kind,
            to = %action.address,
            template = %action.template,
            message_id = %message_id,
            "dry run: message not sent"
        );
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(Delivery {
            kind: action.kind,
            message_id,
        })
    }
}
