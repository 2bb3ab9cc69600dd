use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::ports::{Alert, AlertNotifier, AlertSeverity};

/// Notifier that writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn alert(&self, alert: Alert) {
        let cycle_id = alert.cycle_id.map(|c| c.to_string()).unwrap_or_default();
        let context = alert
            .context
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_default();
        match alert.severity {
            AlertSeverity::Info => {
                info!(alert = %alert.title, cycle_id = %cycle_id, context = %context, "{}", alert.detail)
            }
            AlertSeverity::Warning => {
                warn!(alert = %alert.title, cycle_id = %cycle_id, "{}", alert.detail)
            }
            AlertSeverity::Critical => {
                error!(alert = %alert.title, cycle_id = %cycle_id, "{}", alert.detail)
            }
        }
    }
}
