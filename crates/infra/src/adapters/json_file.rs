use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use leadflow_core::{Lead, StatusUpdate, UpdateKey};

use crate::ports::{LeadSource, PersistenceError};

/// Lead source backed by a JSON array of leads on disk.
///
/// Every write rewrites the whole file; meant for local runs of the worker.
#[derive(Debug)]
pub struct JsonFileLeadSource {
    path: PathBuf,
    applied: Mutex<HashSet<UpdateKey>>,
}

impl JsonFileLeadSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            applied: Mutex::new(HashSet::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<Lead>, PersistenceError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistenceError::Rejected(format!(
                    "{} does not exist",
                    self.path.display()
                )));
            }
            Err(e) => return Err(PersistenceError::Unavailable(e.to_string())),
        };
        serde_json::from_str(&raw).map_err(|e| {
            PersistenceError::Rejected(format!("{}: {e}", self.path.display()))
        })
    }

    async fn store(&self, leads: &[Lead]) -> Result<(), PersistenceError> {
        let raw = serde_json::to_string_pretty(leads)
            .map_err(|e| PersistenceError::Rejected(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl LeadSource for JsonFileLeadSource {
    async fn fetch_due(&self, before: DateTime<Utc>) -> Result<Vec<Lead>, PersistenceError> {
        let leads = self.load().await?;
        Ok(leads.into_iter().filter(|lead| lead.is_due(before)).collect())
    }

    async fn apply_batch(&self, updates: &[StatusUpdate]) -> Result<(), PersistenceError> {
        // Held across the read-modify-write so concurrent chunks do not race.
        let mut applied = self.applied.lock().await;
        let mut leads = self.load().await?;

        let mut changed = 0usize;
        let mut fresh = Vec::new();
        for update in updates {
            let key = update.key();
            if applied.contains(&key) {
                continue;
            }
            if let Some(lead) = leads.iter_mut().find(|lead| lead.id == update.lead_id) {
                lead.apply(update);
                changed += 1;
            } else {
                debug!(lead_id = %update.lead_id, "no such lead in file");
            }
            fresh.push(key);
        }

        if changed > 0 {
            self.store(&leads).await?;
        }
        applied.extend(fresh);
        info!(path = %self.path.display(), updated = changed, "lead file updated");
        Ok(())
    }
}
