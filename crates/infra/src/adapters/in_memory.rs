use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use leadflow_core::{Lead, LeadId, StatusUpdate, UpdateKey};

use crate::ports::{LeadSource, PersistenceError};

#[derive(Debug, Default)]
struct Records {
    leads: BTreeMap<LeadId, Lead>,
    applied: HashSet<UpdateKey>,
    writes: Vec<Vec<StatusUpdate>>,
}

/// Lead source held entirely in memory.
///
/// Replayed updates (same lead and cycle) are ignored. Failures can be
/// injected for the next N fetches or writes.
#[derive(Debug, Default)]
pub struct InMemoryLeadSource {
    records: Mutex<Records>,
    stage_changes: AtomicUsize,
    fail_fetches: AtomicU32,
    fail_writes: AtomicU32,
}

impl InMemoryLeadSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_leads(leads: impl IntoIterator<Item = Lead>) -> Self {
        let source = Self::new();
        for lead in leads {
            source.upsert(lead);
        }
        source
    }

    fn records(&self) -> std::sync::MutexGuard<'_, Records> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn upsert(&self, lead: Lead) {
        self.records().leads.insert(lead.id.clone(), lead);
    }

    pub fn lead(&self, id: &LeadId) -> Option<Lead> {
        self.records().leads.get(id).cloned()
    }

    /// Every accepted `apply_batch` call, in order.
    pub fn writes(&self) -> Vec<Vec<StatusUpdate>> {
        self.records().writes.clone()
    }

    /// All updates accepted so far, flattened.
    pub fn applied_updates(&self) -> Vec<StatusUpdate> {
        self.records().writes.iter().flatten().cloned().collect()
    }

    /// Number of writes that moved a lead to a different stage.
    pub fn stage_changes(&self) -> usize {
        self.stage_changes.load(Ordering::SeqCst)
    }

    pub fn fail_next_fetches(&self, n: u32) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl LeadSource for InMemoryLeadSource {
    async fn fetch_due(&self, before: DateTime<Utc>) -> Result<Vec<Lead>, PersistenceError> {
        if take_failure(&self.fail_fetches) {
            return Err(PersistenceError::Unavailable("injected fetch failure".into()));
        }
        Ok(self
            .records()
            .leads
            .values()
            .filter(|lead| lead.is_due(before))
            .cloned()
            .collect())
    }

    async fn apply_batch(&self, updates: &[StatusUpdate]) -> Result<(), PersistenceError> {
        if take_failure(&self.fail_writes) {
            return Err(PersistenceError::Unavailable("injected write failure".into()));
        }

        let mut records = self.records();
        let mut changed = 0;
        for update in updates {
            if !records.applied.insert(update.key()) {
                debug!(lead_id = %update.lead_id, cycle_id = %update.cycle_id, "update already applied");
                continue;
            }
            match records.leads.get_mut(&update.lead_id) {
                Some(lead) => {
                    if lead.apply(update) {
                        changed += 1;
                    }
                }
                None => warn!(lead_id = %update.lead_id, "update for unknown lead ignored"),
            }
        }
        records.writes.push(updates.to_vec());
        self.stage_changes.fetch_add(changed, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use leadflow_core::{Channel, CycleId, Stage, StagePolicy};

    fn lead(id: &str, due: DateTime<Utc>) -> Lead {
        Lead::new(LeadId::new(id).unwrap(), "L", Channel::Email, due).with_email("l@example.com")
    }

    #[tokio::test]
    async fn fetches_only_due_leads() {
        let now = Utc::now();
        let source = InMemoryLeadSource::with_leads([
            lead("a", now - Duration::minutes(1)),
            lead("b", now + Duration::hours(1)),
        ]);
        let due = source.fetch_due(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id.as_str(), "a");
    }

    #[tokio::test]
    async fn replayed_updates_change_nothing() {
        let now = Utc::now();
        let l = lead("a", now);
        let source = InMemoryLeadSource::with_leads([l.clone()]);
        let transition = StagePolicy::default().on_success(&l, now);
        let update = StatusUpdate::success(&l, CycleId::new(), transition, 1, now);

        source.apply_batch(std::slice::from_ref(&update)).await.unwrap();
        source.apply_batch(&[update]).await.unwrap();

        assert_eq!(source.stage_changes(), 1);
        assert_eq!(source.lead(&l.id).unwrap().stage, Stage::Contacted);
        assert_eq!(source.lead(&l.id).unwrap().sent_count, 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let source = InMemoryLeadSource::new();
        source.fail_next_fetches(1);
        assert!(source.fetch_due(Utc::now()).await.is_err());
        assert!(source.fetch_due(Utc::now()).await.is_ok());
    }
}
