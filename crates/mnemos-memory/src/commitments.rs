//! Commitment lifecycle and due-date surfacing

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use mnemos_core::{CommitmentStatus, EntryType, MemoryBackend, MemoryEntry, MemoryFilter, Result};

pub struct CommitmentTracker {
    backend: Arc<dyn MemoryBackend>,
}

impl CommitmentTracker {
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        Self { backend }
    }

    pub async fn create(
        &self,
        owner_id: &str,
        content: &str,
        target_person: Option<String>,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<MemoryEntry> {
        let entry = MemoryEntry::commitment(owner_id, content, target_person, due_at);
        let stored = self.backend.add(entry).await?;
        info!("[commitments] created {} for {}", stored.id, owner_id);
        Ok(stored)
    }

    pub async fn complete(&self, id: &str) -> Result<MemoryEntry> {
        self.transition(id, CommitmentStatus::Completed).await
    }

    pub async fn cancel(&self, id: &str) -> Result<MemoryEntry> {
        self.transition(id, CommitmentStatus::Cancelled).await
    }

    async fn transition(&self, id: &str, to: CommitmentStatus) -> Result<MemoryEntry> {
        let updated = self.backend.transition_commitment(id, to).await?;
        info!("[commitments] {} -> {}", id, to.as_str());
        Ok(updated)
    }

    /// Active, current commitments due before `now + window`, past-due
    /// included, soonest first. Undated commitments are not returned.
    pub async fn due_within(
        &self,
        owner_id: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<MemoryEntry>> {
        let horizon = now + window;
        let filter = MemoryFilter::owner(owner_id)
            .current()
            .with_types(vec![EntryType::Commitment]);
        let mut due: Vec<(DateTime<Utc>, MemoryEntry)> = self
            .backend
            .list(&filter)
            .await?
            .into_iter()
            .filter(|e| e.is_active_commitment())
            .filter_map(|e| {
                let at = e.commitment.as_ref().and_then(|c| c.due_at)?;
                (at <= horizon).then_some((at, e))
            })
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        Ok(due.into_iter().map(|(_, e)| e).collect())
    }
}
