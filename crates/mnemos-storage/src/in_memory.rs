use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use mnemos_core::{
    ArchivedTranscript, CommitmentStatus, ContextSnapshot, EntryUpdate, MemoryBackend, MemoryEntry,
    MemoryError, MemoryFilter, Result, ScoredEntry, SearchQuery, rank_entries,
};

/// Process-local backend. Clones share state.
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<RwLock<Inner>>,
    healthy: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
    searches: Arc<AtomicUsize>,
    name: String,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, MemoryEntry>,
    snapshots: HashMap<String, ContextSnapshot>,
    transcripts: Vec<ArchivedTranscript>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::named("in-memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            healthy: Arc::new(AtomicBool::new(true)),
            latency_ms: Arc::new(AtomicU64::new(0)),
            searches: Arc::new(AtomicUsize::new(0)),
            name: name.into(),
        }
    }

    /// Make every call fail with a backend error until set back.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Delay every search by `latency_ms`.
    pub fn set_latency(&self, latency_ms: u64) {
        self.latency_ms.store(latency_ms, Ordering::SeqCst);
    }

    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot_count(&self) -> usize {
        self.inner.read().snapshots.len()
    }

    pub fn transcript_count(&self) -> usize {
        self.inner.read().transcripts.len()
    }

    fn ensure_healthy(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MemoryError::Backend(format!("{} is unavailable", self.name)))
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, entry: MemoryEntry) -> Result<MemoryEntry> {
        self.ensure_healthy()?;
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&entry.id) {
            return Err(MemoryError::Backend(format!("duplicate id {}", entry.id)));
        }
        inner.entries.insert(entry.id.clone(), entry.clone());
        Ok(entry)
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        self.ensure_healthy()?;
        Ok(self.inner.read().entries.get(id).cloned())
    }

    async fn search(
        &self,
        query: &SearchQuery,
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let latency_ms = self.latency_ms.load(Ordering::SeqCst);
        if latency_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(latency_ms)).await;
        }
        self.ensure_healthy()?;

        let candidates: Vec<MemoryEntry> = self
            .inner
            .read()
            .entries
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        Ok(rank_entries(query, candidates, limit))
    }

    async fn update(&self, id: &str, update: EntryUpdate) -> Result<MemoryEntry> {
        self.ensure_healthy()?;
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        update.apply_to(entry);
        Ok(entry.clone())
    }

    async fn mark_superseded(
        &self,
        id: &str,
        successor_id: &str,
        valid_until: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.ensure_healthy()?;
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        if entry.superseded_by.is_some() {
            return Ok(false);
        }
        entry.superseded_by = Some(successor_id.to_string());
        if valid_until.is_some() {
            entry.valid_until = valid_until;
        }
        Ok(true)
    }

    async fn release_superseded(&self, id: &str, successor_id: &str) -> Result<bool> {
        self.ensure_healthy()?;
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        if entry.superseded_by.as_deref() != Some(successor_id) {
            return Ok(false);
        }
        entry.superseded_by = None;
        Ok(true)
    }

    async fn transition_commitment(&self, id: &str, to: CommitmentStatus) -> Result<MemoryEntry> {
        self.ensure_healthy()?;
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        entry.transition_commitment(to)?;
        Ok(entry.clone())
    }

    async fn list(&self, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>> {
        self.ensure_healthy()?;
        let mut entries: Vec<MemoryEntry> = self
            .inner
            .read()
            .entries
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    async fn owners(&self) -> Result<Vec<String>> {
        self.ensure_healthy()?;
        let owners: HashSet<String> = self
            .inner
            .read()
            .entries
            .values()
            .map(|e| e.owner_id.clone())
            .collect();
        let mut owners: Vec<String> = owners.into_iter().collect();
        owners.sort();
        Ok(owners)
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_healthy()
    }

    async fn save_snapshot(&self, snapshot: ContextSnapshot) -> Result<()> {
        self.ensure_healthy()?;
        self.inner
            .write()
            .snapshots
            .insert(snapshot.id.clone(), snapshot);
        Ok(())
    }

    async fn latest_snapshot(&self, owner_id: &str) -> Result<Option<ContextSnapshot>> {
        self.ensure_healthy()?;
        Ok(self
            .inner
            .read()
            .snapshots
            .values()
            .filter(|s| s.owner_id == owner_id)
            .max_by_key(|s| s.captured_at)
            .cloned())
    }

    async fn mark_snapshot_consumed(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.ensure_healthy()?;
        let mut inner = self.inner.write();
        let snapshot = inner
            .snapshots
            .get_mut(id)
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        snapshot.consumed_at.get_or_insert(at);
        Ok(())
    }

    async fn purge_snapshots(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize> {
        self.ensure_healthy()?;
        let mut inner = self.inner.write();
        let before = inner.snapshots.len();
        inner.snapshots.retain(|_, s| match s.expires_at {
            Some(at) => at > now,
            None => s.captured_at + retention > now,
        });
        Ok(before - inner.snapshots.len())
    }

    async fn archive_transcript(&self, transcript: ArchivedTranscript) -> Result<()> {
        self.ensure_healthy()?;
        let mut inner = self.inner.write();
        inner
            .transcripts
            .retain(|t| t.transcript_ref != transcript.transcript_ref);
        inner.transcripts.push(transcript);
        Ok(())
    }

    async fn purge_transcripts(&self, archived_before: DateTime<Utc>) -> Result<usize> {
        self.ensure_healthy()?;
        let mut inner = self.inner.write();
        let before = inner.transcripts.len();
        inner.transcripts.retain(|t| t.archived_at >= archived_before);
        Ok(before - inner.transcripts.len())
    }
}
