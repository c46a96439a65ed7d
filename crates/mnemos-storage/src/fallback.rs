//! Health-aware routing between a primary backend and a degraded local one

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use mnemos_core::{
    ArchivedTranscript, CommitmentStatus, ContextSnapshot, EntryUpdate, MemoryBackend, MemoryEntry,
    MemoryFilter, Result, ScoredEntry, SearchQuery, Turn,
};

/// Sends every call to the primary until it reports itself unavailable, then
/// to the fallback. The primary is retried once `retry_after` has passed.
pub struct FallbackBackend {
    primary: Arc<dyn MemoryBackend>,
    fallback: Arc<dyn MemoryBackend>,
    degraded_since: Mutex<Option<DateTime<Utc>>>,
    retry_after: Duration,
}

impl FallbackBackend {
    pub fn new(primary: Arc<dyn MemoryBackend>, fallback: Arc<dyn MemoryBackend>) -> Self {
        Self {
            primary,
            fallback,
            degraded_since: Mutex::new(None),
            retry_after: Duration::seconds(30),
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_since.lock().is_some()
    }

    fn use_primary(&self) -> bool {
        match *self.degraded_since.lock() {
            None => true,
            Some(since) => Utc::now() - since >= self.retry_after,
        }
    }

    fn mark_degraded(&self, op: &str, err: &mnemos_core::MemoryError) {
        let mut degraded = self.degraded_since.lock();
        if degraded.is_none() {
            warn!(
                "[fallback] {} failed on {} ({}); routing to {}",
                op,
                self.primary.name(),
                err,
                self.fallback.name()
            );
        }
        *degraded = Some(Utc::now());
    }

    fn mark_recovered(&self) {
        let mut degraded = self.degraded_since.lock();
        if degraded.take().is_some() {
            info!("[fallback] {} is back", self.primary.name());
        }
    }

    async fn route<T, F, Fut>(&self, op: &str, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn MemoryBackend>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        if self.use_primary() {
            match call(Arc::clone(&self.primary)).await {
                Ok(value) => {
                    self.mark_recovered();
                    return Ok(value);
                }
                Err(e) if e.is_backend_unavailable() => self.mark_degraded(op, &e),
                Err(e) => return Err(e),
            }
        }
        call(Arc::clone(&self.fallback)).await
    }
}

#[async_trait]
impl MemoryBackend for FallbackBackend {
    fn name(&self) -> &str {
        "fallback"
    }

    fn supports_auto_extraction(&self) -> bool {
        !self.is_degraded() && self.primary.supports_auto_extraction()
    }

    async fn auto_extract(&self, owner_id: &str, turn: &Turn) -> Result<Vec<MemoryEntry>> {
        self.primary.auto_extract(owner_id, turn).await
    }

    async fn add(&self, entry: MemoryEntry) -> Result<MemoryEntry> {
        self.route("add", |b| {
            let entry = entry.clone();
            async move { b.add(entry).await }
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        self.route("get", |b| async move { b.get(id).await }).await
    }

    async fn search(
        &self,
        query: &SearchQuery,
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>> {
        self.route("search", |b| async move { b.search(query, filter, limit).await })
            .await
    }

    async fn update(&self, id: &str, update: EntryUpdate) -> Result<MemoryEntry> {
        self.route("update", |b| {
            let update = update.clone();
            async move { b.update(id, update).await }
        })
        .await
    }

    async fn mark_superseded(
        &self,
        id: &str,
        successor_id: &str,
        valid_until: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.route("mark_superseded", |b| async move {
            b.mark_superseded(id, successor_id, valid_until).await
        })
        .await
    }

    async fn release_superseded(&self, id: &str, successor_id: &str) -> Result<bool> {
        self.route("release_superseded", |b| async move {
            b.release_superseded(id, successor_id).await
        })
        .await
    }

    async fn transition_commitment(&self, id: &str, to: CommitmentStatus) -> Result<MemoryEntry> {
        self.route("transition_commitment", |b| async move {
            b.transition_commitment(id, to).await
        })
        .await
    }

    async fn list(&self, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>> {
        self.route("list", |b| async move { b.list(filter).await }).await
    }

    async fn owners(&self) -> Result<Vec<String>> {
        self.route("owners", |b| async move { b.owners().await }).await
    }

    async fn health_check(&self) -> Result<()> {
        match self.primary.health_check().await {
            Ok(()) => {
                self.mark_recovered();
                Ok(())
            }
            Err(e) => {
                self.mark_degraded("health_check", &e);
                self.fallback.health_check().await
            }
        }
    }

    async fn save_snapshot(&self, snapshot: ContextSnapshot) -> Result<()> {
        self.route("save_snapshot", |b| {
            let snapshot = snapshot.clone();
            async move { b.save_snapshot(snapshot).await }
        })
        .await
    }

    async fn latest_snapshot(&self, owner_id: &str) -> Result<Option<ContextSnapshot>> {
        self.route("latest_snapshot", |b| async move { b.latest_snapshot(owner_id).await })
            .await
    }

    async fn mark_snapshot_consumed(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.route("mark_snapshot_consumed", |b| async move {
            b.mark_snapshot_consumed(id, at).await
        })
        .await
    }

    async fn purge_snapshots(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize> {
        self.route("purge_snapshots", |b| async move {
            b.purge_snapshots(now, retention).await
        })
        .await
    }

    async fn archive_transcript(&self, transcript: ArchivedTranscript) -> Result<()> {
        self.route("archive_transcript", |b| {
            let transcript = transcript.clone();
            async move { b.archive_transcript(transcript).await }
        })
        .await
    }

    async fn purge_transcripts(&self, archived_before: DateTime<Utc>) -> Result<usize> {
        self.route("purge_transcripts", |b| async move {
            b.purge_transcripts(archived_before).await
        })
        .await
    }
}
