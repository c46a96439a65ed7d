//! Memory backend trait
//!
//! Every component above the store talks to memory through [`MemoryBackend`].
//! Backends may be embedded or remote; the contract is the same either way.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chain::link_successor;
use crate::entry::{CommitmentStatus, EntryType, EntryUpdate, MemoryEntry, SOURCE_IDS_KEY, Tier};
use crate::error::{MemoryError, Result};
use crate::job::Turn;
use crate::similarity::score_entry;
use crate::snapshot::{ArchivedTranscript, ContextSnapshot};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub min_score: Option<f32>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            embedding: None,
            min_score: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryFilter {
    pub owner_id: Option<String>,
    pub entry_types: Option<Vec<EntryType>>,
    pub tiers: Option<Vec<Tier>>,
    /// Only entries with no successor.
    pub current_only: bool,
    /// Only entries whose validity window contains this instant.
    pub as_of: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub min_importance: Option<u8>,
}

impl MemoryFilter {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            ..Default::default()
        }
    }

    pub fn current(mut self) -> Self {
        self.current_only = true;
        self
    }

    pub fn with_types(mut self, types: Vec<EntryType>) -> Self {
        self.entry_types = Some(types);
        self
    }

    pub fn with_tiers(mut self, tiers: Vec<Tier>) -> Self {
        self.tiers = Some(tiers);
        self
    }

    pub fn as_of(mut self, at: DateTime<Utc>) -> Self {
        self.as_of = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn min_importance(mut self, importance: u8) -> Self {
        self.min_importance = Some(importance);
        self
    }

    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        if let Some(owner) = &self.owner_id {
            if &entry.owner_id != owner {
                return false;
            }
        }
        if let Some(types) = &self.entry_types {
            if !types.contains(&entry.entry_type) {
                return false;
            }
        }
        if let Some(tiers) = &self.tiers {
            if !tiers.contains(&entry.tier) {
                return false;
            }
        }
        if self.current_only && !entry.is_current() {
            return false;
        }
        if let Some(at) = self.as_of {
            if !entry.valid_at(at) {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if entry.created_at >= before {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if entry.importance < min {
                return false;
            }
        }
        true
    }
}

/// Score, threshold, sort and truncate a candidate set. Shared by backends
/// that search in process.
pub fn rank_entries(
    query: &SearchQuery,
    candidates: impl IntoIterator<Item = MemoryEntry>,
    limit: usize,
) -> Vec<ScoredEntry> {
    let min_score = query.min_score.unwrap_or(f32::MIN);
    let mut scored: Vec<ScoredEntry> = candidates
        .into_iter()
        .map(|entry| {
            let score = score_entry(query, &entry);
            ScoredEntry { entry, score }
        })
        .filter(|s| s.score >= min_score)
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.entry.importance.cmp(&a.entry.importance))
            .then_with(|| a.entry.id.cmp(&b.entry.id))
    });
    scored.truncate(limit);
    scored
}

#[async_trait]
pub trait MemoryBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the backend runs its own extract-and-classify pipeline.
    fn supports_auto_extraction(&self) -> bool {
        false
    }

    /// Hand a whole turn to the backend's own pipeline. Returned entries are
    /// already stored.
    async fn auto_extract(&self, _owner_id: &str, _turn: &Turn) -> Result<Vec<MemoryEntry>> {
        Err(MemoryError::Unsupported(format!(
            "{} does not extract memories itself",
            self.name()
        )))
    }

    async fn add(&self, entry: MemoryEntry) -> Result<MemoryEntry>;

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>>;

    async fn search(
        &self,
        query: &SearchQuery,
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>>;

    async fn update(&self, id: &str, update: EntryUpdate) -> Result<MemoryEntry>;

    /// Conditional write: set `superseded_by` (and `valid_until` when given)
    /// only if the entry currently has no successor. Returns whether the
    /// write happened. Missing entries are an error.
    async fn mark_superseded(
        &self,
        id: &str,
        successor_id: &str,
        valid_until: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Undo a link written by [`mark_superseded`](Self::mark_superseded):
    /// clear `superseded_by` only while it still points at `successor_id`.
    /// `valid_until` is left as is.
    async fn release_superseded(&self, id: &str, successor_id: &str) -> Result<bool>;

    /// Conditional write: move an active commitment to `to`. Fails with
    /// `InvalidTransition` when the entry is not a commitment or is no longer
    /// active at the moment of the write.
    async fn transition_commitment(&self, id: &str, to: CommitmentStatus) -> Result<MemoryEntry>;

    async fn list(&self, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>>;

    /// Owners that have at least one entry.
    async fn owners(&self) -> Result<Vec<String>>;

    async fn health_check(&self) -> Result<()>;

    async fn save_snapshot(&self, snapshot: ContextSnapshot) -> Result<()>;

    /// Most recent snapshot for the owner, consumed or not.
    async fn latest_snapshot(&self, owner_id: &str) -> Result<Option<ContextSnapshot>>;

    async fn mark_snapshot_consumed(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Delete snapshots past `expires_at`, or captured more than `retention`
    /// ago when they carry no expiry.
    async fn purge_snapshots(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize>;

    async fn archive_transcript(&self, transcript: ArchivedTranscript) -> Result<()>;

    async fn purge_transcripts(&self, archived_before: DateTime<Utc>) -> Result<usize>;

    /// Insert `replacement` as the new current entry and retire `old_id`.
    async fn supersede(&self, old_id: &str, replacement: MemoryEntry) -> Result<MemoryEntry> {
        if self.get(old_id).await?.is_none() {
            return Err(MemoryError::NotFound(old_id.to_string()));
        }
        let stored = self.add(replacement).await?;
        link_successor(self, old_id, &stored.id, Utc::now()).await?;
        Ok(stored)
    }

    /// Store `summary` as the abstraction of `ids` and point each source at it.
    ///
    /// Sources are linked before the summary is written. Sources already taken
    /// by another writer are left out of `source_ids`; when fewer than
    /// `min_sources` remain the links are released and no summary is stored.
    async fn consolidate(
        &self,
        ids: &[String],
        summary: MemoryEntry,
        min_sources: usize,
    ) -> Result<MemoryEntry> {
        let mut summary = summary;
        let mut linked = Vec::with_capacity(ids.len());
        for id in ids {
            match self.mark_superseded(id, &summary.id, None).await {
                Ok(true) => linked.push(id.clone()),
                Ok(false) => warn!(
                    "[{}] {} was superseded concurrently; leaving it out of {}",
                    self.name(),
                    id,
                    summary.id
                ),
                Err(e) => warn!("[{}] failed to link {} -> {}: {}", self.name(), id, summary.id, e),
            }
        }

        if linked.len() < min_sources.max(1) {
            release_sources(self, &linked, &summary.id).await;
            return Err(MemoryError::InvalidSupersession(format!(
                "only {} of {} sources still current; need {}",
                linked.len(),
                ids.len(),
                min_sources
            )));
        }

        summary
            .metadata
            .insert(SOURCE_IDS_KEY.to_string(), serde_json::json!(linked));
        let summary_id = summary.id.clone();
        match self.add(summary).await {
            Ok(stored) => Ok(stored),
            Err(e) => {
                release_sources(self, &linked, &summary_id).await;
                Err(e)
            }
        }
    }
}

/// Best-effort rollback of consolidation links.
async fn release_sources<B>(backend: &B, ids: &[String], successor_id: &str)
where
    B: MemoryBackend + ?Sized,
{
    for id in ids {
        if let Err(e) = backend.release_superseded(id, successor_id).await {
            warn!(
                "[{}] could not release {} from {}: {}",
                backend.name(),
                id,
                successor_id,
                e
            );
        }
    }
}
