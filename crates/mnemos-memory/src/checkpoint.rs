//! Compaction survival: checkpoint before the host compacts, restore after
//!
//! Hosts rarely signal the end of a compaction, so the checkpoint leaves a
//! per-owner marker that the next turn start consumes to re-inject memory.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use mnemos_core::{
    ArchivedTranscript, ContextSnapshot, EntryType, MemoryBackend, MemoryEntry, MemoryFilter,
    SnapshotTrigger, WorkingState,
};

use crate::commitments::CommitmentTracker;
use crate::config::CheckpointConfig;
use crate::context_block::{BlockSections, BlockSource, ContextBlock, ContextBlockBuilder};
use crate::queue::ExtractionQueue;
use crate::reports::CheckpointReport;
use crate::worker::ExtractionWorker;

#[derive(Debug, Clone, Default)]
pub struct PreCompaction {
    pub owner_id: String,
    pub transcript_ref: Option<String>,
    /// Raw transcript about to be discarded, when the host can provide it.
    pub transcript: Option<String>,
    pub state: WorkingState,
}

impl PreCompaction {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ..Default::default()
        }
    }

    pub fn with_transcript(mut self, transcript_ref: impl Into<String>, content: impl Into<String>) -> Self {
        self.transcript_ref = Some(transcript_ref.into());
        self.transcript = Some(content.into());
        self
    }

    pub fn with_state(mut self, state: WorkingState) -> Self {
        self.state = state;
        self
    }
}

pub struct CheckpointHandler {
    backend: Arc<dyn MemoryBackend>,
    worker: Arc<ExtractionWorker>,
    queue: Arc<ExtractionQueue>,
    config: CheckpointConfig,
    snapshot_retention: Duration,
    markers: Mutex<HashSet<String>>,
}

impl CheckpointHandler {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        worker: Arc<ExtractionWorker>,
        queue: Arc<ExtractionQueue>,
    ) -> Self {
        Self {
            backend,
            worker,
            queue,
            config: CheckpointConfig::default(),
            snapshot_retention: Duration::days(7),
            markers: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_config(mut self, config: CheckpointConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_snapshot_retention(mut self, retention: Duration) -> Self {
        self.snapshot_retention = retention;
        self
    }

    /// Flush, snapshot, archive, mark. Each step is independent; a failed step
    /// is logged and the rest still run.
    pub async fn checkpoint(&self, event: PreCompaction) -> CheckpointReport {
        let owner_id = event.owner_id.clone();
        let mut report = CheckpointReport {
            owner_id: owner_id.clone(),
            ..Default::default()
        };

        match tokio::time::timeout(self.config.flush_deadline(), self.worker.flush(&self.queue)).await {
            Ok(flushed) => report.flushed = flushed,
            Err(_) => {
                warn!(
                    "[checkpoint] flush for {} hit the {}ms deadline; {} job(s) left queued",
                    owner_id,
                    self.config.flush_deadline_ms,
                    self.queue.len()
                );
                report.flush_incomplete = true;
            }
        }

        let snapshot = ContextSnapshot::new(&owner_id, SnapshotTrigger::PreCompaction, event.state)
            .with_retention(self.snapshot_retention);
        let snapshot_id = snapshot.id.clone();
        match self.backend.save_snapshot(snapshot).await {
            Ok(()) => report.snapshot_id = Some(snapshot_id),
            Err(e) => warn!("[checkpoint] snapshot for {} not saved: {}", owner_id, e),
        }

        if self.config.archive_transcripts {
            if let Some(content) = event.transcript {
                let now = Utc::now();
                let transcript = ArchivedTranscript {
                    transcript_ref: event
                        .transcript_ref
                        .unwrap_or_else(|| format!("{}-{}", owner_id, now.timestamp_millis())),
                    owner_id: owner_id.clone(),
                    content,
                    archived_at: now,
                };
                match self.backend.archive_transcript(transcript).await {
                    Ok(()) => report.transcript_archived = true,
                    Err(e) => warn!("[checkpoint] transcript for {} not archived: {}", owner_id, e),
                }
            }
        }

        self.markers.lock().insert(owner_id.clone());
        report.marker_set = true;

        info!(
            "[checkpoint] {}: flushed {} job(s){}, snapshot {}",
            owner_id,
            report.flushed.jobs,
            if report.flush_incomplete { " (incomplete)" } else { "" },
            report.snapshot_id.as_deref().unwrap_or("none")
        );
        report
    }

    pub fn has_marker(&self, owner_id: &str) -> bool {
        self.markers.lock().contains(owner_id)
    }

    /// Consume the marker. Only the first call after a checkpoint returns true.
    pub fn take_marker(&self, owner_id: &str) -> bool {
        self.markers.lock().remove(owner_id)
    }

    /// Block re-injected on the first turn after a compaction: profile, the
    /// most important recent entries, commitments coming up, and the working
    /// state from the latest unconsumed snapshot.
    pub async fn restoration_block(
        &self,
        owner_id: &str,
        builder: &ContextBlockBuilder,
        top_n: usize,
        now: DateTime<Utc>,
    ) -> Option<ContextBlock> {
        let snapshot = match self.backend.latest_snapshot(owner_id).await {
            Ok(snapshot) => snapshot.filter(|s| !s.is_consumed() && !s.is_expired(now)),
            Err(e) => {
                warn!("[checkpoint] latest snapshot for {} unavailable: {}", owner_id, e);
                None
            }
        };

        let current = self
            .backend
            .list(&MemoryFilter::owner(owner_id).current())
            .await
            .unwrap_or_else(|e| {
                warn!("[checkpoint] entries for {} unavailable: {}", owner_id, e);
                Vec::new()
            });
        let (mut profile, mut relevant): (Vec<MemoryEntry>, Vec<MemoryEntry>) = current
            .into_iter()
            .filter(|e| e.entry_type != EntryType::Commitment)
            .partition(|e| e.entry_type.is_profile());
        by_priority(&mut profile);
        by_priority(&mut relevant);
        relevant.truncate(top_n);

        let horizon = Duration::hours(builder.budget().commitment_horizon_hours);
        let commitments = CommitmentTracker::new(self.backend.clone())
            .due_within(owner_id, horizon, now)
            .await
            .unwrap_or_default();

        let sections = BlockSections {
            profile,
            relevant,
            commitments,
            session: snapshot.as_ref().map(|s| s.state.clone()),
        };
        let block = match builder.build(owner_id, &sections, BlockSource::Restoration, now) {
            Ok(block) => block,
            Err(e) => {
                warn!("[checkpoint] restoration block for {} failed: {}", owner_id, e);
                return None;
            }
        };

        if let (Some(_), Some(snapshot)) = (&block, snapshot) {
            if let Err(e) = self.backend.mark_snapshot_consumed(&snapshot.id, now).await {
                debug!("[checkpoint] snapshot {} not marked consumed: {}", snapshot.id, e);
            }
        }
        block
    }
}

fn by_priority(entries: &mut [MemoryEntry]) {
    entries.sort_by(|a, b| {
        b.importance
            .cmp(&a.importance)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}
