//! The memory engine a host agent talks to

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use mnemos_core::{
    ArchivedTranscript, Embedder, ExtractionJob, MemoryBackend, MemoryEntry, MemoryFilter, Result,
    Turn, WorkingState, chain_from,
};
use mnemos_hooks::HostHooks;
use mnemos_memory::{
    AutoRecall, CheckpointHandler, CheckpointReport, Cleaner, CleanupReport, CommitmentTracker,
    ConsolidationReport, Consolidator, ContextBlock, ContextBlockBuilder, EngineStats,
    ExtractionQueue, ExtractionReport, ExtractionWorker, GateDecision, HeuristicGate,
    PreCompaction, Scheduler, StatsSnapshot,
};

use crate::config::EngineConfig;

#[derive(Debug, Default)]
struct Session {
    recent: VecDeque<String>,
    state: WorkingState,
}

/// Wires the request path (gate, recall, block builder) to the background
/// path (queue consumer, consolidation, cleanup). All calls take an explicit
/// `owner_id`; nothing is keyed on an ambient "current user".
pub struct MemoryEngine {
    pub(crate) config: EngineConfig,
    pub(crate) backend: Arc<dyn MemoryBackend>,
    pub(crate) embedder: Arc<dyn Embedder>,
    pub(crate) gate: Arc<HeuristicGate>,
    pub(crate) queue: Arc<ExtractionQueue>,
    pub(crate) worker: Arc<ExtractionWorker>,
    pub(crate) recall: AutoRecall,
    pub(crate) blocks: Arc<ContextBlockBuilder>,
    pub(crate) checkpoints: CheckpointHandler,
    pub(crate) consolidator: Arc<Consolidator>,
    pub(crate) cleaner: Arc<Cleaner>,
    pub(crate) commitments: CommitmentTracker,
    pub(crate) scheduler: Scheduler,
    pub(crate) stats: Arc<EngineStats>,
    sessions: RwLock<HashMap<String, Session>>,
    started: AtomicBool,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("backend", &self.backend.name())
            .field("queued", &self.queue.len())
            .field("started", &self.is_started())
            .finish()
    }
}

impl MemoryEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        config: EngineConfig,
        backend: Arc<dyn MemoryBackend>,
        embedder: Arc<dyn Embedder>,
        gate: Arc<HeuristicGate>,
        queue: Arc<ExtractionQueue>,
        worker: Arc<ExtractionWorker>,
        recall: AutoRecall,
        blocks: Arc<ContextBlockBuilder>,
        checkpoints: CheckpointHandler,
        consolidator: Arc<Consolidator>,
        cleaner: Arc<Cleaner>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            commitments: CommitmentTracker::new(backend.clone()),
            config,
            backend,
            embedder,
            gate,
            queue,
            worker,
            recall,
            blocks,
            checkpoints,
            consolidator,
            cleaner,
            scheduler: Scheduler::new(),
            stats,
            sessions: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> Arc<dyn MemoryBackend> {
        self.backend.clone()
    }

    pub fn queue(&self) -> Arc<ExtractionQueue> {
        self.queue.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Start the queue consumer and the consolidation and cleanup schedules.
    /// Must be called from within a tokio runtime. An engine starts at most
    /// once; later calls are no-ops, including after shutdown.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = self.worker.clone();
        self.scheduler.spawn(worker.run(
            self.queue.clone(),
            self.config.queue.clone(),
            self.scheduler.shutdown_signal(),
        ));
        if self.config.consolidation.enabled {
            self.scheduler.schedule(self.consolidator.clone());
        }
        self.scheduler.schedule(self.cleaner.clone());
        info!(
            "[engine] started on {} backend ({} background task(s))",
            self.backend.name(),
            self.scheduler.task_count()
        );
    }

    /// Stop background tasks, then process whatever is still queued.
    pub async fn shutdown(&self) -> ExtractionReport {
        self.scheduler.shutdown().await;
        let report = self.worker.flush(&self.queue).await;
        info!("[engine] shut down; drained {} job(s)", report.jobs);
        report
    }

    /// The live window for `owner_id`, oldest first.
    pub fn recent_turns(&self, owner_id: &str) -> Vec<String> {
        self.sessions
            .read()
            .get(owner_id)
            .map(|s| s.recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_working_state(&self, owner_id: &str, state: WorkingState) {
        self.sessions
            .write()
            .entry(owner_id.to_string())
            .or_default()
            .state = state;
    }

    pub fn working_state(&self, owner_id: &str) -> WorkingState {
        self.sessions
            .read()
            .get(owner_id)
            .map(|s| s.state.clone())
            .unwrap_or_default()
    }

    fn remember_turn(&self, owner_id: &str, text: &str) {
        let window = self.config.session.recent_window;
        if window == 0 {
            return;
        }
        let mut sessions = self.sessions.write();
        let session = sessions.entry(owner_id.to_string()).or_default();
        session.recent.push_back(text.to_string());
        while session.recent.len() > window {
            session.recent.pop_front();
        }
    }

    /// Gate decision for `text` against the owner's live window.
    pub async fn evaluate_turn(&self, owner_id: &str, text: &str) -> GateDecision {
        let recent = self.recent_turns(owner_id);
        self.gate
            .evaluate_with_novelty(text, &recent, self.embedder.as_ref())
            .await
    }

    /// Run the gate over a finished turn and queue it for extraction when it
    /// carries durable information. Never blocks on the model or storage.
    pub async fn observe_turn(&self, turn: &Turn) -> GateDecision {
        let decision = self.evaluate_turn(&turn.owner_id, &turn.text).await;
        self.stats.record_gated();

        if decision.should_extract {
            self.stats.record_enqueued();
            if self
                .queue
                .enqueue(ExtractionJob::new(turn.clone(), decision.score))
                .is_some()
            {
                self.stats.record_dropped();
            }
            debug!(
                "[engine] queued turn {} for {} (score {:.2})",
                turn.id, turn.owner_id, decision.score
            );
        }

        self.remember_turn(&turn.owner_id, &turn.text);
        decision
    }

    /// The block to inject before generating a reply to `turn`, if any. The
    /// first turn after a checkpoint gets the restoration block; later turns
    /// go through auto-recall.
    pub async fn context_for_turn(&self, turn: &Turn) -> Option<ContextBlock> {
        let now = Utc::now();
        if self.checkpoints.take_marker(&turn.owner_id) {
            let block = self
                .checkpoints
                .restoration_block(&turn.owner_id, &self.blocks, self.config.recall.top_n, now)
                .await;
            if block.is_some() {
                info!("[engine] restoring context for {}", turn.owner_id);
                self.stats.record_recall(true);
                return block;
            }
        }

        let recent = self.recent_turns(&turn.owner_id);
        let block = self
            .recall
            .recall(
                &turn.text,
                &turn.owner_id,
                self.config.recall.budget_tokens,
                &recent,
            )
            .await;
        self.stats.record_recall(block.is_some());
        block
    }

    /// Flush, snapshot and mark before the host compacts. When the event
    /// carries no working state the tracked state is used.
    pub async fn checkpoint(&self, mut event: PreCompaction) -> CheckpointReport {
        if event.state.is_empty() {
            event.state = self.working_state(&event.owner_id);
        }
        let owner_id = event.owner_id.clone();
        let report = self.checkpoints.checkpoint(event).await;
        self.stats.record_checkpoint();

        if let Some(session) = self.sessions.write().get_mut(&owner_id) {
            session.recent.clear();
        }
        report
    }

    /// Process everything queued so far.
    pub async fn flush(&self) -> ExtractionReport {
        self.worker.flush(&self.queue).await
    }

    pub async fn end_session(&self, owner_id: &str) -> ExtractionReport {
        let report = self.flush().await;
        self.sessions.write().remove(owner_id);
        debug!("[engine] session ended for {}", owner_id);
        report
    }

    pub async fn create_commitment(
        &self,
        owner_id: &str,
        content: &str,
        target_person: Option<String>,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<MemoryEntry> {
        self.commitments
            .create(owner_id, content, target_person, due_at)
            .await
    }

    pub async fn complete_commitment(&self, id: &str) -> Result<MemoryEntry> {
        self.commitments.complete(id).await
    }

    pub async fn cancel_commitment(&self, id: &str) -> Result<MemoryEntry> {
        self.commitments.cancel(id).await
    }

    /// Read-only view for reminder components.
    pub async fn commitments_due_within(
        &self,
        owner_id: &str,
        window: Duration,
    ) -> Result<Vec<MemoryEntry>> {
        self.commitments.due_within(owner_id, window, Utc::now()).await
    }

    pub async fn current_entries(&self, owner_id: &str) -> Result<Vec<MemoryEntry>> {
        self.backend
            .list(&MemoryFilter::owner(owner_id).current())
            .await
    }

    /// Entries whose validity window contains `at`, superseded or not.
    pub async fn entries_as_of(&self, owner_id: &str, at: DateTime<Utc>) -> Result<Vec<MemoryEntry>> {
        self.backend
            .list(&MemoryFilter::owner(owner_id).as_of(at))
            .await
    }

    /// The supersession chain from `id` forward to its current head.
    pub async fn history(&self, id: &str) -> Result<Vec<MemoryEntry>> {
        chain_from(self.backend.as_ref(), id).await
    }

    pub async fn archive_transcript(
        &self,
        owner_id: &str,
        transcript_ref: &str,
        content: &str,
    ) -> Result<()> {
        self.backend
            .archive_transcript(ArchivedTranscript {
                transcript_ref: transcript_ref.to_string(),
                owner_id: owner_id.to_string(),
                content: content.to_string(),
                archived_at: Utc::now(),
            })
            .await
    }

    /// Consolidate every owner now, ignoring the schedule window.
    pub async fn consolidate_now(&self) -> Result<ConsolidationReport> {
        self.consolidator.run_now(Utc::now()).await
    }

    pub async fn cleanup_now(&self) -> Result<CleanupReport> {
        self.cleaner.run(Utc::now()).await
    }

    pub async fn health_check(&self) -> Result<()> {
        self.backend.health_check().await
    }
}

#[async_trait]
impl HostHooks for MemoryEngine {
    async fn on_turn_start(&self, turn: &Turn) -> Option<ContextBlock> {
        self.context_for_turn(turn).await
    }

    async fn on_turn_end(&self, turn: &Turn) {
        self.observe_turn(turn).await;
    }

    async fn on_pre_compaction(&self, event: &PreCompaction) {
        let report = self.checkpoint(event.clone()).await;
        if report.flush_incomplete {
            warn!(
                "[engine] compaction for {} proceeds with a partial flush",
                report.owner_id
            );
        }
    }

    async fn on_session_end(&self, owner_id: &str) {
        self.end_session(owner_id).await;
    }
}
