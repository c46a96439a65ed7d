//! Extraction worker: the single consumer of the extraction queue

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use mnemos_core::{
    Embedder, EntryUpdate, ExtractionJob, MemoryBackend, MemoryEntry, MemoryError, MemoryFilter,
    NEEDS_RECONCILIATION_KEY, PendingLink, Result, ScoredEntry, SearchQuery, link_successor,
};

use crate::classifier::{ClassificationPlan, Classifier};
use crate::config::{ClassifierConfig, ExtractionConfig, QueueConfig};
use crate::extraction::Extractor;
use crate::queue::ExtractionQueue;
use crate::reports::{EngineStats, ExtractionReport};

enum JobError {
    /// Storage failed; the job may go back on the queue.
    Retryable(MemoryError),
    Fatal(MemoryError),
}

impl From<MemoryError> for JobError {
    fn from(e: MemoryError) -> Self {
        if e.is_backend_unavailable() {
            JobError::Retryable(e)
        } else {
            JobError::Fatal(e)
        }
    }
}

pub struct ExtractionWorker {
    backend: Arc<dyn MemoryBackend>,
    extractor: Arc<dyn Extractor>,
    classifier: Arc<dyn Classifier>,
    embedder: Arc<dyn Embedder>,
    config: ExtractionConfig,
    classifier_config: ClassifierConfig,
    stats: Arc<EngineStats>,
    processing: Mutex<()>,
}

impl ExtractionWorker {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        extractor: Arc<dyn Extractor>,
        classifier: Arc<dyn Classifier>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            backend,
            extractor,
            classifier,
            embedder,
            config: ExtractionConfig::default(),
            classifier_config: ClassifierConfig::default(),
            stats: Arc::new(EngineStats::new()),
            processing: Mutex::new(()),
        }
    }

    pub fn with_config(mut self, config: ExtractionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_classifier_config(mut self, config: ClassifierConfig) -> Self {
        self.classifier_config = config;
        self
    }

    pub fn with_stats(mut self, stats: Arc<EngineStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Consume the queue until `shutdown` flips to true or its sender is dropped.
    pub async fn run(
        self: Arc<Self>,
        queue: Arc<ExtractionQueue>,
        queue_config: QueueConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "[worker] consuming (batch {}, flush {}ms)",
            queue_config.batch_size, queue_config.flush_interval_ms
        );
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                ready = queue.wait_for_batch(queue_config.batch_size, queue_config.flush_interval()) => {
                    if !ready {
                        continue;
                    }
                    let _guard = self.processing.lock().await;
                    let jobs = queue.take(queue_config.batch_size);
                    if jobs.is_empty() {
                        continue;
                    }
                    let report = self.process_batch(jobs, Some(&queue)).await;
                    debug!("[worker] batch done: {:?}", report);
                }
            }
        }
        info!("[worker] stopped");
    }

    /// Process everything queued right now, waiting for any batch already in
    /// flight. Jobs are taken one at a time so a cancelled flush leaves the
    /// rest queued.
    pub async fn flush(&self, queue: &ExtractionQueue) -> ExtractionReport {
        let _guard = self.processing.lock().await;
        let mut total = ExtractionReport::default();
        let budget = queue.len() * (self.config.max_requeues as usize + 1);

        for _ in 0..budget {
            let jobs = queue.take(1);
            if jobs.is_empty() {
                break;
            }
            let report = self.process_batch(jobs, Some(queue)).await;
            total.merge(&report);
        }
        total
    }

    /// One failing job never stops the others.
    pub async fn process_batch(
        &self,
        jobs: Vec<ExtractionJob>,
        queue: Option<&ExtractionQueue>,
    ) -> ExtractionReport {
        let mut report = ExtractionReport::default();

        for mut job in jobs {
            report.jobs += 1;
            match self.process_job(&mut job).await {
                Ok(job_report) => report.merge(&job_report),
                Err(JobError::Retryable(e)) => match queue {
                    Some(queue) if job.requeues < self.config.max_requeues => {
                        warn!("[worker] turn {} re-queued after backend error: {}", job.turn.id, e);
                        job.requeues += 1;
                        queue.enqueue(job);
                        report.requeued += 1;
                    }
                    _ => {
                        warn!("[worker] dropping turn {}: {}", job.turn.id, e);
                        report.failed += 1;
                    }
                },
                Err(JobError::Fatal(e)) => {
                    warn!("[worker] extraction failed for turn {}: {}", job.turn.id, e);
                    report.failed += 1;
                }
            }
        }

        self.stats.record_extraction(&report);
        report
    }

    async fn process_job(
        &self,
        job: &mut ExtractionJob,
    ) -> std::result::Result<ExtractionReport, JobError> {
        let mut report = ExtractionReport::default();

        if self.config.delegate_to_backend && self.backend.supports_auto_extraction() {
            let stored = self.backend.auto_extract(job.owner_id(), &job.turn).await?;
            report.delegated += 1;
            report.added += stored.len();
            return Ok(report);
        }

        if !job.progress.is_empty() {
            debug!("[worker] resuming turn {}", job.turn.id);
        }
        while let Some(link) = job.progress.pending_links.first().cloned() {
            self.link_targets(&link, &mut report).await?;
            job.progress.pending_links.remove(0);
        }

        let candidates = match job.progress.candidates.take() {
            Some(candidates) => candidates,
            None => self.extract_with_retry(job).await.map_err(JobError::Fatal)?,
        };
        debug!(
            "[worker] {} candidate(s) from turn {}",
            candidates.len(),
            job.turn.id
        );

        let mut remaining = candidates.into_iter();
        while let Some(candidate) = remaining.next() {
            let candidate_id = candidate.id.clone();
            if let Err(e) = self
                .store_candidate(candidate.clone(), job, &mut report)
                .await
            {
                let mut unstored = Vec::new();
                if !job.progress.has_stored(&candidate_id) {
                    unstored.push(candidate);
                }
                unstored.extend(remaining);
                job.progress.candidates = Some(unstored);
                return Err(e.into());
            }
        }
        Ok(report)
    }

    async fn extract_with_retry(&self, job: &ExtractionJob) -> Result<Vec<MemoryEntry>> {
        let attempts = self.config.max_retries + 1;
        let timeout = std::time::Duration::from_millis(self.config.llm_timeout_ms);
        let mut last_error = MemoryError::Unsupported("no extraction attempt".into());

        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, self.extractor.extract(&job.turn)).await {
                Ok(Ok(candidates)) => return Ok(candidates),
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                Ok(Err(e)) => {
                    debug!("[worker] extraction attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = e;
                }
                Err(_) => {
                    debug!("[worker] extraction attempt {}/{} timed out", attempt, attempts);
                    last_error = MemoryError::Timeout(self.config.llm_timeout_ms);
                }
            }
        }
        Err(last_error)
    }

    async fn embed(&self, text: &str) -> Vec<f32> {
        match self.embedder.embed(text).await {
            Ok(v) => v,
            Err(e) => {
                warn!("[worker] embedding failed, storing without vector: {}", e);
                Vec::new()
            }
        }
    }

    async fn store_candidate(
        &self,
        candidate: MemoryEntry,
        job: &mut ExtractionJob,
        report: &mut ExtractionReport,
    ) -> Result<()> {
        let embedding = self.embed(&candidate.content).await;
        let candidate = candidate.with_embedding(embedding.clone());

        let mut query = SearchQuery::new(candidate.content.clone())
            .with_min_score(self.classifier_config.min_match_score);
        if !embedding.is_empty() {
            query = query.with_embedding(embedding);
        }
        let filter = MemoryFilter::owner(candidate.owner_id.clone()).current();
        let matches = self
            .backend
            .search(&query, &filter, self.config.top_k)
            .await?;

        let plan = self.classifier.plan(&candidate, &matches).await;
        self.apply_plan(candidate, plan, &matches, job, report).await
    }

    async fn apply_plan(
        &self,
        candidate: MemoryEntry,
        plan: ClassificationPlan,
        matches: &[ScoredEntry],
        job: &mut ExtractionJob,
        report: &mut ExtractionReport,
    ) -> Result<()> {
        match plan {
            ClassificationPlan::Add { flagged, reason } => {
                let mut entry = candidate;
                if flagged {
                    entry
                        .metadata
                        .insert(NEEDS_RECONCILIATION_KEY.to_string(), serde_json::json!(true));
                    report.flagged += 1;
                }
                let stored = self.backend.add(entry).await?;
                debug!("[worker] ADD {} ({})", stored.id, reason);
                report.added += 1;
            }
            ClassificationPlan::Update {
                target_id,
                merged_content,
                reason,
            } => {
                let existing_importance = matches
                    .iter()
                    .find(|m| m.entry.id == target_id)
                    .map(|m| m.entry.importance)
                    .unwrap_or(candidate.importance);
                let embedding = self.embed(&merged_content).await;
                let update = EntryUpdate::default()
                    .content(merged_content)
                    .importance(existing_importance.max(candidate.importance))
                    .embedding(embedding);
                self.backend.update(&target_id, update).await?;
                debug!("[worker] UPDATE {} ({})", target_id, reason);
                report.updated += 1;
            }
            ClassificationPlan::Supersede { target_ids, reason } => {
                let stored = self.backend.add(candidate).await?;
                report.added += 1;
                let link = PendingLink {
                    successor_id: stored.id.clone(),
                    target_ids: target_ids.clone(),
                };
                job.progress.pending_links.push(link.clone());
                self.link_targets(&link, report).await?;
                job.progress.pending_links.pop();
                debug!(
                    "[worker] SUPERSEDE {:?} -> {} ({})",
                    target_ids, stored.id, reason
                );
            }
            ClassificationPlan::Noop { target_id, reason } => {
                debug!("[worker] NOOP against {:?} ({})", target_id, reason);
                report.noop += 1;
            }
        }
        Ok(())
    }

    /// Links already in place are skipped, so a resumed job can run this again.
    async fn link_targets(&self, link: &PendingLink, report: &mut ExtractionReport) -> Result<()> {
        let now = Utc::now();
        for target in &link.target_ids {
            match link_successor(self.backend.as_ref(), target, &link.successor_id, now).await {
                Ok(true) => report.superseded += 1,
                Ok(false) => {}
                Err(e) if e.is_backend_unavailable() => return Err(e),
                Err(e) => warn!("[worker] could not supersede {}: {}", target, e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::LlmClassifier;
    use crate::embedding::HashEmbedder;
    use crate::extraction::LlmExtractor;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration};
    use mnemos_core::{ArchivedTranscript, CommitmentStatus, ContextSnapshot, EntryType, Turn};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use mnemos_llm::MockLLMProvider;
    use mnemos_storage::InMemoryBackend;

    struct Harness {
        backend: InMemoryBackend,
        extractor_llm: MockLLMProvider,
        classifier_llm: MockLLMProvider,
        worker: ExtractionWorker,
    }

    fn harness() -> Harness {
        let backend = InMemoryBackend::new();
        let extractor_llm = MockLLMProvider::new("extractor");
        let classifier_llm = MockLLMProvider::new("classifier");
        let worker = ExtractionWorker::new(
            Arc::new(backend.clone()),
            Arc::new(LlmExtractor::new(Arc::new(extractor_llm.clone()))),
            Arc::new(LlmClassifier::new(Arc::new(classifier_llm.clone()))),
            Arc::new(HashEmbedder::default()),
        );
        Harness {
            backend,
            extractor_llm,
            classifier_llm,
            worker,
        }
    }

    fn memory_reply(content: &str, kind: &str) -> String {
        format!(
            r#"{{"memories": [{{"content": "{}", "type": "{}", "importance": 5}}], "commitments": []}}"#,
            content, kind
        )
    }

    fn job(text: &str) -> ExtractionJob {
        ExtractionJob::new(Turn::new("u1", text), 0.6)
    }

    #[tokio::test]
    async fn test_add_then_supersede() {
        let h = harness();
        h.extractor_llm
            .set_response(memory_reply("User prefers dark mode", "preference"));
        let report = h.worker.process_batch(vec![job("I prefer dark mode")], None).await;
        assert_eq!(report.added, 1);
        assert_eq!(h.classifier_llm.call_count(), 0);

        let dark = h.backend.list(&MemoryFilter::owner("u1")).await.unwrap().remove(0);
        h.extractor_llm
            .set_response(memory_reply("User prefers light mode", "preference"));
        h.classifier_llm.set_response(format!(
            r#"{{"decisions": [{{"action": "SUPERSEDE", "target_id": "{}", "reason": "changed"}}]}}"#,
            dark.id
        ));
        let report = h
            .worker
            .process_batch(vec![job("Actually, I prefer light mode now")], None)
            .await;
        assert_eq!(report.added, 1);
        assert_eq!(report.superseded, 1);

        let current = h
            .backend
            .list(&MemoryFilter::owner("u1").current())
            .await
            .unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].content, "User prefers light mode");

        let old = h.backend.get(&dark.id).await.unwrap().unwrap();
        assert_eq!(old.superseded_by.as_deref(), Some(current[0].id.as_str()));
        assert!(old.valid_until.is_some());
    }

    #[tokio::test]
    async fn test_update_keeps_id_and_valid_from() {
        let h = harness();
        let existing = h
            .backend
            .add(
                MemoryEntry::new("u1", "User likes tea", EntryType::Preference, 4)
                    .with_embedding(HashEmbedder::default().embed_sync("User likes tea")),
            )
            .await
            .unwrap();

        h.extractor_llm
            .set_response(memory_reply("User likes green tea", "preference"));
        h.classifier_llm.set_response(format!(
            r#"{{"decisions": [{{"action": "UPDATE", "target_id": "{}", "merged_content": "User likes tea, especially green tea"}}]}}"#,
            existing.id
        ));
        let report = h.worker.process_batch(vec![job("I like green tea most")], None).await;
        assert_eq!(report.updated, 1);

        let updated = h.backend.get(&existing.id).await.unwrap().unwrap();
        assert_eq!(updated.content, "User likes tea, especially green tea");
        assert_eq!(updated.importance, 5);
        assert_eq!(updated.valid_from, existing.valid_from);
        assert_eq!(h.backend.len(), 1);
    }

    #[tokio::test]
    async fn test_noop_discards_candidate() {
        let h = harness();
        let existing = h
            .backend
            .add(
                MemoryEntry::new("u1", "User prefers dark mode", EntryType::Preference, 5)
                    .with_embedding(HashEmbedder::default().embed_sync("User prefers dark mode")),
            )
            .await
            .unwrap();
        h.extractor_llm
            .set_response(memory_reply("User prefers dark mode", "preference"));
        h.classifier_llm.set_response(format!(
            r#"{{"decisions": [{{"action": "NOOP", "target_id": "{}"}}]}}"#,
            existing.id
        ));

        let report = h.worker.process_batch(vec![job("dark mode please")], None).await;
        assert_eq!(report.noop, 1);
        assert_eq!(h.backend.len(), 1);
    }

    #[tokio::test]
    async fn test_ambiguous_classification_adds_flagged() {
        let h = harness();
        h.backend
            .add(
                MemoryEntry::new("u1", "User prefers dark mode", EntryType::Preference, 5)
                    .with_embedding(HashEmbedder::default().embed_sync("User prefers dark mode")),
            )
            .await
            .unwrap();
        h.extractor_llm
            .set_response(memory_reply("User prefers dark mode at night", "preference"));
        h.classifier_llm.set_response("hmm, hard to say");

        let report = h.worker.process_batch(vec![job("dark mode at night")], None).await;
        assert_eq!(report.added, 1);
        assert_eq!(report.flagged, 1);

        let flagged: Vec<_> = h
            .backend
            .list(&MemoryFilter::owner("u1"))
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.needs_reconciliation())
            .collect();
        assert_eq!(flagged.len(), 1);
    }

    #[tokio::test]
    async fn test_extraction_retried_once_then_dropped() {
        let h = harness();
        h.extractor_llm.set_error("model down");

        let report = h.worker.process_batch(vec![job("I prefer dark mode")], None).await;
        assert_eq!(report.failed, 1);
        assert_eq!(h.extractor_llm.call_count(), 2);
        assert!(h.backend.is_empty());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_batch() {
        let h = harness();
        h.extractor_llm.set_responses(
            vec![
                "garbage".to_string(),
                "garbage".to_string(),
                memory_reply("User lives in Porto", "fact"),
            ],
            false,
        );

        let report = h
            .worker
            .process_batch(vec![job("first"), job("I live in Porto")], None)
            .await;
        assert_eq!(report.jobs, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.added, 1);
    }

    #[tokio::test]
    async fn test_backend_failure_requeues_once() {
        let h = harness();
        h.extractor_llm
            .set_response(memory_reply("User prefers dark mode", "preference"));
        h.backend.set_healthy(false);
        let queue = ExtractionQueue::new(10);

        let report = h.worker.process_batch(vec![job("I prefer dark mode")], Some(&queue)).await;
        assert_eq!(report.requeued, 1);
        assert_eq!(queue.len(), 1);

        let again = queue.take(1);
        assert_eq!(again[0].requeues, 1);
        let report = h.worker.process_batch(again, Some(&queue)).await;
        assert_eq!(report.failed, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_processes_everything_queued() {
        let h = harness();
        h.extractor_llm.set_responses(
            vec![
                memory_reply("User has a dog named Rex", "fact"),
                memory_reply("User is learning Portuguese", "fact"),
                memory_reply("User moved to Lisbon", "event"),
            ],
            false,
        );
        let queue = ExtractionQueue::new(10);
        queue.enqueue(job("my dog Rex"));
        queue.enqueue(job("learning Portuguese"));
        queue.enqueue(job("moved to Lisbon"));

        let report = h.worker.flush(&queue).await;
        assert_eq!(report.jobs, 3);
        assert_eq!(report.added, 3);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_consumer_loop_processes_and_stops() {
        let h = harness();
        h.extractor_llm
            .set_response(memory_reply("User prefers dark mode", "preference"));
        let backend = h.backend.clone();
        let worker = Arc::new(h.worker);
        let queue = Arc::new(ExtractionQueue::new(10));
        let (tx, rx) = watch::channel(false);

        let config = QueueConfig::default()
            .with_batch_size(1)
            .with_flush_interval_ms(20);
        let handle = tokio::spawn(worker.clone().run(queue.clone(), config, rx));

        queue.enqueue(job("I prefer dark mode"));
        for _ in 0..50 {
            if !backend.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(backend.len(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    /// Stands in for a remote service: optionally runs its own extraction
    /// pipeline, and can drop out right before a supersession link is written.
    struct RemoteBackend {
        inner: InMemoryBackend,
        auto_extract: bool,
        failing_links: AtomicUsize,
    }

    impl RemoteBackend {
        fn new(inner: InMemoryBackend) -> Self {
            Self {
                inner,
                auto_extract: false,
                failing_links: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MemoryBackend for RemoteBackend {
        fn name(&self) -> &str {
            "remote"
        }
        fn supports_auto_extraction(&self) -> bool {
            self.auto_extract
        }
        async fn auto_extract(&self, owner_id: &str, turn: &Turn) -> Result<Vec<MemoryEntry>> {
            let entry = MemoryEntry::new(owner_id, turn.text.clone(), EntryType::Event, 3);
            Ok(vec![self.inner.add(entry).await?])
        }
        async fn add(&self, entry: MemoryEntry) -> Result<MemoryEntry> {
            self.inner.add(entry).await
        }
        async fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
            self.inner.get(id).await
        }
        async fn search(
            &self,
            query: &SearchQuery,
            filter: &MemoryFilter,
            limit: usize,
        ) -> Result<Vec<ScoredEntry>> {
            self.inner.search(query, filter, limit).await
        }
        async fn update(&self, id: &str, update: EntryUpdate) -> Result<MemoryEntry> {
            self.inner.update(id, update).await
        }
        async fn mark_superseded(
            &self,
            id: &str,
            successor_id: &str,
            valid_until: Option<DateTime<Utc>>,
        ) -> Result<bool> {
            let failing = self.failing_links.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_links.store(failing - 1, Ordering::SeqCst);
                return Err(MemoryError::Backend("connection reset".into()));
            }
            self.inner.mark_superseded(id, successor_id, valid_until).await
        }
        async fn release_superseded(&self, id: &str, successor_id: &str) -> Result<bool> {
            self.inner.release_superseded(id, successor_id).await
        }
        async fn transition_commitment(
            &self,
            id: &str,
            to: CommitmentStatus,
        ) -> Result<MemoryEntry> {
            self.inner.transition_commitment(id, to).await
        }
        async fn list(&self, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>> {
            self.inner.list(filter).await
        }
        async fn owners(&self) -> Result<Vec<String>> {
            self.inner.owners().await
        }
        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
        async fn save_snapshot(&self, snapshot: ContextSnapshot) -> Result<()> {
            self.inner.save_snapshot(snapshot).await
        }
        async fn latest_snapshot(&self, owner_id: &str) -> Result<Option<ContextSnapshot>> {
            self.inner.latest_snapshot(owner_id).await
        }
        async fn mark_snapshot_consumed(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
            self.inner.mark_snapshot_consumed(id, at).await
        }
        async fn purge_snapshots(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize> {
            self.inner.purge_snapshots(now, retention).await
        }
        async fn archive_transcript(&self, transcript: ArchivedTranscript) -> Result<()> {
            self.inner.archive_transcript(transcript).await
        }
        async fn purge_transcripts(&self, before: DateTime<Utc>) -> Result<usize> {
            self.inner.purge_transcripts(before).await
        }
    }

    #[tokio::test]
    async fn test_delegates_to_auto_extracting_backend() {
        let inner = InMemoryBackend::new();
        let extractor_llm = MockLLMProvider::new("extractor");
        let worker = ExtractionWorker::new(
            Arc::new(RemoteBackend {
                auto_extract: true,
                ..RemoteBackend::new(inner.clone())
            }),
            Arc::new(LlmExtractor::new(Arc::new(extractor_llm.clone()))),
            Arc::new(LlmClassifier::new(Arc::new(MockLLMProvider::new("c")))),
            Arc::new(HashEmbedder::default()),
        );

        let report = worker.process_batch(vec![job("we shipped v2 today")], None).await;
        assert_eq!(report.delegated, 1);
        assert_eq!(report.added, 1);
        assert_eq!(extractor_llm.call_count(), 0);
        assert_eq!(inner.len(), 1);
    }

    #[tokio::test]
    async fn test_requeued_supersede_resumes_without_duplicate() {
        let inner = InMemoryBackend::new();
        let backend = Arc::new(RemoteBackend::new(inner.clone()));
        let extractor_llm = MockLLMProvider::new("extractor");
        let classifier_llm = MockLLMProvider::new("classifier");
        let worker = ExtractionWorker::new(
            backend.clone(),
            Arc::new(LlmExtractor::new(Arc::new(extractor_llm.clone()))),
            Arc::new(LlmClassifier::new(Arc::new(classifier_llm.clone()))),
            Arc::new(HashEmbedder::default()),
        );

        let dark = inner
            .add(
                MemoryEntry::new("u1", "User prefers dark mode", EntryType::Preference, 5)
                    .with_embedding(HashEmbedder::default().embed_sync("User prefers dark mode")),
            )
            .await
            .unwrap();
        extractor_llm.set_response(memory_reply("User prefers light mode", "preference"));
        classifier_llm.set_response(format!(
            r#"{{"decisions": [{{"action": "SUPERSEDE", "target_id": "{}", "reason": "changed"}}]}}"#,
            dark.id
        ));
        backend.failing_links.store(1, Ordering::SeqCst);
        let queue = ExtractionQueue::new(10);

        let report = worker
            .process_batch(vec![job("Actually, I prefer light mode now")], Some(&queue))
            .await;
        assert_eq!(report.requeued, 1);
        assert_eq!(inner.len(), 2);

        let again = queue.take(1);
        assert_eq!(again[0].progress.pending_links.len(), 1);
        let report = worker.process_batch(again, Some(&queue)).await;
        assert_eq!(report.superseded, 1);
        assert_eq!(report.added, 0);
        assert!(queue.is_empty());

        assert_eq!(inner.len(), 2);
        assert_eq!(extractor_llm.call_count(), 1);
        let current = inner.list(&MemoryFilter::owner("u1").current()).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].content, "User prefers light mode");
        let old = inner.get(&dark.id).await.unwrap().unwrap();
        assert_eq!(old.superseded_by.as_deref(), Some(current[0].id.as_str()));
    }

    #[tokio::test]
    async fn test_requeued_job_keeps_unstored_candidates() {
        let h = harness();
        h.extractor_llm.set_response(
            r#"{"memories": [
                {"content": "User has a dog named Rex", "type": "fact", "importance": 5},
                {"content": "User moved to Lisbon", "type": "event", "importance": 6}
            ], "commitments": []}"#,
        );
        h.backend.set_healthy(false);
        let queue = ExtractionQueue::new(10);

        let report = h.worker.process_batch(vec![job("Rex and I moved to Lisbon")], Some(&queue)).await;
        assert_eq!(report.requeued, 1);
        let again = queue.take(1);
        assert_eq!(again[0].progress.candidates.as_ref().map(Vec::len), Some(2));

        h.backend.set_healthy(true);
        let report = h.worker.process_batch(again, Some(&queue)).await;
        assert_eq!(report.added, 2);
        assert_eq!(h.extractor_llm.call_count(), 1);
        assert_eq!(h.backend.len(), 2);
    }
}
