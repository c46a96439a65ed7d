//! Periodic consolidation of aged L2 entries into L3 insights

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use mnemos_core::{
    Embedder, EntryType, MemoryBackend, MemoryEntry, MemoryFilter, Result, Tier,
    cosine_similarity, jaccard, word_set,
};

use crate::config::ConsolidationConfig;
use crate::reports::ConsolidationReport;
use crate::scheduler::ScheduledTask;
use crate::summarizer::Summarizer;

/// Pairwise similarity: cosine over embeddings when both entries carry one of
/// the same width, word overlap otherwise.
pub fn entry_similarity(a: &MemoryEntry, b: &MemoryEntry) -> f32 {
    if !a.embedding.is_empty() && a.embedding.len() == b.embedding.len() {
        cosine_similarity(&a.embedding, &b.embedding)
    } else {
        jaccard(&word_set(&a.content), &word_set(&b.content))
    }
}

/// Connected components of the "similarity >= threshold" graph with at least
/// `min_size` members, ordered by their earliest member.
pub fn build_clusters(entries: &[MemoryEntry], threshold: f32, min_size: usize) -> Vec<Vec<usize>> {
    let n = entries.len();
    if n < min_size.max(1) {
        return Vec::new();
    }

    let mut parent: Vec<usize> = (0..n).collect();
    let mut rank: Vec<usize> = vec![0; n];

    for i in 0..n {
        for j in (i + 1)..n {
            if entry_similarity(&entries[i], &entries[j]) >= threshold {
                union(&mut parent, &mut rank, i, j);
            }
        }
    }

    let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        components.entry(root).or_default().push(i);
    }

    let mut clusters: Vec<Vec<usize>> = components
        .into_values()
        .filter(|members| members.len() >= min_size)
        .collect();
    clusters.sort_by_key(|members| members[0]);
    clusters
}

fn find(parent: &mut [usize], i: usize) -> usize {
    if parent[i] != i {
        parent[i] = find(parent, parent[i]);
    }
    parent[i]
}

fn union(parent: &mut [usize], rank: &mut [usize], a: usize, b: usize) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra == rb {
        return;
    }
    if rank[ra] < rank[rb] {
        parent[ra] = rb;
    } else if rank[ra] > rank[rb] {
        parent[rb] = ra;
    } else {
        parent[rb] = ra;
        rank[ra] += 1;
    }
}

pub struct Consolidator {
    backend: Arc<dyn MemoryBackend>,
    summarizer: Arc<dyn Summarizer>,
    embedder: Option<Arc<dyn Embedder>>,
    config: ConsolidationConfig,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl Consolidator {
    pub fn new(backend: Arc<dyn MemoryBackend>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            backend,
            summarizer,
            embedder: None,
            config: ConsolidationConfig::default(),
            last_run: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: ConsolidationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Scheduled entry point: skipped outside the configured window or when disabled.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<ConsolidationReport> {
        if !self.config.enabled || !self.config.in_window(now.hour()) {
            debug!("[consolidation] outside window at hour {}; skipping", now.hour());
            return Ok(ConsolidationReport {
                skipped: true,
                ..Default::default()
            });
        }
        self.run_now(now).await
    }

    /// Consolidate every owner regardless of the window.
    pub async fn run_now(&self, now: DateTime<Utc>) -> Result<ConsolidationReport> {
        let mut report = ConsolidationReport::default();
        for owner in self.backend.owners().await? {
            report.owners += 1;
            if let Err(e) = self.consolidate_owner(&owner, now, &mut report).await {
                warn!("[consolidation] owner {} failed: {}", owner, e);
            }
        }
        info!(
            "[consolidation] {} cluster(s), {} summaries, {} entries folded",
            report.clusters, report.summaries_created, report.entries_consolidated
        );
        Ok(report)
    }

    pub async fn consolidate_owner(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
        report: &mut ConsolidationReport,
    ) -> Result<()> {
        let cutoff = now - Duration::days(self.config.min_age_days);
        let filter = MemoryFilter::owner(owner_id)
            .current()
            .with_tiers(vec![Tier::L2]);

        let candidates: Vec<MemoryEntry> = self
            .backend
            .list(&filter)
            .await?
            .into_iter()
            .filter(|e| e.entry_type != EntryType::Commitment)
            .filter(|e| e.created_at <= cutoff || e.needs_reconciliation())
            .collect();
        report.candidates += candidates.len();

        let clusters = build_clusters(
            &candidates,
            self.config.similarity_threshold,
            self.config.min_cluster_size,
        );
        report.clusters += clusters.len();

        for indices in clusters {
            let members: Vec<MemoryEntry> = indices.iter().map(|&i| candidates[i].clone()).collect();
            match self.fold_cluster(owner_id, &members).await {
                Ok(summary) => {
                    report.summaries_created += 1;
                    report.entries_consolidated += summary.source_ids().len();
                }
                Err(e) => {
                    warn!(
                        "[consolidation] cluster of {} for {} failed: {}",
                        members.len(),
                        owner_id,
                        e
                    );
                    report.failed_clusters += 1;
                }
            }
        }
        Ok(())
    }

    async fn fold_cluster(&self, owner_id: &str, members: &[MemoryEntry]) -> Result<MemoryEntry> {
        let content = self.summarizer.summarize(members).await?;
        let importance = members.iter().map(|m| m.importance).max().unwrap_or(5);

        let mut summary = MemoryEntry::new(owner_id, content, EntryType::Insight, importance)
            .with_tier(Tier::L3);
        if let Some(embedder) = &self.embedder {
            match embedder.embed(&summary.content).await {
                Ok(v) => summary.embedding = v,
                Err(e) => debug!("[consolidation] summary left unembedded: {}", e),
            }
        }

        let ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
        let stored = self
            .backend
            .consolidate(&ids, summary, self.config.min_cluster_size)
            .await?;
        debug!("[consolidation] {} <- {:?}", stored.id, stored.source_ids());
        Ok(stored)
    }
}

/// Ticks hourly so the low-activity window is not missed; a full pass runs
/// at most once per configured interval.
#[async_trait]
impl ScheduledTask for Consolidator {
    fn name(&self) -> &str {
        "consolidation"
    }

    fn interval(&self) -> std::time::Duration {
        self.config.interval().min(std::time::Duration::from_secs(3600))
    }

    async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let due = match *self.last_run.lock() {
            Some(last) => now - last >= Duration::hours(self.config.interval_hours as i64),
            None => true,
        };
        if !due {
            return Ok(());
        }
        let report = self.run(now).await?;
        if !report.skipped {
            *self.last_run.lock() = Some(now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarizer::{ExtractiveSummarizer, LLMSummarizer};
    use mnemos_llm::MockLLMProvider;
    use mnemos_storage::InMemoryBackend;

    fn aged(content: &str, embedding: Vec<f32>, days: i64, importance: u8) -> MemoryEntry {
        MemoryEntry::new("u1", content, EntryType::Fact, importance)
            .with_embedding(embedding)
            .with_created_at(Utc::now() - Duration::days(days))
    }

    async fn seed_topic(backend: &InMemoryBackend, days: i64) -> Vec<String> {
        let mut ids = Vec::new();
        for (content, emb, imp) in [
            ("User runs every morning", vec![1.0, 0.0, 0.05], 4),
            ("User is training for a marathon", vec![0.98, 0.1, 0.0], 7),
            ("User runs 40km a week", vec![0.97, 0.05, 0.1], 5),
        ] {
            ids.push(backend.add(aged(content, emb, days, imp)).await.unwrap().id);
        }
        ids
    }

    #[test]
    fn test_clusters_respect_min_size() {
        let entries = vec![
            aged("a", vec![1.0, 0.0], 10, 1),
            aged("b", vec![0.99, 0.01], 10, 1),
            aged("c", vec![0.0, 1.0], 10, 1),
            aged("d", vec![0.98, 0.02], 10, 1),
        ];
        let clusters = build_clusters(&entries, 0.85, 3);
        assert_eq!(clusters, vec![vec![0, 1, 3]]);
        assert!(build_clusters(&entries[..2], 0.85, 3).is_empty());
    }

    #[test]
    fn test_similarity_falls_back_to_words() {
        let a = MemoryEntry::new("u1", "likes green tea", EntryType::Preference, 3);
        let b = MemoryEntry::new("u1", "likes green tea", EntryType::Preference, 3);
        assert!((entry_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_three_aged_facts_become_one_insight() {
        let backend = InMemoryBackend::new();
        let ids = seed_topic(&backend, 8).await;
        let mock = MockLLMProvider::new("summarizer");
        mock.set_response("User is a committed runner training for a marathon");

        let consolidator = Consolidator::new(
            Arc::new(backend.clone()),
            Arc::new(LLMSummarizer::new(Arc::new(mock))),
        );
        let report = consolidator.run_now(Utc::now()).await.unwrap();
        assert_eq!(report.summaries_created, 1);
        assert_eq!(report.entries_consolidated, 3);

        let current = backend.list(&MemoryFilter::owner("u1").current()).await.unwrap();
        assert_eq!(current.len(), 1);
        let insight = &current[0];
        assert_eq!(insight.entry_type, EntryType::Insight);
        assert_eq!(insight.tier, Tier::L3);
        assert_eq!(insight.importance, 7);

        let mut sources = insight.source_ids();
        sources.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(sources, expected);

        for id in ids {
            let original = backend.get(&id).await.unwrap().unwrap();
            assert_eq!(original.superseded_by.as_deref(), Some(insight.id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_young_entries_are_left_alone() {
        let backend = InMemoryBackend::new();
        seed_topic(&backend, 2).await;
        let consolidator = Consolidator::new(
            Arc::new(backend.clone()),
            Arc::new(ExtractiveSummarizer::new()),
        );
        let report = consolidator.run_now(Utc::now()).await.unwrap();
        assert_eq!(report.candidates, 0);
        assert_eq!(backend.list(&MemoryFilter::owner("u1").current()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_flagged_entries_ignore_age() {
        let backend = InMemoryBackend::new();
        for (content, emb) in [
            ("User prefers dark mode", vec![1.0, 0.0]),
            ("User prefers dark mode at night", vec![0.99, 0.05]),
            ("User likes dark themes", vec![0.97, 0.1]),
        ] {
            let entry = MemoryEntry::new("u1", content, EntryType::Preference, 5)
                .with_embedding(emb)
                .with_metadata(mnemos_core::NEEDS_RECONCILIATION_KEY, serde_json::json!(true));
            backend.add(entry).await.unwrap();
        }
        let consolidator = Consolidator::new(
            Arc::new(backend.clone()),
            Arc::new(ExtractiveSummarizer::new()),
        );
        let report = consolidator.run_now(Utc::now()).await.unwrap();
        assert_eq!(report.summaries_created, 1);
    }

    #[tokio::test]
    async fn test_summarizer_failure_leaves_entries_current() {
        let backend = InMemoryBackend::new();
        seed_topic(&backend, 10).await;
        let mock = MockLLMProvider::new("summarizer");
        mock.set_error("offline");
        let consolidator = Consolidator::new(
            Arc::new(backend.clone()),
            Arc::new(LLMSummarizer::new(Arc::new(mock))),
        );

        let report = consolidator.run_now(Utc::now()).await.unwrap();
        assert_eq!(report.failed_clusters, 1);
        assert_eq!(backend.list(&MemoryFilter::owner("u1").current()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cluster_retired_underneath_is_not_summarized() {
        let backend = InMemoryBackend::new();
        let ids = seed_topic(&backend, 10).await;
        let members = backend.list(&MemoryFilter::owner("u1").current()).await.unwrap();

        // Two members move to another chain after the cluster was read.
        let newer = backend
            .add(MemoryEntry::new("u1", "User stopped running", EntryType::Fact, 6))
            .await
            .unwrap();
        backend.mark_superseded(&ids[0], &newer.id, None).await.unwrap();
        backend.mark_superseded(&ids[1], &newer.id, None).await.unwrap();

        let consolidator = Consolidator::new(
            Arc::new(backend.clone()),
            Arc::new(ExtractiveSummarizer::new()),
        );
        assert!(consolidator.fold_cluster("u1", &members).await.is_err());

        let current = backend.list(&MemoryFilter::owner("u1").current()).await.unwrap();
        let mut current_ids: Vec<&str> = current.iter().map(|e| e.id.as_str()).collect();
        current_ids.sort();
        let mut expected = vec![ids[2].as_str(), newer.id.as_str()];
        expected.sort();
        assert_eq!(current_ids, expected);
        assert!(current.iter().all(|e| e.entry_type != EntryType::Insight));
    }

    #[tokio::test]
    async fn test_scheduled_run_respects_window() {
        let backend = InMemoryBackend::new();
        seed_topic(&backend, 10).await;
        let consolidator = Consolidator::new(
            Arc::new(backend.clone()),
            Arc::new(ExtractiveSummarizer::new()),
        );

        let noon = Utc::now().with_hour(12).unwrap();
        assert!(consolidator.run(noon).await.unwrap().skipped);

        let three_am = Utc::now().with_hour(3).unwrap();
        let report = consolidator.run(three_am).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.summaries_created, 1);
    }

    #[tokio::test]
    async fn test_scheduled_tick_runs_once_per_interval() {
        let backend = InMemoryBackend::new();
        let consolidator = Consolidator::new(
            Arc::new(backend.clone()),
            Arc::new(ExtractiveSummarizer::new()),
        );
        let three_am = Utc::now().with_hour(3).unwrap();

        seed_topic(&backend, 10).await;
        consolidator.tick(three_am).await.unwrap();
        assert_eq!(backend.list(&MemoryFilter::owner("u1").current()).await.unwrap().len(), 1);

        seed_topic(&backend, 10).await;
        consolidator.tick(three_am + Duration::hours(1)).await.unwrap();
        assert_eq!(backend.list(&MemoryFilter::owner("u1").current()).await.unwrap().len(), 4);

        consolidator.tick(three_am + Duration::hours(24)).await.unwrap();
        assert_eq!(backend.list(&MemoryFilter::owner("u1").current()).await.unwrap().len(), 2);
    }
}
