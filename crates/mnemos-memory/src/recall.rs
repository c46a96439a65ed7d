//! Latency-bounded recall on the request path

use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use tracing::{debug, warn};

use mnemos_core::{
    Embedder, MemoryBackend, MemoryEntry, MemoryError, MemoryFilter, Result, SearchQuery, Tier,
    cosine_similarity, jaccard, word_set,
};

use crate::config::{ContextBudget, RecallConfig};
use crate::context_block::{BlockSections, BlockSource, ContextBlock, ContextBlockBuilder};
use crate::gate::HeuristicGate;

const PERSONAL_REFERENCE_PATTERN: &str = r"(?i)\b(remember|recall|remind me what|last time|you (said|told me|mentioned)|we (talked|discussed|spoke)|my (wife|husband|partner|mom|mum|mother|dad|father|son|daughter|kids?|children|sister|brother|friend|boss|birthday|name|dog|cat))\b";

/// Overlap above which a memory is considered already present in the window.
const WINDOW_DUPLICATE_OVERLAP: f32 = 0.8;

pub struct AutoRecall {
    backend: Arc<dyn MemoryBackend>,
    embedder: Arc<dyn Embedder>,
    gate: Arc<HeuristicGate>,
    builder: Arc<ContextBlockBuilder>,
    config: RecallConfig,
    personal: Regex,
}

impl AutoRecall {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        embedder: Arc<dyn Embedder>,
        gate: Arc<HeuristicGate>,
        builder: Arc<ContextBlockBuilder>,
        config: RecallConfig,
    ) -> Result<Self> {
        let personal = Regex::new(PERSONAL_REFERENCE_PATTERN)
            .map_err(|e| MemoryError::Config(format!("recall pattern: {}", e)))?;
        Ok(Self {
            backend,
            embedder,
            gate,
            builder,
            config,
            personal,
        })
    }

    pub fn config(&self) -> &RecallConfig {
        &self.config
    }

    pub fn has_personal_reference(&self, text: &str) -> bool {
        self.personal.is_match(text)
    }

    /// A turn that stays on the topic of the last few turns, introduces no
    /// new names and does not reach back into personal history.
    pub async fn is_continuation(&self, query: &str, recent: &[String]) -> bool {
        let window = recent.len().min(self.config.continuity_window);
        if window == 0 || self.has_personal_reference(query) {
            return false;
        }
        let recent = &recent[recent.len() - window..];
        if !self.gate.new_entities(query, recent).is_empty() {
            return false;
        }

        let Ok(query_vec) = self.embedder.embed(query).await else {
            return false;
        };
        let mut best = 0.0f32;
        for text in recent {
            if let Ok(v) = self.embedder.embed(text).await {
                best = best.max(cosine_similarity(&query_vec, &v));
            }
        }
        best >= self.config.continuity_threshold
    }

    /// `recent` is the live window, most recent last. Never fails: any
    /// problem yields `None`. The continuity check and the search share one
    /// timeout.
    pub async fn recall(
        &self,
        query: &str,
        owner_id: &str,
        budget_tokens: u32,
        recent: &[String],
    ) -> Option<ContextBlock> {
        let lookup = async {
            if self.is_continuation(query, recent).await {
                return Ok(None);
            }
            self.search(query, owner_id).await.map(Some)
        };

        let found = match tokio::time::timeout(self.config.timeout(), lookup).await {
            Ok(Ok(Some(found))) => found,
            Ok(Ok(None)) => {
                debug!("[recall] continuation for {}; skipping", owner_id);
                return None;
            }
            Ok(Err(e)) => {
                warn!("[recall] search failed for {}: {}", owner_id, e);
                return None;
            }
            Err(_) => {
                warn!(
                    "[recall] exceeded {}ms for {}",
                    self.config.timeout_ms, owner_id
                );
                return None;
            }
        };

        let relevant: Vec<MemoryEntry> = found
            .into_iter()
            .filter(|e| !already_in_window(e, recent))
            .take(self.config.top_n)
            .collect();
        if relevant.is_empty() {
            return None;
        }

        let sections = BlockSections {
            relevant,
            ..Default::default()
        };
        let budget = ContextBudget {
            total: budget_tokens,
            profile: 0,
            relevant: budget_tokens,
            commitments: 0,
            session: 0,
            ..Default::default()
        };
        match self
            .builder
            .build_with_budget(owner_id, &sections, BlockSource::Recall, Utc::now(), &budget)
        {
            Ok(block) => block,
            Err(e) => {
                warn!("[recall] could not render block: {}", e);
                None
            }
        }
    }

    async fn search(&self, query: &str, owner_id: &str) -> Result<Vec<MemoryEntry>> {
        let embedding = self.embedder.embed(query).await?;
        let search = SearchQuery::new(query)
            .with_embedding(embedding)
            .with_min_score(self.config.relevance_threshold);
        let filter = MemoryFilter::owner(owner_id)
            .current()
            .with_tiers(vec![Tier::L2]);
        // Headroom for entries dropped as duplicates of the window.
        let limit = self.config.top_n * 2;
        let scored = self.backend.search(&search, &filter, limit).await?;
        Ok(scored
            .into_iter()
            .filter(|s| s.score >= self.config.relevance_threshold)
            .map(|s| s.entry)
            .collect())
    }
}

fn already_in_window(entry: &MemoryEntry, recent: &[String]) -> bool {
    let content = entry.content.to_lowercase();
    let words = word_set(&entry.content);
    recent.iter().any(|text| {
        text.to_lowercase().contains(&content) || jaccard(&words, &word_set(text)) >= WINDOW_DUPLICATE_OVERLAP
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use crate::embedding::HashEmbedder;
    use async_trait::async_trait;
    use mnemos_core::{EntryType, estimate_tokens};
    use mnemos_storage::InMemoryBackend;

    async fn setup(config: RecallConfig) -> (InMemoryBackend, AutoRecall) {
        let backend = InMemoryBackend::new();
        let embedder = HashEmbedder::default();
        for content in [
            "User has a golden retriever named Biscuit",
            "User's dog Biscuit is afraid of thunder",
            "User works as a nurse in Porto",
        ] {
            backend
                .add(
                    MemoryEntry::new("u1", content, EntryType::Fact, 5)
                        .with_embedding(embedder.embed_sync(content)),
                )
                .await
                .unwrap();
        }
        let recall = AutoRecall::new(
            Arc::new(backend.clone()),
            Arc::new(embedder),
            Arc::new(HeuristicGate::new(GateConfig::default()).unwrap()),
            Arc::new(ContextBlockBuilder::new(ContextBudget::default()).unwrap()),
            config,
        )
        .unwrap();
        (backend, recall)
    }

    fn loose() -> RecallConfig {
        RecallConfig {
            relevance_threshold: 0.3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_continuation_skips_search() {
        let (backend, recall) = setup(loose()).await;
        let recent = vec!["can you shorten the paragraph about the budget".to_string()];
        let block = recall
            .recall("can you shorten the paragraph about the budget again", "u1", 800, &recent)
            .await;
        assert!(block.is_none());
        assert_eq!(backend.search_count(), 0);
    }

    #[tokio::test]
    async fn test_personal_reference_breaks_continuation() {
        let (_, recall) = setup(loose()).await;
        let recent = vec!["what should I cook tonight".to_string()];
        assert!(!recall.is_continuation("what should I cook tonight for my wife", &recent).await);
        assert!(!recall.is_continuation("anything", &[]).await);
    }

    #[tokio::test]
    async fn test_recall_returns_relevant_entries() {
        let (backend, recall) = setup(loose()).await;
        let block = recall
            .recall("how is my dog Biscuit doing with thunder", "u1", 800, &[])
            .await
            .unwrap();
        assert_eq!(backend.search_count(), 1);
        assert!(block.text.contains("Biscuit"));
        assert!(!block.text.contains("nurse"));
        assert_eq!(block.source, BlockSource::Recall);
    }

    #[tokio::test]
    async fn test_recall_dedupes_against_window() {
        let (_, recall) = setup(loose()).await;
        let recent = vec!["User has a golden retriever named Biscuit".to_string()];
        let block = recall
            .recall("tell me about Biscuit the golden retriever", "u1", 800, &recent)
            .await;
        if let Some(block) = block {
            assert!(!block.text.contains("golden retriever named Biscuit"));
        }
    }

    #[tokio::test]
    async fn test_recall_respects_budget() {
        let (_, recall) = setup(loose()).await;
        for budget in [5u32, 20, 60, 800] {
            if let Some(block) = recall
                .recall("my dog Biscuit and thunder", "u1", budget, &[])
                .await
            {
                assert!(estimate_tokens(&block.text) <= budget);
            }
        }
    }

    #[tokio::test]
    async fn test_nothing_relevant_is_none() {
        let (_, recall) = setup(RecallConfig::default()).await;
        assert!(
            recall
                .recall("what's the capital of Mongolia", "u1", 800, &[])
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_backend_down_is_none() {
        let (backend, recall) = setup(loose()).await;
        backend.set_healthy(false);
        assert!(recall.recall("my dog Biscuit", "u1", 800, &[]).await.is_none());
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let (backend, recall) = setup(RecallConfig {
            timeout_ms: 20,
            relevance_threshold: 0.3,
            ..Default::default()
        })
        .await;
        backend.set_latency(200);
        let started = std::time::Instant::now();
        assert!(recall.recall("my dog Biscuit", "u1", 800, &[]).await.is_none());
        assert!(started.elapsed() < std::time::Duration::from_millis(150));
    }

    /// Model-backed embedder stand-in that answers slowly.
    struct SlowEmbedder {
        delay: std::time::Duration,
    }

    #[async_trait]
    impl Embedder for SlowEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            tokio::time::sleep(self.delay).await;
            Ok(HashEmbedder::default().embed_sync(text))
        }

        fn dimensions(&self) -> usize {
            HashEmbedder::default().dimensions()
        }
    }

    #[tokio::test]
    async fn test_slow_embedder_is_bounded() {
        let recall = AutoRecall::new(
            Arc::new(InMemoryBackend::new()),
            Arc::new(SlowEmbedder {
                delay: std::time::Duration::from_millis(100),
            }),
            Arc::new(HeuristicGate::new(GateConfig::default()).unwrap()),
            Arc::new(ContextBlockBuilder::new(ContextBudget::default()).unwrap()),
            RecallConfig {
                timeout_ms: 30,
                ..loose()
            },
        )
        .unwrap();
        let recent = vec![
            "can you shorten the paragraph about the budget".to_string(),
            "and tighten the intro".to_string(),
        ];

        let started = std::time::Instant::now();
        let block = recall
            .recall("can you shorten the paragraph about the budget again", "u1", 800, &recent)
            .await;
        assert!(block.is_none());
        assert!(started.elapsed() < std::time::Duration::from_millis(90));
    }
}
