use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use mnemos_core::{Embedder, LLMProvider, MemoryBackend, MemoryError, Result};
use mnemos_llm::PromptRenderer;
use mnemos_memory::{
    AutoRecall, CheckpointHandler, Classifier, Cleaner, Consolidator, ContextBlockBuilder,
    EngineStats, ExtractionQueue, ExtractionWorker, Extractor, ExtractiveSummarizer,
    HashEmbedder, HeuristicGate, LLMSummarizer, LlmClassifier, LlmExtractor, Summarizer,
};
use mnemos_storage::create_backend;

use crate::config::EngineConfig;
use crate::engine::MemoryEngine;

/// Assembles a [`MemoryEngine`]. Anything not supplied falls back to what the
/// config describes: the backend from `storage`, the hashing embedder, and
/// model-backed extraction, classification and summaries over `llm`.
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    backend: Option<Arc<dyn MemoryBackend>>,
    llm: Option<Arc<dyn LLMProvider>>,
    embedder: Option<Arc<dyn Embedder>>,
    extractor: Option<Arc<dyn Extractor>>,
    classifier: Option<Arc<dyn Classifier>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    renderer: Option<Arc<PromptRenderer>>,
    block_template: Option<String>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            backend: None,
            llm: None,
            embedder: None,
            extractor: None,
            classifier: None,
            summarizer: None,
            renderer: None,
            block_template: None,
        }
    }

    pub fn from_config(config: EngineConfig) -> Self {
        Self::new().config(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(Self::from_config(EngineConfig::from_yaml_str(yaml)?))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_config(EngineConfig::from_file(path)?))
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn MemoryBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// The auxiliary model used for extraction, classification and summaries.
    pub fn llm(mut self, llm: Arc<dyn LLMProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Prompt templates shared by the model-backed components.
    pub fn prompts(mut self, renderer: Arc<PromptRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Replace the minijinja template of the injected memory block.
    pub fn block_template(mut self, template: impl Into<String>) -> Self {
        self.block_template = Some(template.into());
        self
    }

    pub async fn build(self) -> Result<MemoryEngine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => create_backend(&config.storage).await?,
        };
        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(HashEmbedder::default()));
        let renderer = self
            .renderer
            .unwrap_or_else(|| Arc::new(PromptRenderer::new()));

        let extractor: Arc<dyn Extractor> = match (self.extractor, &self.llm) {
            (Some(extractor), _) => extractor,
            (None, Some(llm)) => {
                Arc::new(LlmExtractor::new(llm.clone()).with_renderer(renderer.clone()))
            }
            (None, None) => {
                return Err(MemoryError::Config(
                    "An LLM provider or an extractor is required".into(),
                ));
            }
        };
        let classifier: Arc<dyn Classifier> = match (self.classifier, &self.llm) {
            (Some(classifier), _) => classifier,
            (None, Some(llm)) => {
                Arc::new(LlmClassifier::new(llm.clone()).with_renderer(renderer.clone()))
            }
            (None, None) => {
                return Err(MemoryError::Config(
                    "An LLM provider or a classifier is required".into(),
                ));
            }
        };
        let summarizer: Arc<dyn Summarizer> = match (self.summarizer, &self.llm) {
            (Some(summarizer), _) => summarizer,
            (None, Some(llm)) => {
                Arc::new(LLMSummarizer::new(llm.clone()).with_renderer(renderer.clone()))
            }
            (None, None) => {
                debug!("[builder] no model for summaries; using extractive summaries");
                Arc::new(ExtractiveSummarizer::new())
            }
        };

        let stats = Arc::new(EngineStats::new());
        let gate = Arc::new(HeuristicGate::new(config.gate.clone())?);
        let queue = Arc::new(ExtractionQueue::new(config.queue.capacity));
        let worker = Arc::new(
            ExtractionWorker::new(backend.clone(), extractor, classifier, embedder.clone())
                .with_config(config.extraction.clone())
                .with_classifier_config(config.classifier.clone())
                .with_stats(stats.clone()),
        );

        let blocks = Arc::new(match self.block_template {
            Some(template) => ContextBlockBuilder::with_template(config.context.clone(), template)?,
            None => ContextBlockBuilder::new(config.context.clone())?,
        });
        let recall = AutoRecall::new(
            backend.clone(),
            embedder.clone(),
            gate.clone(),
            blocks.clone(),
            config.recall.clone(),
        )?;
        let checkpoints = CheckpointHandler::new(backend.clone(), worker.clone(), queue.clone())
            .with_config(config.checkpoint.clone())
            .with_snapshot_retention(config.cleanup.snapshot_retention());
        let consolidator = Arc::new(
            Consolidator::new(backend.clone(), summarizer)
                .with_config(config.consolidation.clone())
                .with_embedder(embedder.clone()),
        );
        let cleaner = Arc::new(Cleaner::new(backend.clone()).with_config(config.cleanup.clone()));

        info!(
            "[builder] engine on {} backend (gate {:.2}, queue {}, recall budget {})",
            backend.name(),
            config.gate.threshold,
            config.queue.capacity,
            config.recall.budget_tokens
        );

        Ok(MemoryEngine::assemble(
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
            stats,
        ))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemos_llm::MockLLMProvider;
    use mnemos_storage::InMemoryBackend;

    #[tokio::test]
    async fn test_build_from_yaml_with_memory_storage() {
        let engine = EngineBuilder::from_yaml("queue:\n  capacity: 50\nstorage:\n  type: memory")
            .unwrap()
            .llm(Arc::new(MockLLMProvider::new("aux")))
            .build()
            .await
            .unwrap();
        assert_eq!(engine.config().queue.capacity, 50);
        assert_eq!(engine.queue().capacity(), 50);
        assert_eq!(engine.backend().name(), "in-memory");
        assert!(!engine.is_started());
    }

    #[tokio::test]
    async fn test_requires_model_or_components() {
        let result = EngineBuilder::new()
            .backend(Arc::new(InMemoryBackend::new()))
            .build()
            .await;
        assert!(matches!(result, Err(MemoryError::Config(_))));
    }

    #[tokio::test]
    async fn test_bad_block_template_fails_build() {
        let result = EngineBuilder::new()
            .llm(Arc::new(MockLLMProvider::new("aux")))
            .block_template("{% if %}")
            .build()
            .await;
        assert!(matches!(result, Err(MemoryError::Config(_))));
    }

    #[tokio::test]
    async fn test_supplied_backend_wins_over_config() {
        let backend = InMemoryBackend::named("shared");
        let engine = EngineBuilder::new()
            .backend(Arc::new(backend))
            .llm(Arc::new(MockLLMProvider::new("aux")))
            .build()
            .await
            .unwrap();
        assert_eq!(engine.backend().name(), "shared");
    }
}
