#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;

use mnemos_llm::MockLLMProvider;
use mnemos_memory::{HashEmbedder, LlmClassifier, LlmExtractor};
use mnemos_runtime::{EngineBuilder, EngineConfig, MemoryEngine};
use mnemos_storage::InMemoryBackend;

pub struct Harness {
    pub backend: InMemoryBackend,
    pub extractor_llm: MockLLMProvider,
    pub classifier_llm: MockLLMProvider,
    pub summary_llm: MockLLMProvider,
    pub embedder: HashEmbedder,
    pub engine: MemoryEngine,
}

pub async fn harness() -> Harness {
    harness_with(EngineConfig::default()).await
}

pub async fn harness_with(config: EngineConfig) -> Harness {
    let backend = InMemoryBackend::new();
    let extractor_llm = MockLLMProvider::new("extractor");
    let classifier_llm = MockLLMProvider::new("classifier");
    let summary_llm = MockLLMProvider::new("summarizer");

    let engine = EngineBuilder::from_config(config)
        .backend(Arc::new(backend.clone()))
        .llm(Arc::new(summary_llm.clone()))
        .extractor(Arc::new(LlmExtractor::new(Arc::new(extractor_llm.clone()))))
        .classifier(Arc::new(LlmClassifier::new(Arc::new(classifier_llm.clone()))))
        .build()
        .await
        .unwrap();

    Harness {
        backend,
        extractor_llm,
        classifier_llm,
        summary_llm,
        embedder: HashEmbedder::default(),
        engine,
    }
}

pub fn memory_reply(content: &str, kind: &str) -> String {
    json!({
        "memories": [{"content": content, "type": kind, "importance": 5}],
        "commitments": [],
    })
    .to_string()
}

pub fn supersede_reply(target_id: &str) -> String {
    json!({
        "decisions": [{
            "action": "SUPERSEDE",
            "target_id": target_id,
            "reason": "preference changed",
        }]
    })
    .to_string()
}
