//! mnemos: tiered conversational memory for agents
//!
//! Durable facts, preferences and commitments are extracted from turns off the
//! request path, kept current through supersession, condensed over time, and
//! re-injected after the host compacts its context.

pub mod engine {
    pub use mnemos_runtime::{EngineBuilder, EngineConfig, MemoryEngine, SessionConfig};
}

pub mod error {
    pub use mnemos_core::{LLMError, MemoryError, Result};
}

pub mod hooks {
    pub use mnemos_hooks::{BudgetedHooks, CompositeHooks, HostHooks, LoggingHooks, NoopHooks};
}

pub mod llm {
    pub use mnemos_core::{
        LLMError, LLMProvider, ModelReply, ModelRequest, ModelTask, ModelUsage,
    };
    pub use mnemos_llm::{
        CLASSIFICATION_TEMPLATE, CONSOLIDATION_TEMPLATE, EXTRACTION_TEMPLATE, MockCall,
        MockLLMProvider, PromptRenderer, parse_json_reply,
    };
}

pub mod model {
    pub use mnemos_core::{
        ArchivedTranscript, CommitmentDetails, CommitmentStatus, ContextSnapshot, EntryType,
        EntryUpdate, ExtractionJob, JobProgress, MemoryEntry, PendingLink, SnapshotTrigger, Tier,
        Turn, WorkingState, ARCHIVED_KEY, NEEDS_RECONCILIATION_KEY, SOURCE_IDS_KEY,
    };
    pub use mnemos_core::{estimate_tokens, truncate_to_tokens};
}

pub mod memory {
    pub use mnemos_core::{chain_from, link_successor, resolve_head};
    pub use mnemos_memory::{
        Action, AutoRecall, BlockSections, BlockSource, CheckpointConfig, CheckpointHandler,
        ClassificationPlan, Classifier, ClassifierConfig, Cleaner, CleanupConfig,
        CommitmentTracker, ConsolidationConfig, Consolidator, ContextBlock, ContextBlockBuilder,
        ContextBudget, DEFAULT_BLOCK_TEMPLATE, Decision, ExtractionConfig, ExtractionQueue,
        ExtractionWorker, Extractor, ExtractiveSummarizer, GateConfig, GateDecision, GateSignal,
        GateWeights, HashEmbedder, HeuristicGate, LLMSummarizer, LlmClassifier, LlmExtractor,
        PreCompaction, QueueConfig, RecallConfig, ScheduledTask, Scheduler, Summarizer,
        build_clusters, commitment_line, entry_similarity, resolve_plan,
    };
}

pub mod reports {
    pub use mnemos_memory::{
        CheckpointReport, CleanupReport, ConsolidationReport, EngineStats, ExtractionReport,
        StatsSnapshot,
    };
}

pub mod storage {
    use std::sync::Arc;

    pub use mnemos_core::{
        Embedder, MemoryBackend, MemoryFilter, ScoredEntry, SearchQuery, rank_entries,
    };
    pub use mnemos_storage::{FallbackBackend, InMemoryBackend, StorageConfig, create_backend};
    #[cfg(feature = "redis-storage")]
    pub use mnemos_storage::RedisBackend;
    #[cfg(feature = "sqlite")]
    pub use mnemos_storage::SqliteBackend;

    use crate::error::Result;

    /// An in-memory store wrapped in the same `Arc` the engine takes.
    pub fn in_memory_backend() -> Arc<dyn MemoryBackend> {
        Arc::new(InMemoryBackend::new())
    }

    pub async fn backend_from_config(config: &StorageConfig) -> Result<Arc<dyn MemoryBackend>> {
        create_backend(config).await
    }
}

pub use engine::{EngineBuilder, EngineConfig, MemoryEngine};
pub use error::{MemoryError, Result};
pub use hooks::HostHooks;
pub use llm::LLMProvider;
pub use memory::{ContextBlock, PreCompaction};
pub use model::{EntryType, MemoryEntry, Tier, Turn, WorkingState};
pub use storage::MemoryBackend;

use std::path::Path;
use std::sync::Arc;

/// Build an engine from a YAML config file, with `llm` as the auxiliary model.
pub async fn create_engine_from_config(
    path: impl AsRef<Path>,
    llm: Arc<dyn LLMProvider>,
) -> Result<MemoryEngine> {
    EngineBuilder::from_yaml_file(path)?.llm(llm).build().await
}

/// Build an engine from a YAML string, with `llm` as the auxiliary model.
pub async fn create_engine_from_yaml(yaml: &str, llm: Arc<dyn LLMProvider>) -> Result<MemoryEngine> {
    EngineBuilder::from_yaml(yaml)?.llm(llm).build().await
}
