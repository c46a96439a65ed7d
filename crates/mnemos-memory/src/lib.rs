//! Extraction, supersession, recall and compaction handling for the mnemos memory engine

mod checkpoint;
mod classifier;
mod cleanup;
mod commitments;
mod config;
mod consolidation;
mod context_block;
mod embedding;
mod extraction;
mod gate;
mod queue;
mod recall;
mod reports;
mod scheduler;
mod summarizer;
mod worker;

pub use checkpoint::{CheckpointHandler, PreCompaction};
pub use classifier::{
    Action, ClassificationPlan, Classifier, Decision, LlmClassifier, resolve_plan,
};
pub use cleanup::Cleaner;
pub use commitments::CommitmentTracker;
pub use config::{
    CheckpointConfig, ClassifierConfig, CleanupConfig, ConsolidationConfig, ContextBudget,
    ExtractionConfig, GateConfig, GateWeights, QueueConfig, RecallConfig,
};
pub use consolidation::{Consolidator, build_clusters, entry_similarity};
pub use context_block::{
    BlockSections, BlockSource, ContextBlock, ContextBlockBuilder, DEFAULT_BLOCK_TEMPLATE,
    commitment_line,
};
pub use embedding::HashEmbedder;
pub use extraction::{Extractor, LlmExtractor};
pub use gate::{GateDecision, GateSignal, HeuristicGate};
pub use queue::ExtractionQueue;
pub use recall::AutoRecall;
pub use reports::{
    CheckpointReport, CleanupReport, ConsolidationReport, EngineStats, ExtractionReport,
    StatsSnapshot,
};
pub use scheduler::{ScheduledTask, Scheduler};
pub use summarizer::{ExtractiveSummarizer, LLMSummarizer, Summarizer};
pub use worker::ExtractionWorker;
