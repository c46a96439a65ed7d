//! Core types and traits for the mnemos memory engine

pub mod chain;
pub mod entry;
pub mod error;
pub mod job;
pub mod similarity;
pub mod snapshot;
pub mod tokens;
pub mod traits;

pub use chain::{chain_from, link_successor, resolve_head};
pub use entry::{
    ARCHIVED_KEY, CommitmentDetails, CommitmentStatus, EntryType, EntryUpdate, MemoryEntry,
    NEEDS_RECONCILIATION_KEY, SOURCE_IDS_KEY, Tier,
};
pub use error::{MemoryError, Result};
pub use job::{ExtractionJob, JobProgress, PendingLink, Turn};
pub use similarity::{cosine_similarity, jaccard, score_entry, word_set};
pub use snapshot::{ArchivedTranscript, ContextSnapshot, SnapshotTrigger, WorkingState};
pub use tokens::{estimate_tokens, truncate_to_tokens};
pub use traits::backend::rank_entries;
pub use traits::{
    Embedder, LLMError, LLMProvider, MemoryBackend, MemoryFilter, ModelReply, ModelRequest,
    ModelTask, ModelUsage, ScoredEntry, SearchQuery,
};
