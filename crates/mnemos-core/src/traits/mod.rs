//! Core traits

pub mod backend;
pub mod embedder;
pub mod llm;

pub use backend::{MemoryBackend, MemoryFilter, ScoredEntry, SearchQuery};
pub use embedder::Embedder;
pub use llm::{LLMError, LLMProvider, ModelReply, ModelRequest, ModelTask, ModelUsage};
