//! Auxiliary model helpers: prompts, structured output parsing, and a scripted mock

pub mod mock;
pub mod prompts;
pub mod structured;

pub use mnemos_core::{LLMError, LLMProvider, ModelReply, ModelRequest, ModelTask, ModelUsage};
pub use mock::{MockCall, MockLLMProvider};
pub use prompts::{
    CLASSIFICATION_TEMPLATE, CONSOLIDATION_TEMPLATE, EXTRACTION_TEMPLATE, PromptRenderer,
};
pub use structured::parse_json_reply;
