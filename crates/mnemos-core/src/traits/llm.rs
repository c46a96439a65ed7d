//! The auxiliary model
//!
//! Extraction, classification and consolidation each make one call per unit
//! of work. Nothing is assumed about the model beyond [`LLMProvider::generate`]:
//! a prompt goes in, text comes out, with a token cost and a latency.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a model call is for. Providers may route or price on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTask {
    Extraction,
    Classification,
    Consolidation,
}

impl ModelTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTask::Extraction => "extraction",
            ModelTask::Classification => "classification",
            ModelTask::Consolidation => "consolidation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub task: ModelTask,
    pub prompt: String,
    /// JSON schema the reply should follow. Providers without native
    /// structured output may ignore it; replies are parsed leniently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ModelRequest {
    pub fn new(task: ModelTask, prompt: impl Into<String>) -> Self {
        Self {
            task,
            prompt: prompt.into(),
            schema: None,
            max_tokens: None,
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn is_structured(&self) -> bool {
        self.schema.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl ModelUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    pub text: String,
    #[serde(default)]
    pub usage: ModelUsage,
    #[serde(default)]
    pub latency_ms: u64,
}

impl ModelReply {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: ModelUsage::default(),
            latency_ms: 0,
        }
    }

    pub fn with_usage(mut self, usage: ModelUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelReply, LLMError>;

    fn provider_name(&self) -> &str;
}

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("Model unavailable: {0}")]
    Unavailable(String),

    #[error("Rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Malformed reply: {0}")]
    Malformed(String),

    #[error("Model error: {0}")]
    Other(String),
}

impl LLMError {
    /// A rejected request fails the same way on a second attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LLMError::Rejected(_))
    }
}

impl From<serde_json::Error> for LLMError {
    fn from(err: serde_json::Error) -> Self {
        LLMError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builder() {
        let request = ModelRequest::new(ModelTask::Classification, "compare")
            .with_schema(json!({"type": "object"}))
            .with_max_tokens(256);
        assert!(request.is_structured());
        assert_eq!(request.max_tokens, Some(256));
        assert_eq!(request.task.as_str(), "classification");
    }

    #[test]
    fn test_usage_total() {
        assert_eq!(ModelUsage::new(120, 30).total(), 150);
    }

    #[test]
    fn test_retryable() {
        assert!(LLMError::Unavailable("down".into()).is_retryable());
        assert!(LLMError::RateLimited { retry_after_ms: Some(500) }.is_retryable());
        assert!(!LLMError::Rejected("too long".into()).is_retryable());
    }
}
