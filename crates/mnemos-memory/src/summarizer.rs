//! Summarizers that turn a cluster of related entries into one statement

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use mnemos_core::{LLMProvider, MemoryEntry, ModelRequest, ModelTask, Result};
use mnemos_llm::{CONSOLIDATION_TEMPLATE, PromptRenderer};

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, members: &[MemoryEntry]) -> Result<String>;
}

pub struct LLMSummarizer {
    llm: Arc<dyn LLMProvider>,
    renderer: Arc<PromptRenderer>,
}

impl LLMSummarizer {
    pub fn new(llm: Arc<dyn LLMProvider>) -> Self {
        Self {
            llm,
            renderer: Arc::new(PromptRenderer::new()),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<PromptRenderer>) -> Self {
        self.renderer = renderer;
        self
    }
}

#[async_trait]
impl Summarizer for LLMSummarizer {
    async fn summarize(&self, members: &[MemoryEntry]) -> Result<String> {
        if members.is_empty() {
            return Ok(String::new());
        }
        let contents: Vec<&str> = members.iter().map(|m| m.content.as_str()).collect();
        let prompt = self
            .renderer
            .render(CONSOLIDATION_TEMPLATE, json!({ "members": contents }))?;

        let reply = self
            .llm
            .generate(&ModelRequest::new(ModelTask::Consolidation, prompt))
            .await?;
        Ok(reply.text.trim().to_string())
    }
}

/// Joins the distinct member statements, most important first. Used when no
/// model is configured.
pub struct ExtractiveSummarizer {
    separator: String,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self {
            separator: "; ".to_string(),
        }
    }
}

impl ExtractiveSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, members: &[MemoryEntry]) -> Result<String> {
        let mut ordered: Vec<&MemoryEntry> = members.iter().collect();
        ordered.sort_by(|a, b| {
            b.importance
                .cmp(&a.importance)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let mut seen = Vec::<String>::new();
        let mut parts = Vec::new();
        for entry in ordered {
            let text = entry.content.trim().trim_end_matches('.');
            let key = text.to_lowercase();
            if text.is_empty() || seen.contains(&key) {
                continue;
            }
            seen.push(key);
            parts.push(text.to_string());
        }
        Ok(parts.join(&self.separator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemos_core::EntryType;
    use mnemos_llm::MockLLMProvider;

    fn fact(content: &str, importance: u8) -> MemoryEntry {
        MemoryEntry::new("u1", content, EntryType::Fact, importance)
    }

    #[tokio::test]
    async fn test_llm_summarizer_renders_members() {
        let mock = MockLLMProvider::new("summarizer");
        mock.set_response("  User is vegetarian and avoids dairy.  ");
        let summarizer = LLMSummarizer::new(Arc::new(mock.clone()));

        let summary = summarizer
            .summarize(&[fact("User is vegetarian", 5), fact("User avoids dairy", 4)])
            .await
            .unwrap();
        assert_eq!(summary, "User is vegetarian and avoids dairy.");

        let prompt = &mock.last_call().unwrap().request.prompt;
        assert!(prompt.contains("- User is vegetarian"));
        assert!(prompt.contains("- User avoids dairy"));
    }

    #[tokio::test]
    async fn test_llm_summarizer_propagates_error() {
        let mock = MockLLMProvider::new("summarizer");
        mock.set_error("offline");
        let summarizer = LLMSummarizer::new(Arc::new(mock));
        assert!(summarizer.summarize(&[fact("a", 1)]).await.is_err());
    }

    #[tokio::test]
    async fn test_extractive_orders_and_dedupes() {
        let summarizer = ExtractiveSummarizer::new();
        let summary = summarizer
            .summarize(&[
                fact("User avoids dairy.", 4),
                fact("User is vegetarian", 8),
                fact("user avoids dairy", 3),
            ])
            .await
            .unwrap();
        assert_eq!(summary, "User is vegetarian; User avoids dairy");
    }
}
