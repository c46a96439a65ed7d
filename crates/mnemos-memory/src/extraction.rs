//! Candidate extraction from a single turn

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use mnemos_core::{
    EntryType, LLMProvider, MemoryEntry, ModelRequest, ModelTask, Result, Turn,
};
use mnemos_llm::{EXTRACTION_TEMPLATE, PromptRenderer, parse_json_reply};

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Candidate entries (commitments included) for `turn`. Nothing is stored.
    async fn extract(&self, turn: &Turn) -> Result<Vec<MemoryEntry>>;
}

#[derive(Debug, Deserialize)]
struct ExtractionReply {
    #[serde(default)]
    memories: Vec<CandidateMemory>,
    #[serde(default)]
    commitments: Vec<CandidateCommitment>,
}

#[derive(Debug, Deserialize)]
struct CandidateMemory {
    content: String,
    #[serde(default, rename = "type")]
    entry_type: Option<String>,
    #[serde(default = "default_importance")]
    importance: i64,
}

#[derive(Debug, Deserialize)]
struct CandidateCommitment {
    content: String,
    #[serde(default)]
    target_person: Option<String>,
    #[serde(default)]
    due_at: Option<String>,
}

fn default_importance() -> i64 {
    5
}

pub struct LlmExtractor {
    llm: Arc<dyn LLMProvider>,
    renderer: Arc<PromptRenderer>,
}

impl LlmExtractor {
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

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "memories": {"type": "array"},
                "commitments": {"type": "array"}
            },
            "required": ["memories", "commitments"]
        })
    }

    fn into_entries(owner_id: &str, reply: ExtractionReply) -> Vec<MemoryEntry> {
        let mut entries = Vec::new();

        for memory in reply.memories {
            let content = memory.content.trim();
            if content.is_empty() {
                continue;
            }
            let entry_type = match memory.entry_type.as_deref().map(EntryType::from_str) {
                Some(Ok(t)) => t,
                Some(Err(e)) => {
                    debug!("[extractor] {}; storing as fact", e);
                    EntryType::Fact
                }
                None => EntryType::Fact,
            };
            let importance = memory.importance.clamp(1, 10) as u8;
            if entry_type == EntryType::Commitment {
                let mut entry = MemoryEntry::commitment(owner_id, content, None, None);
                entry.importance = importance;
                entries.push(entry);
            } else {
                entries.push(MemoryEntry::new(owner_id, content, entry_type, importance));
            }
        }

        for commitment in reply.commitments {
            let content = commitment.content.trim();
            if content.is_empty() {
                continue;
            }
            let due_at = commitment.due_at.as_deref().and_then(parse_due);
            let target = commitment
                .target_person
                .filter(|p| !p.trim().is_empty() && p != "null");
            entries.push(MemoryEntry::commitment(owner_id, content, target, due_at));
        }

        entries
    }
}

fn parse_due(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(_) => {
            if raw.trim() != "null" {
                warn!("[extractor] ignoring unparseable due date {:?}", raw);
            }
            None
        }
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(&self, turn: &Turn) -> Result<Vec<MemoryEntry>> {
        let prompt = self.renderer.render(
            EXTRACTION_TEMPLATE,
            json!({
                "turn": turn.text,
                "response": turn.response,
                "now": turn.at.to_rfc3339_opts(SecondsFormat::Secs, true),
            }),
        )?;

        let request = ModelRequest::new(ModelTask::Extraction, prompt).with_schema(Self::schema());
        let reply = self.llm.generate(&request).await?;
        let reply: ExtractionReply = parse_json_reply(&reply.text)?;
        Ok(Self::into_entries(&turn.owner_id, reply))
    }
}
