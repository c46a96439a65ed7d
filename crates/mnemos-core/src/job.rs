//! Conversation turns and queued extraction work

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::MemoryEntry;

/// One user turn, optionally paired with the assistant reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub owner_id: String,
    pub text: String,
    #[serde(default)]
    pub response: Option<String>,
    pub at: DateTime<Utc>,
}

impl Turn {
    pub fn new(owner_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            text: text.into(),
            response: None,
            at: Utc::now(),
        }
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub turn: Turn,
    pub gate_score: f32,
    pub enqueued_at: DateTime<Utc>,
    /// Times this job has been handed back to the queue after a backend failure.
    #[serde(default)]
    pub requeues: u8,
    #[serde(default)]
    pub progress: JobProgress,
}

/// What an interrupted attempt already did, so a re-queued job resumes
/// instead of extracting and storing again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Candidates extracted earlier and not yet stored.
    #[serde(default)]
    pub candidates: Option<Vec<MemoryEntry>>,
    /// Stored successors whose targets may not all be linked yet.
    #[serde(default)]
    pub pending_links: Vec<PendingLink>,
}

impl JobProgress {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_none() && self.pending_links.is_empty()
    }

    pub fn has_stored(&self, entry_id: &str) -> bool {
        self.pending_links.iter().any(|l| l.successor_id == entry_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingLink {
    pub successor_id: String,
    pub target_ids: Vec<String>,
}

impl ExtractionJob {
    pub fn new(turn: Turn, gate_score: f32) -> Self {
        Self {
            turn,
            gate_score,
            enqueued_at: Utc::now(),
            requeues: 0,
            progress: JobProgress::default(),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.turn.owner_id
    }
}
