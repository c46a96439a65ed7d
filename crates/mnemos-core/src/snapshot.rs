//! Working-state snapshots and archived transcripts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    TurnSwitch,
    IdleTimeout,
    PreCompaction,
    Manual,
}

/// What the agent was doing when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkingState {
    #[serde(default)]
    pub active_task: Option<String>,
    #[serde(default)]
    pub last_action: Option<String>,
    #[serde(default)]
    pub next_step: Option<String>,
    #[serde(default)]
    pub session_ref: Option<String>,
}

impl WorkingState {
    pub fn is_empty(&self) -> bool {
        self.active_task.is_none()
            && self.last_action.is_none()
            && self.next_step.is_none()
            && self.session_ref.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: String,
    pub owner_id: String,
    pub trigger: SnapshotTrigger,
    pub state: WorkingState,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consumed_at: Option<DateTime<Utc>>,
}

impl ContextSnapshot {
    pub fn new(owner_id: impl Into<String>, trigger: SnapshotTrigger, state: WorkingState) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            trigger,
            state,
            captured_at: Utc::now(),
            expires_at: None,
            consumed_at: None,
        }
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.expires_at = Some(self.captured_at + retention);
        self
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Raw transcript kept from just before a compaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedTranscript {
    pub transcript_ref: String,
    pub owner_id: String,
    pub content: String,
    pub archived_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_retention() {
        let snapshot = ContextSnapshot::new("u1", SnapshotTrigger::PreCompaction, WorkingState::default())
            .with_retention(chrono::Duration::days(7));
        assert!(!snapshot.is_expired(Utc::now()));
        assert!(snapshot.is_expired(Utc::now() + chrono::Duration::days(8)));
    }

    #[test]
    fn test_trigger_serialize() {
        let json = serde_json::to_string(&SnapshotTrigger::PreCompaction).unwrap();
        assert_eq!(json, "\"pre_compaction\"");
    }
}
