//! Memory entries and commitments

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// Metadata key listing the ids a consolidated entry subsumes.
pub const SOURCE_IDS_KEY: &str = "source_ids";
/// Metadata key set when classification could not decide and the entry was added anyway.
pub const NEEDS_RECONCILIATION_KEY: &str = "needs_reconciliation";
/// Metadata key set by cleanup when an entry is demoted for age.
pub const ARCHIVED_KEY: &str = "archived";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Fact,
    Preference,
    Event,
    Insight,
    Relationship,
    Commitment,
    Task,
}

impl EntryType {
    pub const ALL: [EntryType; 7] = [
        EntryType::Fact,
        EntryType::Preference,
        EntryType::Event,
        EntryType::Insight,
        EntryType::Relationship,
        EntryType::Commitment,
        EntryType::Task,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Fact => "fact",
            EntryType::Preference => "preference",
            EntryType::Event => "event",
            EntryType::Insight => "insight",
            EntryType::Relationship => "relationship",
            EntryType::Commitment => "commitment",
            EntryType::Task => "task",
        }
    }

    /// Types that describe the owner rather than something that happened.
    pub fn is_profile(&self) -> bool {
        matches!(
            self,
            EntryType::Fact | EntryType::Preference | EntryType::Relationship
        )
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fact" => Ok(EntryType::Fact),
            "preference" => Ok(EntryType::Preference),
            "event" => Ok(EntryType::Event),
            "insight" => Ok(EntryType::Insight),
            "relationship" => Ok(EntryType::Relationship),
            "commitment" => Ok(EntryType::Commitment),
            "task" => Ok(EntryType::Task),
            other => Err(MemoryError::Parse(format!("unknown entry type: {}", other))),
        }
    }
}

/// Storage tier. L1 is a transient in-context render and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Tier {
    #[default]
    L2,
    L3,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::L2 => "L2",
            Tier::L3 => "L3",
        }
    }
}

impl FromStr for Tier {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "L2" | "l2" => Ok(Tier::L2),
            "L3" | "l3" => Ok(Tier::L3),
            other => Err(MemoryError::Parse(format!("unknown tier: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommitmentStatus {
    #[default]
    Active,
    Completed,
    Cancelled,
}

impl CommitmentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommitmentStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommitmentStatus::Active => "active",
            CommitmentStatus::Completed => "completed",
            CommitmentStatus::Cancelled => "cancelled",
        }
    }
}

/// Lifecycle fields carried by COMMITMENT entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CommitmentDetails {
    #[serde(default)]
    pub target_person: Option<String>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: CommitmentStatus,
}

impl CommitmentDetails {
    pub fn transition(&mut self, to: CommitmentStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(MemoryError::InvalidTransition(format!(
                "commitment is already {}",
                self.status.as_str()
            )));
        }
        if to == CommitmentStatus::Active {
            return Err(MemoryError::InvalidTransition(
                "commitment is already active".into(),
            ));
        }
        self.status = to;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub owner_id: String,
    pub content: String,
    pub entry_type: EntryType,
    pub importance: u8,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub valid_from: DateTime<Utc>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub superseded_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commitment: Option<CommitmentDetails>,
}

impl MemoryEntry {
    pub fn new(
        owner_id: impl Into<String>,
        content: impl Into<String>,
        entry_type: EntryType,
        importance: u8,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            content: content.into(),
            entry_type,
            importance: clamp_importance(importance),
            tier: Tier::L2,
            embedding: Vec::new(),
            valid_from: now,
            valid_until: None,
            superseded_by: None,
            created_at: now,
            metadata: HashMap::new(),
            commitment: if entry_type == EntryType::Commitment {
                Some(CommitmentDetails::default())
            } else {
                None
            },
        }
    }

    pub fn commitment(
        owner_id: impl Into<String>,
        content: impl Into<String>,
        target_person: Option<String>,
        due_at: Option<DateTime<Utc>>,
    ) -> Self {
        let mut entry = Self::new(owner_id, content, EntryType::Commitment, 6);
        entry.commitment = Some(CommitmentDetails {
            target_person,
            due_at,
            status: CommitmentStatus::Active,
        });
        entry
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.valid_from = at;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_current(&self) -> bool {
        self.superseded_by.is_none()
    }

    /// Whether the validity window contains `at`.
    pub fn valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_until.map_or(true, |until| until > at)
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.metadata
            .get(SOURCE_IDS_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn needs_reconciliation(&self) -> bool {
        self.metadata
            .get(NEEDS_RECONCILIATION_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn is_active_commitment(&self) -> bool {
        self.commitment
            .as_ref()
            .is_some_and(|c| c.status == CommitmentStatus::Active)
    }

    /// Move this entry's commitment to `to`, in place.
    pub fn transition_commitment(&mut self, to: CommitmentStatus) -> Result<()> {
        match self.commitment.as_mut() {
            Some(details) => details.transition(to),
            None => Err(MemoryError::InvalidTransition(format!(
                "{} is not a commitment",
                self.id
            ))),
        }
    }
}

pub fn clamp_importance(importance: u8) -> u8 {
    importance.clamp(1, 10)
}

/// Partial in-place update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryUpdate {
    pub content: Option<String>,
    pub importance: Option<u8>,
    pub tier: Option<Tier>,
    pub embedding: Option<Vec<f32>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    pub commitment: Option<CommitmentDetails>,
}

impl EntryUpdate {
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn importance(mut self, importance: u8) -> Self {
        self.importance = Some(clamp_importance(importance));
        self
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn commitment(mut self, details: CommitmentDetails) -> Self {
        self.commitment = Some(details);
        self
    }

    /// Apply to an entry. Identity, `valid_from` and `superseded_by` are never touched here.
    pub fn apply_to(&self, entry: &mut MemoryEntry) {
        if let Some(content) = &self.content {
            entry.content = content.clone();
        }
        if let Some(importance) = self.importance {
            entry.importance = clamp_importance(importance);
        }
        if let Some(tier) = self.tier {
            entry.tier = tier;
        }
        if let Some(embedding) = &self.embedding {
            entry.embedding = embedding.clone();
        }
        if let Some(until) = self.valid_until {
            entry.valid_until = Some(until);
        }
        if let Some(metadata) = &self.metadata {
            entry.metadata.extend(metadata.clone());
        }
        if let Some(details) = &self.commitment {
            entry.commitment = Some(details.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_type_parse() {
        assert_eq!("FACT".parse::<EntryType>().unwrap(), EntryType::Fact);
        assert_eq!(" preference ".parse::<EntryType>().unwrap(), EntryType::Preference);
        assert!("opinion".parse::<EntryType>().is_err());
    }

    #[test]
    fn test_entry_type_serialize() {
        let json = serde_json::to_string(&EntryType::Relationship).unwrap();
        assert_eq!(json, "\"relationship\"");
    }

    #[test]
    fn test_importance_clamped() {
        let entry = MemoryEntry::new("u1", "x", EntryType::Fact, 42);
        assert_eq!(entry.importance, 10);
        let entry = MemoryEntry::new("u1", "x", EntryType::Fact, 0);
        assert_eq!(entry.importance, 1);
    }

    #[test]
    fn test_commitment_transitions_are_terminal() {
        let mut entry = MemoryEntry::commitment("u1", "send the report", None, None);
        let details = entry.commitment.as_mut().unwrap();
        details.transition(CommitmentStatus::Completed).unwrap();
        assert!(details.transition(CommitmentStatus::Cancelled).is_err());
        assert!(details.transition(CommitmentStatus::Active).is_err());
    }

    #[test]
    fn test_valid_at_window() {
        let t0 = Utc::now() - chrono::Duration::days(2);
        let mut entry = MemoryEntry::new("u1", "x", EntryType::Fact, 5).with_created_at(t0);
        assert!(entry.valid_at(Utc::now()));
        entry.valid_until = Some(t0 + chrono::Duration::days(1));
        assert!(entry.valid_at(t0 + chrono::Duration::hours(1)));
        assert!(!entry.valid_at(Utc::now()));
    }

    #[test]
    fn test_update_keeps_valid_from() {
        let t0 = Utc::now() - chrono::Duration::days(3);
        let mut entry = MemoryEntry::new("u1", "likes tea", EntryType::Preference, 4)
            .with_created_at(t0);
        EntryUpdate::default()
            .content("likes green tea")
            .importance(6)
            .apply_to(&mut entry);
        assert_eq!(entry.content, "likes green tea");
        assert_eq!(entry.importance, 6);
        assert_eq!(entry.valid_from, t0);
    }

    #[test]
    fn test_source_ids_roundtrip() {
        let entry = MemoryEntry::new("u1", "summary", EntryType::Insight, 5)
            .with_metadata(SOURCE_IDS_KEY, serde_json::json!(["a", "b"]));
        assert_eq!(entry.source_ids(), vec!["a".to_string(), "b".to_string()]);
    }
}
