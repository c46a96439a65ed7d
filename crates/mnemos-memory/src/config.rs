//! Tunables for every memory component

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mnemos_core::EntryType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateWeights {
    #[serde(default = "default_commitment_weight")]
    pub commitment: f32,
    #[serde(default = "default_preference_weight")]
    pub preference: f32,
    #[serde(default = "default_temporal_weight")]
    pub temporal: f32,
    #[serde(default = "default_entity_weight")]
    pub named_entity: f32,
    #[serde(default = "default_factual_weight")]
    pub factual: f32,
    #[serde(default = "default_emotional_weight")]
    pub emotional: f32,
    #[serde(default = "default_novelty_weight")]
    pub novelty: f32,
}

fn default_commitment_weight() -> f32 {
    0.35
}

fn default_preference_weight() -> f32 {
    0.3
}

fn default_temporal_weight() -> f32 {
    0.15
}

fn default_entity_weight() -> f32 {
    0.15
}

fn default_factual_weight() -> f32 {
    0.25
}

fn default_emotional_weight() -> f32 {
    0.15
}

fn default_novelty_weight() -> f32 {
    0.1
}

impl Default for GateWeights {
    fn default() -> Self {
        Self {
            commitment: default_commitment_weight(),
            preference: default_preference_weight(),
            temporal: default_temporal_weight(),
            named_entity: default_entity_weight(),
            factual: default_factual_weight(),
            emotional: default_emotional_weight(),
            novelty: default_novelty_weight(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_gate_threshold")]
    pub threshold: f32,

    #[serde(default)]
    pub weights: GateWeights,

    /// How many previous turns the novelty check compares against.
    #[serde(default = "default_novelty_window")]
    pub novelty_window: usize,

    /// A turn is novel when its best similarity to recent turns is below this.
    #[serde(default = "default_novelty_threshold")]
    pub novelty_threshold: f32,
}

fn default_gate_threshold() -> f32 {
    0.3
}

fn default_novelty_window() -> usize {
    3
}

fn default_novelty_threshold() -> f32 {
    0.5
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: default_gate_threshold(),
            weights: GateWeights::default(),
            novelty_window: default_novelty_window(),
            novelty_threshold: default_novelty_threshold(),
        }
    }
}

impl GateConfig {
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_capacity() -> usize {
    1000
}

fn default_batch_size() -> usize {
    5
}

fn default_flush_interval_ms() -> u64 {
    5000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl QueueConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_flush_interval_ms(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Similar entries fetched per candidate before classification.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Extra model attempts after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Times a job may go back on the queue after a backend failure.
    #[serde(default = "default_max_requeues")]
    pub max_requeues: u8,

    #[serde(default = "default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,

    /// Hand whole turns to the backend when it extracts on its own.
    #[serde(default = "default_true")]
    pub delegate_to_backend: bool,
}

fn default_top_k() -> usize {
    10
}

fn default_max_retries() -> u32 {
    1
}

fn default_max_requeues() -> u8 {
    1
}

fn default_llm_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_retries: default_max_retries(),
            max_requeues: default_max_requeues(),
            llm_timeout_ms: default_llm_timeout_ms(),
            delegate_to_backend: default_true(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Matches scoring below this are not shown to the classifier.
    #[serde(default = "default_min_match_score")]
    pub min_match_score: f32,
}

fn default_min_match_score() -> f32 {
    0.5
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_match_score: default_min_match_score(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallConfig {
    #[serde(default = "default_recall_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,

    #[serde(default = "default_top_n")]
    pub top_n: usize,

    #[serde(default = "default_recall_budget")]
    pub budget_tokens: u32,

    /// Similarity to recent turns above which a turn counts as a continuation.
    #[serde(default = "default_continuity_threshold")]
    pub continuity_threshold: f32,

    #[serde(default = "default_continuity_window")]
    pub continuity_window: usize,
}

fn default_recall_timeout_ms() -> u64 {
    200
}

fn default_relevance_threshold() -> f32 {
    0.6
}

fn default_top_n() -> usize {
    5
}

fn default_recall_budget() -> u32 {
    800
}

fn default_continuity_threshold() -> f32 {
    0.8
}

fn default_continuity_window() -> usize {
    3
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_recall_timeout_ms(),
            relevance_threshold: default_relevance_threshold(),
            top_n: default_top_n(),
            budget_tokens: default_recall_budget(),
            continuity_threshold: default_continuity_threshold(),
            continuity_window: default_continuity_window(),
        }
    }
}

impl RecallConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Token caps for each section of an injected block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBudget {
    #[serde(default = "default_total_tokens")]
    pub total: u32,

    #[serde(default = "default_profile_tokens")]
    pub profile: u32,

    #[serde(default = "default_relevant_tokens")]
    pub relevant: u32,

    #[serde(default = "default_commitment_tokens")]
    pub commitments: u32,

    #[serde(default = "default_session_tokens")]
    pub session: u32,

    /// Active commitments due within this many hours are shown.
    #[serde(default = "default_commitment_horizon_hours")]
    pub commitment_horizon_hours: i64,
}

fn default_total_tokens() -> u32 {
    1000
}

fn default_profile_tokens() -> u32 {
    150
}

fn default_relevant_tokens() -> u32 {
    500
}

fn default_commitment_tokens() -> u32 {
    200
}

fn default_session_tokens() -> u32 {
    150
}

fn default_commitment_horizon_hours() -> i64 {
    72
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            total: default_total_tokens(),
            profile: default_profile_tokens(),
            relevant: default_relevant_tokens(),
            commitments: default_commitment_tokens(),
            session: default_session_tokens(),
            commitment_horizon_hours: default_commitment_horizon_hours(),
        }
    }
}

impl ContextBudget {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn allocated(&self) -> u32 {
        self.profile + self.relevant + self.commitments + self.session
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_daily_hours")]
    pub interval_hours: u64,

    #[serde(default = "default_min_age_days")]
    pub min_age_days: i64,

    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,

    /// UTC hour range `[start, end)` when scheduled runs may start. Both unset
    /// means any hour.
    #[serde(default = "default_window_start")]
    pub window_start_hour: Option<u32>,

    #[serde(default = "default_window_end")]
    pub window_end_hour: Option<u32>,
}

fn default_daily_hours() -> u64 {
    24
}

fn default_min_age_days() -> i64 {
    7
}

fn default_similarity_threshold() -> f32 {
    0.85
}

fn default_min_cluster_size() -> usize {
    3
}

fn default_window_start() -> Option<u32> {
    Some(2)
}

fn default_window_end() -> Option<u32> {
    Some(5)
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_hours: default_daily_hours(),
            min_age_days: default_min_age_days(),
            similarity_threshold: default_similarity_threshold(),
            min_cluster_size: default_min_cluster_size(),
            window_start_hour: default_window_start(),
            window_end_hour: default_window_end(),
        }
    }
}

impl ConsolidationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.max(1) * 3600)
    }

    /// Whether `hour` (0-23, UTC) falls in the low-activity window. Windows
    /// may wrap midnight.
    pub fn in_window(&self, hour: u32) -> bool {
        match (self.window_start_hour, self.window_end_hour) {
            (Some(start), Some(end)) if start < end => hour >= start && hour < end,
            (Some(start), Some(end)) if start > end => hour >= start || hour < end,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_daily_hours")]
    pub interval_hours: u64,

    /// Days after which a current entry of the given type is archived to L3.
    /// Types not listed are kept indefinitely.
    #[serde(default = "default_type_retention")]
    pub retention_days: HashMap<EntryType, i64>,

    #[serde(default = "default_retention_days")]
    pub snapshot_retention_days: i64,

    #[serde(default = "default_retention_days")]
    pub transcript_retention_days: i64,
}

fn default_type_retention() -> HashMap<EntryType, i64> {
    HashMap::from([(EntryType::Event, 30), (EntryType::Task, 14)])
}

fn default_retention_days() -> i64 {
    7
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_hours: default_daily_hours(),
            retention_days: default_type_retention(),
            snapshot_retention_days: default_retention_days(),
            transcript_retention_days: default_retention_days(),
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.max(1) * 3600)
    }

    pub fn snapshot_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.snapshot_retention_days)
    }

    pub fn transcript_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.transcript_retention_days)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Upper bound on the queue flush before compaction proceeds anyway.
    #[serde(default = "default_flush_deadline_ms")]
    pub flush_deadline_ms: u64,

    #[serde(default = "default_true")]
    pub archive_transcripts: bool,
}

fn default_flush_deadline_ms() -> u64 {
    2000
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            flush_deadline_ms: default_flush_deadline_ms(),
            archive_transcripts: default_true(),
        }
    }
}

impl CheckpointConfig {
    pub fn flush_deadline(&self) -> Duration {
        Duration::from_millis(self.flush_deadline_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(GateConfig::default().threshold, 0.3);
        let queue = QueueConfig::default();
        assert_eq!(queue.capacity, 1000);
        assert_eq!(queue.batch_size, 5);
        assert_eq!(queue.flush_interval(), Duration::from_secs(5));
        assert_eq!(ExtractionConfig::default().top_k, 10);

        let recall = RecallConfig::default();
        assert_eq!(recall.timeout(), Duration::from_millis(200));
        assert_eq!(recall.top_n, 5);
        assert_eq!(recall.budget_tokens, 800);

        let budget = ContextBudget::default();
        assert_eq!(budget.total, 1000);
        assert_eq!(budget.allocated(), 1000);

        let consolidation = ConsolidationConfig::default();
        assert_eq!(consolidation.min_cluster_size, 3);
        assert_eq!(consolidation.interval(), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
threshold: 0.5
weights:
  commitment: 0.6
"#;
        let config: GateConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.threshold, 0.5);
        assert_eq!(config.weights.commitment, 0.6);
        assert_eq!(config.weights.preference, 0.3);
        assert_eq!(config.novelty_window, 3);
    }

    #[test]
    fn test_retention_by_type_yaml() {
        let yaml = r#"
retention_days:
  event: 10
  task: 3
snapshot_retention_days: 2
"#;
        let config: CleanupConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.retention_days.get(&EntryType::Event), Some(&10));
        assert_eq!(config.retention_days.get(&EntryType::Fact), None);
        assert_eq!(config.snapshot_retention(), chrono::Duration::days(2));
        assert_eq!(config.transcript_retention_days, 7);
    }

    #[test]
    fn test_low_activity_window() {
        let config = ConsolidationConfig::default();
        assert!(config.in_window(3));
        assert!(!config.in_window(12));

        let wrapping = ConsolidationConfig {
            window_start_hour: Some(22),
            window_end_hour: Some(4),
            ..Default::default()
        };
        assert!(wrapping.in_window(23));
        assert!(wrapping.in_window(1));
        assert!(!wrapping.in_window(10));

        let open = ConsolidationConfig {
            window_start_hour: None,
            window_end_hour: None,
            ..Default::default()
        };
        assert!(open.in_window(12));
    }
}
