//! Engine configuration loaded from YAML

use std::path::Path;

use serde::{Deserialize, Serialize};

use mnemos_core::{MemoryError, Result};
use mnemos_memory::{
    CheckpointConfig, ClassifierConfig, CleanupConfig, ConsolidationConfig, ContextBudget,
    ExtractionConfig, GateConfig, QueueConfig, RecallConfig,
};
use mnemos_storage::StorageConfig;

/// Every section is optional; a missing section takes its defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub extraction: ExtractionConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub recall: RecallConfig,

    #[serde(default)]
    pub context: ContextBudget,

    #[serde(default)]
    pub consolidation: ConsolidationConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

/// Per-owner live window kept by the engine between turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Turns remembered for novelty, continuity and duplicate checks.
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,
}

fn default_recent_window() -> usize {
    6
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recent_window: default_recent_window(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)
            .map_err(|e| MemoryError::Config(format!("invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MemoryError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.gate.threshold) {
            return Err(MemoryError::Config(format!(
                "gate.threshold must be within 0..=1, got {}",
                self.gate.threshold
            )));
        }
        if self.queue.capacity == 0 || self.queue.batch_size == 0 {
            return Err(MemoryError::Config(
                "queue.capacity and queue.batch_size must be positive".into(),
            ));
        }
        if self.recall.top_n == 0 {
            return Err(MemoryError::Config("recall.top_n must be positive".into()));
        }
        for (name, hour) in [
            ("start", self.consolidation.window_start_hour),
            ("end", self.consolidation.window_end_hour),
        ] {
            if hour.is_some_and(|h| h > 23) {
                return Err(MemoryError::Config(format!(
                    "consolidation.window_{}_hour must be 0-23",
                    name
                )));
            }
        }
        Ok(())
    }
}
