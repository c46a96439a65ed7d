//! Supersession classifier
//!
//! Decides how a candidate relates to what is already stored. The model's
//! answer is advisory: [`resolve_plan`] turns it into a plan the store can
//! apply safely, falling back to a flagged ADD whenever the answer is unusable.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use mnemos_core::{
    LLMProvider, MemoryEntry, ModelRequest, ModelTask, Result, ScoredEntry,
};
use mnemos_llm::{CLASSIFICATION_TEMPLATE, PromptRenderer, parse_json_reply};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    #[serde(alias = "add")]
    Add,
    #[serde(alias = "update")]
    Update,
    #[serde(alias = "supersede")]
    Supersede,
    #[serde(alias = "noop")]
    Noop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub reason: String,
    /// Merged text for UPDATE.
    #[serde(default)]
    pub merged_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassificationPlan {
    Add {
        /// Added because the decision was ambiguous.
        flagged: bool,
        reason: String,
    },
    Update {
        target_id: String,
        merged_content: String,
        reason: String,
    },
    /// Every target points at the single new entry.
    Supersede {
        target_ids: Vec<String>,
        reason: String,
    },
    Noop {
        target_id: Option<String>,
        reason: String,
    },
}

impl ClassificationPlan {
    fn ambiguous(reason: impl Into<String>) -> Self {
        ClassificationPlan::Add {
            flagged: true,
            reason: reason.into(),
        }
    }

    pub fn action(&self) -> Action {
        match self {
            ClassificationPlan::Add { .. } => Action::Add,
            ClassificationPlan::Update { .. } => Action::Update,
            ClassificationPlan::Supersede { .. } => Action::Supersede,
            ClassificationPlan::Noop { .. } => Action::Noop,
        }
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Raw decisions for `candidate` against `matches`.
    async fn classify(
        &self,
        candidate: &MemoryEntry,
        matches: &[ScoredEntry],
    ) -> Result<Vec<Decision>>;

    /// Classify and resolve into an applicable plan. Never fails.
    async fn plan(&self, candidate: &MemoryEntry, matches: &[ScoredEntry]) -> ClassificationPlan {
        if matches.is_empty() {
            return ClassificationPlan::Add {
                flagged: false,
                reason: "no similar entries".into(),
            };
        }
        match self.classify(candidate, matches).await {
            Ok(decisions) => resolve_plan(candidate, &decisions, matches),
            Err(e) => {
                warn!("[classifier] falling back to ADD: {}", e);
                ClassificationPlan::ambiguous(format!("classifier failed: {}", e))
            }
        }
    }
}

/// Validate raw decisions against the matches that were actually shown.
///
/// - Decisions naming unknown targets, or UPDATE/SUPERSEDE/NOOP without a
///   target, are discarded.
/// - All SUPERSEDE targets are retired together.
/// - Mixed actions, several UPDATE targets, or nothing usable give a flagged ADD.
pub fn resolve_plan(
    candidate: &MemoryEntry,
    decisions: &[Decision],
    matches: &[ScoredEntry],
) -> ClassificationPlan {
    let known = |id: &str| matches.iter().any(|m| m.entry.id == id);

    let valid: Vec<&Decision> = decisions
        .iter()
        .filter(|d| match (&d.action, &d.target_id) {
            (Action::Add, _) => true,
            (Action::Noop, None) => true,
            (_, Some(target)) => known(target),
            (_, None) => false,
        })
        .collect();

    if valid.is_empty() {
        return ClassificationPlan::ambiguous("no usable decision");
    }

    let actions: BTreeSet<Action> = valid.iter().map(|d| d.action).collect();
    if actions.len() > 1 {
        return ClassificationPlan::ambiguous(format!("conflicting actions {:?}", actions));
    }

    let reason = valid
        .iter()
        .map(|d| d.reason.as_str())
        .filter(|r| !r.is_empty())
        .collect::<Vec<_>>()
        .join("; ");

    let mut targets: Vec<String> = Vec::new();
    for d in &valid {
        if let Some(t) = &d.target_id {
            if !targets.contains(t) {
                targets.push(t.clone());
            }
        }
    }

    match valid[0].action {
        Action::Add => ClassificationPlan::Add {
            flagged: false,
            reason,
        },
        Action::Noop => ClassificationPlan::Noop {
            target_id: targets.into_iter().next(),
            reason,
        },
        Action::Supersede => ClassificationPlan::Supersede {
            target_ids: targets,
            reason,
        },
        Action::Update => {
            if targets.len() != 1 {
                return ClassificationPlan::ambiguous("UPDATE named several targets");
            }
            let merged_content = valid
                .iter()
                .find_map(|d| d.merged_content.clone())
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| candidate.content.clone());
            ClassificationPlan::Update {
                target_id: targets.remove(0),
                merged_content,
                reason,
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClassificationReply {
    #[serde(default)]
    decisions: Vec<Decision>,
}

/// Asks the auxiliary model to classify.
pub struct LlmClassifier {
    llm: Arc<dyn LLMProvider>,
    renderer: Arc<PromptRenderer>,
}

impl LlmClassifier {
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
                "decisions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "action": {"enum": ["ADD", "UPDATE", "SUPERSEDE", "NOOP"]},
                            "target_id": {"type": ["string", "null"]},
                            "reason": {"type": "string"},
                            "merged_content": {"type": ["string", "null"]}
                        },
                        "required": ["action"]
                    }
                }
            },
            "required": ["decisions"]
        })
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(
        &self,
        candidate: &MemoryEntry,
        matches: &[ScoredEntry],
    ) -> Result<Vec<Decision>> {
        let rendered_matches: Vec<_> = matches
            .iter()
            .map(|m| {
                json!({
                    "id": m.entry.id,
                    "entry_type": m.entry.entry_type.as_str(),
                    "score": format!("{:.2}", m.score),
                    "content": m.entry.content,
                })
            })
            .collect();

        let prompt = self.renderer.render(
            CLASSIFICATION_TEMPLATE,
            json!({
                "candidate": {
                    "content": candidate.content,
                    "entry_type": candidate.entry_type.as_str(),
                },
                "matches": rendered_matches,
            }),
        )?;

        let request =
            ModelRequest::new(ModelTask::Classification, prompt).with_schema(Self::schema());
        let reply = self.llm.generate(&request).await?;
        let reply: ClassificationReply = parse_json_reply(&reply.text)?;
        debug!(
            "[classifier] {} decision(s) for '{}'",
            reply.decisions.len(),
            candidate.content
        );
        Ok(reply.decisions)
    }
}
