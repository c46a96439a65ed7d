//! Prompt templates for the auxiliary model

use minijinja::Environment;
use serde::Serialize;

use mnemos_core::{MemoryError, Result};

pub const EXTRACTION_TEMPLATE: &str = "extraction";
pub const CLASSIFICATION_TEMPLATE: &str = "classification";
pub const CONSOLIDATION_TEMPLATE: &str = "consolidation";

pub const DEFAULT_EXTRACTION_PROMPT: &str = r#"Extract durable memories about the user from the conversation turn below.
Only keep information that will still matter in a later conversation: facts about the user, preferences, relationships, notable events, insights, tasks, and promises.
Ignore greetings, chit-chat, and anything only relevant to the current exchange.

Current time: {{ now }}

User: {{ turn }}
{% if response %}Assistant: {{ response }}
{% endif %}
Respond with JSON only:
{"memories": [{"content": "<one self-contained sentence>", "type": "fact|preference|event|insight|relationship|task", "importance": 1-10}],
 "commitments": [{"content": "<what was promised>", "target_person": "<who it is for or null>", "due_at": "<RFC3339 timestamp or null>"}]}
Use empty arrays when there is nothing to remember."#;

pub const DEFAULT_CLASSIFICATION_PROMPT: &str = r#"A new memory was extracted. Decide how it relates to the existing memories.

New memory ({{ candidate.entry_type }}): {{ candidate.content }}

Existing memories:
{% for m in matches %}- id={{ m.id }} ({{ m.entry_type }}, similarity {{ m.score }}): {{ m.content }}
{% endfor %}
Actions:
- ADD: the new memory is novel.
- UPDATE: it refines one existing memory without contradicting it. Give the merged text in "merged_content".
- SUPERSEDE: it contradicts existing memories, which are now out of date.
- NOOP: it duplicates or is already covered by an existing memory.

Respond with JSON only:
{"decisions": [{"action": "ADD|UPDATE|SUPERSEDE|NOOP", "target_id": "<existing id or null>", "reason": "<short reason>", "merged_content": "<only for UPDATE>"}]}"#;

pub const DEFAULT_CONSOLIDATION_PROMPT: &str = r#"The following memories describe the same topic. Write one concise statement that preserves every durable detail they contain. Do not add anything new.

{% for m in members %}- {{ m }}
{% endfor %}
Statement:"#;

pub struct PromptRenderer {
    env: Environment<'static>,
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| minijinja::AutoEscape::None);
        let mut renderer = Self { env };
        // Built-in templates are static and known to parse.
        for (name, source) in [
            (EXTRACTION_TEMPLATE, DEFAULT_EXTRACTION_PROMPT),
            (CLASSIFICATION_TEMPLATE, DEFAULT_CLASSIFICATION_PROMPT),
            (CONSOLIDATION_TEMPLATE, DEFAULT_CONSOLIDATION_PROMPT),
        ] {
            if let Err(e) = renderer.env.add_template(name, source) {
                tracing::error!("Invalid built-in prompt {}: {}", name, e);
            }
        }
        renderer
    }

    /// Replace one of the built-in templates.
    pub fn with_template(mut self, name: &'static str, source: impl Into<String>) -> Result<Self> {
        self.env
            .add_template_owned(name, source.into())
            .map_err(|e| MemoryError::Config(format!("template {}: {}", name, e)))?;
        Ok(self)
    }

    pub fn render<S: Serialize>(&self, name: &str, context: S) -> Result<String> {
        let tmpl = self
            .env
            .get_template(name)
            .map_err(|e| MemoryError::Config(e.to_string()))?;
        tmpl.render(context)
            .map_err(|e| MemoryError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_extraction() {
        let renderer = PromptRenderer::new();
        let prompt = renderer
            .render(
                EXTRACTION_TEMPLATE,
                json!({"turn": "I prefer dark mode", "response": null, "now": "2026-01-01T00:00:00Z"}),
            )
            .unwrap();
        assert!(prompt.contains("User: I prefer dark mode"));
        assert!(!prompt.contains("Assistant:"));
    }

    #[test]
    fn test_render_classification_lists_matches() {
        let renderer = PromptRenderer::new();
        let prompt = renderer
            .render(
                CLASSIFICATION_TEMPLATE,
                json!({
                    "candidate": {"content": "prefers light mode", "entry_type": "preference"},
                    "matches": [{"id": "m1", "entry_type": "preference", "score": 0.9, "content": "prefers dark mode"}]
                }),
            )
            .unwrap();
        assert!(prompt.contains("id=m1"));
        assert!(prompt.contains("prefers light mode"));
    }

    #[test]
    fn test_custom_template() {
        let renderer = PromptRenderer::new()
            .with_template(CONSOLIDATION_TEMPLATE, "{{ members | join(', ') }}")
            .unwrap();
        let out = renderer
            .render(CONSOLIDATION_TEMPLATE, json!({"members": ["a", "b"]}))
            .unwrap();
        assert_eq!(out, "a, b");
    }
}
