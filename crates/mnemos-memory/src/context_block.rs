//! Token-budgeted memory block injected ahead of generation

use chrono::{DateTime, Duration, Utc};
use minijinja::Environment;
use serde::{Deserialize, Serialize};
use serde_json::json;

use mnemos_core::{
    MemoryEntry, MemoryError, Result, WorkingState, estimate_tokens, truncate_to_tokens,
};

use crate::config::ContextBudget;

const BLOCK_TEMPLATE_NAME: &str = "context_block";

pub const DEFAULT_BLOCK_TEMPLATE: &str = r#"<memory>
{% if profile %}About the user:
{% for line in profile %}- {{ line }}
{% endfor %}{% endif %}{% if relevant %}Relevant memories:
{% for line in relevant %}- {{ line }}
{% endfor %}{% endif %}{% if commitments %}Open commitments:
{% for line in commitments %}- {{ line }}
{% endfor %}{% endif %}{% if session %}Where we left off:
{% for line in session %}- {{ line }}
{% endfor %}{% endif %}</memory>"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockSource {
    Recall,
    /// Re-injected on the first turn after a compaction.
    Restoration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBlock {
    pub owner_id: String,
    pub source: BlockSource,
    pub text: String,
    pub token_estimate: u32,
    /// Entries that made it into the text.
    pub entry_ids: Vec<String>,
}

/// Raw material for a block. Entries should already be in priority order.
#[derive(Debug, Clone, Default)]
pub struct BlockSections {
    pub profile: Vec<MemoryEntry>,
    pub relevant: Vec<MemoryEntry>,
    pub commitments: Vec<MemoryEntry>,
    pub session: Option<WorkingState>,
}

impl BlockSections {
    pub fn is_empty(&self) -> bool {
        self.profile.is_empty()
            && self.relevant.is_empty()
            && self.commitments.is_empty()
            && self.session.as_ref().is_none_or(|s| s.is_empty())
    }
}

struct Line {
    text: String,
    entry_id: Option<String>,
}

pub struct ContextBlockBuilder {
    env: Environment<'static>,
    budget: ContextBudget,
}

impl ContextBlockBuilder {
    pub fn new(budget: ContextBudget) -> Result<Self> {
        Self::with_template(budget, DEFAULT_BLOCK_TEMPLATE)
    }

    pub fn with_template(budget: ContextBudget, source: impl Into<String>) -> Result<Self> {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| minijinja::AutoEscape::None);
        env.add_template_owned(BLOCK_TEMPLATE_NAME, source.into())
            .map_err(|e| MemoryError::Config(format!("context block template: {}", e)))?;
        Ok(Self { env, budget })
    }

    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    pub fn build(
        &self,
        owner_id: &str,
        sections: &BlockSections,
        source: BlockSource,
        now: DateTime<Utc>,
    ) -> Result<Option<ContextBlock>> {
        self.build_with_budget(owner_id, sections, source, now, &self.budget)
    }

    /// Render within `budget`. `None` when there is nothing to say or nothing fits.
    pub fn build_with_budget(
        &self,
        owner_id: &str,
        sections: &BlockSections,
        source: BlockSource,
        now: DateTime<Utc>,
        budget: &ContextBudget,
    ) -> Result<Option<ContextBlock>> {
        if sections.is_empty() || budget.total == 0 {
            return Ok(None);
        }
        let cap = |section: u32| section.min(budget.total);

        let mut parts = [
            fill(entry_lines(&sections.profile, |e| e.content.clone()), cap(budget.profile)),
            fill(entry_lines(&sections.relevant, |e| e.content.clone()), cap(budget.relevant)),
            fill(
                entry_lines(&sections.commitments, |e| commitment_line(e, now)),
                cap(budget.commitments),
            ),
            fill(session_lines(sections.session.as_ref()), cap(budget.session)),
        ];

        // Drop the lowest-priority lines until the whole block fits.
        loop {
            if parts.iter().all(|p| p.is_empty()) {
                return Ok(None);
            }
            let text = self.render(&parts)?;
            let tokens = estimate_tokens(&text);
            if tokens <= budget.total {
                let entry_ids = parts
                    .iter()
                    .flatten()
                    .filter_map(|l| l.entry_id.clone())
                    .collect();
                return Ok(Some(ContextBlock {
                    owner_id: owner_id.to_string(),
                    source,
                    text,
                    token_estimate: tokens,
                    entry_ids,
                }));
            }
            if let Some(section) = parts.iter_mut().rev().find(|p| !p.is_empty()) {
                section.pop();
            }
        }
    }

    fn render(&self, parts: &[Vec<Line>; 4]) -> Result<String> {
        let texts = |lines: &Vec<Line>| lines.iter().map(|l| l.text.clone()).collect::<Vec<_>>();
        let tmpl = self
            .env
            .get_template(BLOCK_TEMPLATE_NAME)
            .map_err(|e| MemoryError::Config(e.to_string()))?;
        tmpl.render(json!({
            "profile": texts(&parts[0]),
            "relevant": texts(&parts[1]),
            "commitments": texts(&parts[2]),
            "session": texts(&parts[3]),
        }))
        .map_err(|e| MemoryError::Config(e.to_string()))
    }
}

fn entry_lines(entries: &[MemoryEntry], text: impl Fn(&MemoryEntry) -> String) -> Vec<Line> {
    entries
        .iter()
        .map(|e| Line {
            text: text(e),
            entry_id: Some(e.id.clone()),
        })
        .collect()
}

fn session_lines(state: Option<&WorkingState>) -> Vec<Line> {
    let Some(state) = state else {
        return Vec::new();
    };
    [
        ("Working on", &state.active_task),
        ("Last step", &state.last_action),
        ("Next step", &state.next_step),
    ]
    .into_iter()
    .filter_map(|(label, value)| {
        value.as_ref().map(|v| Line {
            text: format!("{}: {}", label, v.trim()),
            entry_id: None,
        })
    })
    .collect()
}

/// Greedy packing. Each line also pays one token for its bullet and newline.
fn fill(lines: Vec<Line>, cap: u32) -> Vec<Line> {
    let mut used = 0u32;
    let mut kept = Vec::new();
    for mut line in lines {
        let text = line.text.trim();
        if text.is_empty() {
            continue;
        }
        let cost = estimate_tokens(text) + 1;
        if used + cost <= cap {
            line.text = text.to_string();
            used += cost;
            kept.push(line);
        } else if kept.is_empty() && cap > 2 {
            line.text = truncate_to_tokens(text, cap - 1);
            kept.push(line);
            break;
        }
    }
    kept
}

/// Forward-facing phrasing: past-due items are offered as something to pick
/// up, never described as late.
pub fn commitment_line(entry: &MemoryEntry, now: DateTime<Utc>) -> String {
    let mut line = entry.content.trim().trim_end_matches('.').to_string();
    let Some(details) = &entry.commitment else {
        return line;
    };
    if let Some(person) = details.target_person.as_deref() {
        line.push_str(&format!(" (for {})", person));
    }
    match details.due_at {
        Some(due) if due > now => {
            let today = now.date_naive();
            let when = if due.date_naive() == today {
                "today".to_string()
            } else if due.date_naive() == (now + Duration::days(1)).date_naive() {
                "tomorrow".to_string()
            } else {
                due.format("%a %b %-d").to_string()
            };
            line.push_str(&format!(", due {}", when));
        }
        Some(_) => line.push_str(", ready to pick up whenever suits"),
        None => {}
    }
    line
}
