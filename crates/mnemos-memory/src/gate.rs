//! Heuristic gate: decides whether a turn is worth an extraction call

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mnemos_core::{Embedder, MemoryError, Result, cosine_similarity};

use crate::config::GateConfig;

const COMMITMENT_PATTERN: &str = r"(?i)\b(i'll|i will|i'm going to|i am going to|i promise|i promised|remind me|i need to|i have to|i must|i owe|i'll get back|let me get back|i plan to|i intend to)\b";

const PREFERENCE_PATTERN: &str = r"(?i)\b(i (really |strongly )?(prefer|like|love|hate|dislike|enjoy|adore|can't stand|cannot stand)|my favou?rite|i'd rather|i would rather|i don't like|i do not like|i'm (a fan of|into|not a fan of))\b";

const TEMPORAL_PATTERN: &str = r"(?i)\b(today|tomorrow|yesterday|tonight|this (morning|afternoon|evening|weekend)|(next|last) (week|month|year|monday|tuesday|wednesday|thursday|friday|saturday|sunday)|on (monday|tuesday|wednesday|thursday|friday|saturday|sunday)|in \d+ (minutes|hours|days|weeks|months)|\d{1,2}(:\d{2})? ?(am|pm)|(january|february|march|april|may|june|july|august|september|october|november|december) \d{1,2}|deadline|due)\b";

const FACTUAL_PATTERN: &str = r"(?i)\b(i am|i'm|i was|i've been|i have been|i have|i work|i live|i moved|i was born|i study|i studied|my \w+ (is|are|was|were)|i own|i speak)\b";

const EMOTIONAL_PATTERN: &str = r"(?i)\b(excited|worried|anxious|stressed|overwhelmed|happy|sad|upset|angry|thrilled|scared|afraid|grateful|frustrated|nervous|proud|heartbroken|lonely|devastated|relieved)\b";

const ENTITY_PATTERN: &str = r"\b[A-Z][a-zA-Z]+(?:\s+[A-Z][a-zA-Z]+)*\b";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateSignal {
    Commitment,
    Preference,
    Temporal,
    NamedEntity,
    Factual,
    Emotional,
    Novelty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub should_extract: bool,
    pub score: f32,
    pub signals: Vec<GateSignal>,
}

pub struct HeuristicGate {
    config: GateConfig,
    patterns: Vec<(GateSignal, Regex)>,
    entity: Regex,
}

impl HeuristicGate {
    pub fn new(config: GateConfig) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| MemoryError::Config(format!("gate pattern: {}", e)))
        };

        Ok(Self {
            patterns: vec![
                (GateSignal::Commitment, compile(COMMITMENT_PATTERN)?),
                (GateSignal::Preference, compile(PREFERENCE_PATTERN)?),
                (GateSignal::Temporal, compile(TEMPORAL_PATTERN)?),
                (GateSignal::Factual, compile(FACTUAL_PATTERN)?),
                (GateSignal::Emotional, compile(EMOTIONAL_PATTERN)?),
            ],
            entity: compile(ENTITY_PATTERN)?,
            config,
        })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    fn weight(&self, signal: GateSignal) -> f32 {
        let w = &self.config.weights;
        match signal {
            GateSignal::Commitment => w.commitment,
            GateSignal::Preference => w.preference,
            GateSignal::Temporal => w.temporal,
            GateSignal::NamedEntity => w.named_entity,
            GateSignal::Factual => w.factual,
            GateSignal::Emotional => w.emotional,
            GateSignal::Novelty => w.novelty,
        }
    }

    /// Capitalised names that do not just start a sentence.
    pub fn named_entities(&self, text: &str) -> Vec<String> {
        let mut found = Vec::new();
        for m in self.entity.find_iter(text) {
            let before = text[..m.start()].trim_end();
            let sentence_start =
                before.is_empty() || before.ends_with(['.', '!', '?', '\n', ':', '"']);
            let candidate = if sentence_start {
                // Keep the tail of a multi-word run that opened the sentence.
                match m.as_str().split_once(char::is_whitespace) {
                    Some((_, rest)) => rest.trim().to_string(),
                    None => continue,
                }
            } else {
                m.as_str().to_string()
            };
            if !candidate.is_empty() && !found.contains(&candidate) {
                found.push(candidate);
            }
        }
        found
    }

    /// Entities in `text` that none of `recent` mention.
    pub fn new_entities(&self, text: &str, recent: &[String]) -> Vec<String> {
        self.named_entities(text)
            .into_iter()
            .filter(|e| !recent.iter().any(|r| r.contains(e.as_str())))
            .collect()
    }

    /// Cheap signals only. Pure: the same input always gives the same decision.
    pub fn evaluate(&self, turn_text: &str, recent_context: &[String]) -> GateDecision {
        let mut signals = Vec::new();
        for (signal, pattern) in &self.patterns {
            if pattern.is_match(turn_text) {
                signals.push(*signal);
            }
        }
        if !self.new_entities(turn_text, recent_context).is_empty() {
            signals.push(GateSignal::NamedEntity);
        }
        self.decide(signals)
    }

    /// [`evaluate`](Self::evaluate) plus the embedding novelty check, which
    /// only runs when a cheap signal already fired.
    pub async fn evaluate_with_novelty(
        &self,
        turn_text: &str,
        recent_context: &[String],
        embedder: &dyn Embedder,
    ) -> GateDecision {
        let decision = self.evaluate(turn_text, recent_context);
        if decision.signals.is_empty() || self.config.weights.novelty <= 0.0 {
            return decision;
        }

        let window = recent_context.len().min(self.config.novelty_window);
        let recent = &recent_context[recent_context.len() - window..];
        if recent.is_empty() {
            return self.with_signal(decision, GateSignal::Novelty);
        }

        match self.max_similarity(turn_text, recent, embedder).await {
            Ok(best) if best < self.config.novelty_threshold => {
                self.with_signal(decision, GateSignal::Novelty)
            }
            Ok(_) => decision,
            Err(e) => {
                warn!("[gate] novelty check skipped: {}", e);
                decision
            }
        }
    }

    async fn max_similarity(
        &self,
        turn_text: &str,
        recent: &[String],
        embedder: &dyn Embedder,
    ) -> Result<f32> {
        let turn = embedder.embed(turn_text).await?;
        let mut best = 0.0f32;
        for text in recent {
            let other = embedder.embed(text).await?;
            best = best.max(cosine_similarity(&turn, &other));
        }
        Ok(best)
    }

    fn with_signal(&self, decision: GateDecision, signal: GateSignal) -> GateDecision {
        let mut signals = decision.signals;
        signals.push(signal);
        self.decide(signals)
    }

    fn decide(&self, signals: Vec<GateSignal>) -> GateDecision {
        let score = signals
            .iter()
            .map(|s| self.weight(*s))
            .sum::<f32>()
            .clamp(0.0, 1.0);
        let should_extract = !signals.is_empty() && score >= self.config.threshold;
        debug!("[gate] score {:.2} signals {:?}", score, signals);
        GateDecision {
            should_extract,
            score,
            signals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;

    fn gate() -> HeuristicGate {
        HeuristicGate::new(GateConfig::default()).unwrap()
    }

    #[test]
    fn test_preference_fires() {
        let decision = gate().evaluate("I prefer dark mode", &[]);
        assert!(decision.should_extract);
        assert!(decision.signals.contains(&GateSignal::Preference));
        assert!(decision.score >= 0.3);
    }

    #[test]
    fn test_small_talk_does_not_fire() {
        let decision = gate().evaluate("ok thanks, sounds good", &[]);
        assert!(!decision.should_extract);
        assert_eq!(decision.score, 0.0);
        assert!(decision.signals.is_empty());
    }

    #[test]
    fn test_commitment_and_temporal_add_up() {
        let decision = gate().evaluate("I'll send the slides tomorrow", &[]);
        assert!(decision.signals.contains(&GateSignal::Commitment));
        assert!(decision.signals.contains(&GateSignal::Temporal));
        assert!((decision.score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_score_is_clamped() {
        let text = "I promise I'll tell Maria tomorrow, I'm so excited, I love it and I work at Acme";
        let decision = gate().evaluate(text, &[]);
        assert_eq!(decision.score, 1.0);
    }

    #[test]
    fn test_deterministic_for_same_input() {
        let g = gate();
        let recent = vec!["we talked about Lisbon".to_string()];
        let a = g.evaluate("My sister lives in Porto now", &recent);
        let b = g.evaluate("My sister lives in Porto now", &recent);
        assert_eq!(a, b);
    }

    #[test]
    fn test_named_entities_skip_sentence_starts() {
        let g = gate();
        assert_eq!(g.named_entities("Sure, ask Maria about it"), vec!["Maria"]);
        assert!(g.named_entities("Sounds good. Thanks").is_empty());
        assert_eq!(g.named_entities("Lisbon was lovely"), Vec::<String>::new());
    }

    #[test]
    fn test_known_entity_is_not_new() {
        let g = gate();
        let recent = vec!["I met Maria yesterday".to_string()];
        assert!(g.new_entities("and then Maria left", &recent).is_empty());
        assert_eq!(g.new_entities("and then Jonas left", &recent), vec!["Jonas"]);
    }

    #[test]
    fn test_threshold_configurable() {
        let strict = HeuristicGate::new(GateConfig::default().with_threshold(0.9)).unwrap();
        assert!(!strict.evaluate("I prefer dark mode", &[]).should_extract);
    }

    #[tokio::test]
    async fn test_novelty_only_after_cheap_signal() {
        let g = gate();
        let embedder = HashEmbedder::default();

        let quiet = g.evaluate_with_novelty("ok sure", &[], &embedder).await;
        assert!(quiet.signals.is_empty());

        let recent = vec!["what a nice day for a walk".to_string()];
        let novel = g
            .evaluate_with_novelty("I prefer dark mode in every editor", &recent, &embedder)
            .await;
        assert!(novel.signals.contains(&GateSignal::Novelty));

        let repeat = g
            .evaluate_with_novelty(
                "I prefer dark mode",
                &["I prefer dark mode".to_string()],
                &embedder,
            )
            .await;
        assert!(!repeat.signals.contains(&GateSignal::Novelty));
    }
}
