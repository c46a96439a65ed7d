//! Similarity helpers

use std::collections::HashSet;

use crate::entry::MemoryEntry;
use crate::traits::backend::SearchQuery;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        (dot / denom) as f32
    }
}

/// Lower-cased alphanumeric words, used when no embedding is available.
pub fn word_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    intersection / union
}

/// Cosine over embeddings when both sides have one, word overlap otherwise.
pub fn score_entry(query: &SearchQuery, entry: &MemoryEntry) -> f32 {
    match &query.embedding {
        Some(embedding) if !embedding.is_empty() && !entry.embedding.is_empty() => {
            cosine_similarity(embedding, &entry.embedding)
        }
        _ => jaccard(&word_set(&query.text), &word_set(&entry.content)),
    }
}
