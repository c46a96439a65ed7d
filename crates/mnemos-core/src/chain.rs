//! Supersession chains
//!
//! Pointers only move forward. An entry has at most one successor, and a new
//! supersession of an already-retired entry lands on the head of its chain.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::entry::MemoryEntry;
use crate::error::{MemoryError, Result};
use crate::traits::backend::MemoryBackend;

pub const MAX_CHAIN_HOPS: usize = 64;

/// Retire the chain containing `old_id` in favour of `successor_id`.
///
/// Returns `Ok(true)` when a pointer was written and `Ok(false)` when the
/// chain already ends at `successor_id`.
pub async fn link_successor<B>(
    backend: &B,
    old_id: &str,
    successor_id: &str,
    at: DateTime<Utc>,
) -> Result<bool>
where
    B: MemoryBackend + ?Sized,
{
    if old_id == successor_id {
        return Err(MemoryError::InvalidSupersession(format!(
            "{} cannot supersede itself",
            old_id
        )));
    }

    let successor = backend
        .get(successor_id)
        .await?
        .ok_or_else(|| MemoryError::NotFound(successor_id.to_string()))?;
    if !successor.is_current() {
        return Err(MemoryError::InvalidSupersession(format!(
            "successor {} is itself superseded",
            successor_id
        )));
    }

    let mut current = old_id.to_string();
    for _ in 0..MAX_CHAIN_HOPS {
        if current == successor_id {
            return Ok(false);
        }

        let entry = backend
            .get(&current)
            .await?
            .ok_or_else(|| MemoryError::NotFound(current.clone()))?;

        match entry.superseded_by {
            None => {
                if backend
                    .mark_superseded(&current, successor_id, Some(at))
                    .await?
                {
                    debug!("Linked {} -> {}", current, successor_id);
                    return Ok(true);
                }
                // Lost the race; re-read and follow whoever won.
            }
            Some(next) if next == successor_id => return Ok(false),
            Some(next) => current = next,
        }
    }

    Err(MemoryError::InvalidSupersession(format!(
        "chain from {} exceeds {} hops",
        old_id, MAX_CHAIN_HOPS
    )))
}

/// The current entry at the end of the chain starting at `id`.
pub async fn resolve_head<B>(backend: &B, id: &str) -> Result<MemoryEntry>
where
    B: MemoryBackend + ?Sized,
{
    let chain = chain_from(backend, id).await?;
    chain
        .into_iter()
        .last()
        .ok_or_else(|| MemoryError::NotFound(id.to_string()))
}

/// Every entry from `id` forward to the head, oldest first.
pub async fn chain_from<B>(backend: &B, id: &str) -> Result<Vec<MemoryEntry>>
where
    B: MemoryBackend + ?Sized,
{
    let mut chain = Vec::new();
    let mut next = Some(id.to_string());

    while let Some(current) = next {
        if chain.len() >= MAX_CHAIN_HOPS {
            return Err(MemoryError::InvalidSupersession(format!(
                "chain from {} exceeds {} hops",
                id, MAX_CHAIN_HOPS
            )));
        }
        let entry = backend
            .get(&current)
            .await?
            .ok_or_else(|| MemoryError::NotFound(current.clone()))?;
        next = entry.superseded_by.clone();
        chain.push(entry);
    }

    Ok(chain)
}
