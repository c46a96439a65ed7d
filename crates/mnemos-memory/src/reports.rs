//! Counters and per-pass reports

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-wide counters shared by the request path and the background tasks.
#[derive(Debug, Default)]
pub struct EngineStats {
    turns_gated: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    added: AtomicU64,
    updated: AtomicU64,
    superseded: AtomicU64,
    noop: AtomicU64,
    failed_jobs: AtomicU64,
    recalls_skipped: AtomicU64,
    recalls_served: AtomicU64,
    checkpoints: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StatsSnapshot {
    pub turns_gated: u64,
    pub enqueued: u64,
    pub dropped: u64,
    pub added: u64,
    pub updated: u64,
    pub superseded: u64,
    pub noop: u64,
    pub failed_jobs: u64,
    pub recalls_skipped: u64,
    pub recalls_served: u64,
    pub checkpoints: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_gated(&self) {
        bump(&self.turns_gated, 1);
    }

    pub fn record_enqueued(&self) {
        bump(&self.enqueued, 1);
    }

    pub fn record_dropped(&self) {
        bump(&self.dropped, 1);
    }

    pub fn record_recall(&self, served: bool) {
        if served {
            bump(&self.recalls_served, 1);
        } else {
            bump(&self.recalls_skipped, 1);
        }
    }

    pub fn record_checkpoint(&self) {
        bump(&self.checkpoints, 1);
    }

    pub fn record_extraction(&self, report: &ExtractionReport) {
        bump(&self.added, report.added as u64);
        bump(&self.updated, report.updated as u64);
        bump(&self.superseded, report.superseded as u64);
        bump(&self.noop, report.noop as u64);
        bump(&self.failed_jobs, report.failed as u64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            turns_gated: load(&self.turns_gated),
            enqueued: load(&self.enqueued),
            dropped: load(&self.dropped),
            added: load(&self.added),
            updated: load(&self.updated),
            superseded: load(&self.superseded),
            noop: load(&self.noop),
            failed_jobs: load(&self.failed_jobs),
            recalls_skipped: load(&self.recalls_skipped),
            recalls_served: load(&self.recalls_served),
            checkpoints: load(&self.checkpoints),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub jobs: usize,
    pub added: usize,
    pub updated: usize,
    /// Existing entries retired by a new one.
    pub superseded: usize,
    pub noop: usize,
    /// Entries added with the reconciliation flag.
    pub flagged: usize,
    pub delegated: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl ExtractionReport {
    pub fn merge(&mut self, other: &ExtractionReport) {
        self.jobs += other.jobs;
        self.added += other.added;
        self.updated += other.updated;
        self.superseded += other.superseded;
        self.noop += other.noop;
        self.flagged += other.flagged;
        self.delegated += other.delegated;
        self.requeued += other.requeued;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub owners: usize,
    pub candidates: usize,
    pub clusters: usize,
    pub summaries_created: usize,
    pub entries_consolidated: usize,
    pub failed_clusters: usize,
    /// Set when the run was skipped because the clock is outside the window.
    pub skipped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub entries_archived: usize,
    pub snapshots_purged: usize,
    pub transcripts_purged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointReport {
    pub owner_id: String,
    pub flushed: ExtractionReport,
    /// The flush hit its deadline before the queue was empty.
    pub flush_incomplete: bool,
    pub snapshot_id: Option<String>,
    pub transcript_archived: bool,
    pub marker_set: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = EngineStats::new();
        stats.record_gated();
        stats.record_enqueued();
        stats.record_recall(false);
        stats.record_recall(true);
        stats.record_extraction(&ExtractionReport {
            added: 2,
            superseded: 1,
            failed: 1,
            ..Default::default()
        });

        let snap = stats.snapshot();
        assert_eq!(snap.turns_gated, 1);
        assert_eq!(snap.added, 2);
        assert_eq!(snap.superseded, 1);
        assert_eq!(snap.failed_jobs, 1);
        assert_eq!(snap.recalls_served, 1);
        assert_eq!(snap.recalls_skipped, 1);
    }

    #[test]
    fn test_report_merge() {
        let mut total = ExtractionReport::default();
        total.merge(&ExtractionReport {
            jobs: 2,
            added: 1,
            ..Default::default()
        });
        total.merge(&ExtractionReport {
            jobs: 1,
            noop: 1,
            ..Default::default()
        });
        assert_eq!(total.jobs, 3);
        assert_eq!(total.added, 1);
        assert_eq!(total.noop, 1);
    }
}
