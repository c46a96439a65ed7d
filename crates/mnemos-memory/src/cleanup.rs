//! Retention enforcement

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use mnemos_core::{ARCHIVED_KEY, EntryUpdate, MemoryBackend, MemoryFilter, Result, Tier};

use crate::config::CleanupConfig;
use crate::reports::CleanupReport;
use crate::scheduler::ScheduledTask;

/// Demotes expired ephemeral entries to L3 and hard-deletes stale snapshots
/// and transcripts. Entries themselves are never deleted.
pub struct Cleaner {
    backend: Arc<dyn MemoryBackend>,
    config: CleanupConfig,
}

impl Cleaner {
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        Self {
            backend,
            config: CleanupConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CleanupConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        let mut retention: Vec<_> = self.config.retention_days.iter().collect();
        retention.sort_by_key(|(t, _)| t.as_str());
        for (entry_type, days) in retention {
            let filter = MemoryFilter::default()
                .current()
                .with_types(vec![*entry_type])
                .with_tiers(vec![Tier::L2])
                .created_before(now - Duration::days(*days));

            for entry in self.backend.list(&filter).await? {
                if entry.is_active_commitment() {
                    continue;
                }
                let metadata = HashMap::from([(ARCHIVED_KEY.to_string(), serde_json::json!(true))]);
                let update = EntryUpdate::default().tier(Tier::L3).metadata(metadata);
                match self.backend.update(&entry.id, update).await {
                    Ok(_) => {
                        debug!("[cleanup] archived {} ({})", entry.id, entry_type.as_str());
                        report.entries_archived += 1;
                    }
                    Err(e) => warn!("[cleanup] could not archive {}: {}", entry.id, e),
                }
            }
        }

        report.snapshots_purged = self
            .backend
            .purge_snapshots(now, self.config.snapshot_retention())
            .await?;
        report.transcripts_purged = self
            .backend
            .purge_transcripts(now - self.config.transcript_retention())
            .await?;

        info!(
            "[cleanup] archived {}, purged {} snapshot(s) and {} transcript(s)",
            report.entries_archived, report.snapshots_purged, report.transcripts_purged
        );
        Ok(report)
    }
}

#[async_trait]
impl ScheduledTask for Cleaner {
    fn name(&self) -> &str {
        "cleanup"
    }

    fn interval(&self) -> std::time::Duration {
        self.config.interval()
    }

    async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        self.run(now).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemos_core::{
        ArchivedTranscript, ContextSnapshot, EntryType, MemoryEntry, SnapshotTrigger, WorkingState,
    };
    use mnemos_storage::InMemoryBackend;

    #[tokio::test]
    async fn test_expired_events_are_archived_not_deleted() {
        let backend = InMemoryBackend::new();
        let old_event = backend
            .add(
                MemoryEntry::new("u1", "Went to Lisbon", EntryType::Event, 4)
                    .with_created_at(Utc::now() - Duration::days(31)),
            )
            .await
            .unwrap();
        backend
            .add(
                MemoryEntry::new("u1", "Lunch with Ana", EntryType::Event, 3)
                    .with_created_at(Utc::now() - Duration::days(2)),
            )
            .await
            .unwrap();
        backend
            .add(
                MemoryEntry::new("u1", "Allergic to peanuts", EntryType::Fact, 9)
                    .with_created_at(Utc::now() - Duration::days(400)),
            )
            .await
            .unwrap();

        let report = Cleaner::new(Arc::new(backend.clone()))
            .run(Utc::now())
            .await
            .unwrap();
        assert_eq!(report.entries_archived, 1);
        assert_eq!(backend.len(), 3);

        let archived = backend.get(&old_event.id).await.unwrap().unwrap();
        assert_eq!(archived.tier, Tier::L3);
        assert_eq!(archived.metadata.get(ARCHIVED_KEY), Some(&serde_json::json!(true)));
        assert!(archived.is_current());
    }

    #[tokio::test]
    async fn test_active_commitments_survive_task_retention() {
        let backend = InMemoryBackend::new();
        let mut config = CleanupConfig::default();
        config.retention_days.insert(EntryType::Commitment, 1);
        backend
            .add(
                MemoryEntry::commitment("u1", "Send the report", None, None)
                    .with_created_at(Utc::now() - Duration::days(5)),
            )
            .await
            .unwrap();

        let report = Cleaner::new(Arc::new(backend.clone()))
            .with_config(config)
            .run(Utc::now())
            .await
            .unwrap();
        assert_eq!(report.entries_archived, 0);
    }

    #[tokio::test]
    async fn test_purges_stale_snapshots_and_transcripts() {
        let backend = InMemoryBackend::new();
        let mut stale = ContextSnapshot::new("u1", SnapshotTrigger::PreCompaction, WorkingState::default());
        stale.captured_at = Utc::now() - Duration::days(8);
        backend.save_snapshot(stale).await.unwrap();
        backend
            .save_snapshot(ContextSnapshot::new("u1", SnapshotTrigger::Manual, WorkingState::default()))
            .await
            .unwrap();
        backend
            .archive_transcript(ArchivedTranscript {
                transcript_ref: "t-old".into(),
                owner_id: "u1".into(),
                content: "...".into(),
                archived_at: Utc::now() - Duration::days(10),
            })
            .await
            .unwrap();

        let report = Cleaner::new(Arc::new(backend.clone()))
            .run(Utc::now())
            .await
            .unwrap();
        assert_eq!(report.snapshots_purged, 1);
        assert_eq!(report.transcripts_purged, 1);
        assert_eq!(backend.snapshot_count(), 1);
        assert_eq!(backend.transcript_count(), 0);
    }
}
