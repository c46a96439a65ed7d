//! Redis memory backend
//!
//! Entries live as JSON documents. Successor pointers are kept in their own
//! keys and written with `SET NX`, so the first writer wins and a retired
//! entry is never re-pointed in place. Every change to a document goes
//! through a WATCH/MULTI transaction that re-reads it, so concurrent writers
//! never overwrite each other's fields.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use mnemos_core::{
    ArchivedTranscript, CommitmentStatus, ContextSnapshot, EntryUpdate, MemoryBackend, MemoryEntry,
    MemoryError, MemoryFilter, Result, ScoredEntry, SearchQuery, rank_entries,
};

/// Attempts before a contended document write gives up.
const MAX_WATCH_ATTEMPTS: usize = 16;

pub struct RedisBackend {
    client: redis::Client,
    prefix: String,
}

fn map_redis_err(e: redis::RedisError) -> MemoryError {
    MemoryError::Backend(e.to_string())
}

impl RedisBackend {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(map_redis_err)?;
        Ok(Self {
            client,
            prefix: "mnemos:".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn entry_key(&self, id: &str) -> String {
        format!("{}entry:{}", self.prefix, id)
    }

    fn successor_key(&self, id: &str) -> String {
        format!("{}succ:{}", self.prefix, id)
    }

    fn owner_key(&self, owner_id: &str) -> String {
        format!("{}owner:{}", self.prefix, owner_id)
    }

    fn owners_key(&self) -> String {
        format!("{}owners", self.prefix)
    }

    fn snapshot_key(&self, id: &str) -> String {
        format!("{}snap:{}", self.prefix, id)
    }

    fn owner_snapshots_key(&self, owner_id: &str) -> String {
        format!("{}snaps:{}", self.prefix, owner_id)
    }

    fn snapshots_index_key(&self) -> String {
        format!("{}snaps", self.prefix)
    }

    fn transcript_key(&self, transcript_ref: &str) -> String {
        format!("{}transcript:{}", self.prefix, transcript_ref)
    }

    fn transcripts_index_key(&self) -> String {
        format!("{}transcripts", self.prefix)
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_err)
    }

    /// Read-modify-write of one document under WATCH. `apply` runs on a fresh
    /// copy each attempt; an error from it aborts without writing.
    async fn modify_entry<F>(&self, id: &str, mut apply: F) -> Result<MemoryEntry>
    where
        F: FnMut(&mut MemoryEntry) -> Result<()> + Send,
    {
        // A fresh connection per call keeps WATCH scoped to this transaction.
        let mut conn = self.get_connection().await?;
        let key = self.entry_key(id);

        for _ in 0..MAX_WATCH_ATTEMPTS {
            redis::cmd("WATCH")
                .arg(&key)
                .query_async::<()>(&mut conn)
                .await
                .map_err(map_redis_err)?;
            let doc: Option<String> = redis::cmd("GET")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            let Some(doc) = doc else {
                self.unwatch(&mut conn).await?;
                return Err(MemoryError::NotFound(id.to_string()));
            };

            let mut entry: MemoryEntry = serde_json::from_str(&doc)?;
            if let Err(e) = apply(&mut entry) {
                self.unwatch(&mut conn).await?;
                return Err(e);
            }

            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("SET")
                .arg(&key)
                .arg(serde_json::to_string(&entry)?);
            let committed: Option<redis::Value> = pipe
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            if committed.is_some() {
                if entry.superseded_by.is_none() {
                    entry.superseded_by = redis::cmd("GET")
                        .arg(self.successor_key(id))
                        .query_async(&mut conn)
                        .await
                        .map_err(map_redis_err)?;
                }
                return Ok(entry);
            }
            debug!("[redis] {} changed under a write; retrying", id);
        }

        Err(MemoryError::Backend(format!(
            "entry {} kept changing across {} attempts",
            id, MAX_WATCH_ATTEMPTS
        )))
    }

    async fn unwatch(&self, conn: &mut redis::aio::MultiplexedConnection) -> Result<()> {
        redis::cmd("UNWATCH")
            .query_async::<()>(conn)
            .await
            .map_err(map_redis_err)
    }

    /// Load documents for `ids`, overlaying the authoritative successor keys.
    async fn load_entries(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        ids: &[String],
    ) -> Result<Vec<MemoryEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let entry_keys: Vec<String> = ids.iter().map(|id| self.entry_key(id)).collect();
        let succ_keys: Vec<String> = ids.iter().map(|id| self.successor_key(id)).collect();

        let docs: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&entry_keys)
            .query_async(conn)
            .await
            .map_err(map_redis_err)?;
        let successors: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&succ_keys)
            .query_async(conn)
            .await
            .map_err(map_redis_err)?;

        let mut entries = Vec::with_capacity(ids.len());
        for (doc, successor) in docs.into_iter().zip(successors) {
            let Some(doc) = doc else { continue };
            let mut entry: MemoryEntry = serde_json::from_str(&doc)?;
            if entry.superseded_by.is_none() {
                entry.superseded_by = successor;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn candidate_ids(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        filter: &MemoryFilter,
    ) -> Result<Vec<String>> {
        let owners = match &filter.owner_id {
            Some(owner) => vec![owner.clone()],
            None => redis::cmd("SMEMBERS")
                .arg(self.owners_key())
                .query_async(conn)
                .await
                .map_err(map_redis_err)?,
        };

        let mut ids = Vec::new();
        for owner in owners {
            let mut owned: Vec<String> = redis::cmd("SMEMBERS")
                .arg(self.owner_key(&owner))
                .query_async(conn)
                .await
                .map_err(map_redis_err)?;
            ids.append(&mut owned);
        }
        ids.sort();
        Ok(ids)
    }

    async fn filtered(&self, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>> {
        let mut conn = self.get_connection().await?;
        let ids = self.candidate_ids(&mut conn, filter).await?;
        let mut entries: Vec<MemoryEntry> = self
            .load_entries(&mut conn, &ids)
            .await?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    async fn load_snapshot(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: &str,
    ) -> Result<Option<ContextSnapshot>> {
        let data: Option<String> = redis::cmd("GET")
            .arg(self.snapshot_key(id))
            .query_async(conn)
            .await
            .map_err(map_redis_err)?;
        data.as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(Into::into)
    }
}

#[async_trait]
impl MemoryBackend for RedisBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn add(&self, entry: MemoryEntry) -> Result<MemoryEntry> {
        let mut conn = self.get_connection().await?;

        let created: bool = redis::cmd("SET")
            .arg(self.entry_key(&entry.id))
            .arg(serde_json::to_string(&entry)?)
            .arg("NX")
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(map_redis_err)?
            .is_some();
        if !created {
            return Err(MemoryError::Persistence(format!(
                "entry {} already exists",
                entry.id
            )));
        }

        redis::cmd("SADD")
            .arg(self.owner_key(&entry.owner_id))
            .arg(&entry.id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)?;
        redis::cmd("SADD")
            .arg(self.owners_key())
            .arg(&entry.owner_id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)?;

        debug!("[redis] added {} for {}", entry.id, entry.owner_id);
        Ok(entry)
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        let mut conn = self.get_connection().await?;
        let mut entries = self.load_entries(&mut conn, &[id.to_string()]).await?;
        Ok(entries.pop())
    }

    async fn search(
        &self,
        query: &SearchQuery,
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>> {
        let candidates = self.filtered(filter).await?;
        Ok(rank_entries(query, candidates, limit))
    }

    async fn update(&self, id: &str, update: EntryUpdate) -> Result<MemoryEntry> {
        self.modify_entry(id, |entry| {
            update.apply_to(entry);
            Ok(())
        })
        .await
    }

    async fn mark_superseded(
        &self,
        id: &str,
        successor_id: &str,
        valid_until: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.entry_key(id))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        if !exists {
            return Err(MemoryError::NotFound(id.to_string()));
        }

        let won = redis::cmd("SET")
            .arg(self.successor_key(id))
            .arg(successor_id)
            .arg("NX")
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(map_redis_err)?
            .is_some();
        if !won {
            return Ok(false);
        }

        // The successor key is authoritative; the document copy is for readers
        // that only fetch the JSON.
        self.modify_entry(id, |entry| {
            entry.superseded_by = Some(successor_id.to_string());
            if valid_until.is_some() {
                entry.valid_until = valid_until;
            }
            Ok(())
        })
        .await?;
        Ok(true)
    }

    async fn release_superseded(&self, id: &str, successor_id: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let released: i64 = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        )
        .key(self.successor_key(id))
        .arg(successor_id)
        .invoke_async(&mut conn)
        .await
        .map_err(map_redis_err)?;
        if released == 0 {
            if self.get(id).await?.is_none() {
                return Err(MemoryError::NotFound(id.to_string()));
            }
            return Ok(false);
        }

        self.modify_entry(id, |entry| {
            if entry.superseded_by.as_deref() == Some(successor_id) {
                entry.superseded_by = None;
            }
            Ok(())
        })
        .await?;
        Ok(true)
    }

    async fn transition_commitment(&self, id: &str, to: CommitmentStatus) -> Result<MemoryEntry> {
        self.modify_entry(id, |entry| entry.transition_commitment(to))
            .await
    }

    async fn list(&self, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>> {
        self.filtered(filter).await
    }

    async fn owners(&self) -> Result<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let mut owners: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.owners_key())
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        owners.sort();
        Ok(owners)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: ContextSnapshot) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let score = snapshot.captured_at.timestamp_micros();

        redis::cmd("SET")
            .arg(self.snapshot_key(&snapshot.id))
            .arg(serde_json::to_string(&snapshot)?)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)?;
        redis::cmd("ZADD")
            .arg(self.owner_snapshots_key(&snapshot.owner_id))
            .arg(score)
            .arg(&snapshot.id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)?;
        redis::cmd("SADD")
            .arg(self.snapshots_index_key())
            .arg(&snapshot.id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn latest_snapshot(&self, owner_id: &str) -> Result<Option<ContextSnapshot>> {
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(self.owner_snapshots_key(owner_id))
            .arg(0)
            .arg(0)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        match ids.first() {
            Some(id) => self.load_snapshot(&mut conn, id).await,
            None => Ok(None),
        }
    }

    async fn mark_snapshot_consumed(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let mut snapshot = self
            .load_snapshot(&mut conn, id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        if snapshot.consumed_at.is_none() {
            snapshot.consumed_at = Some(at);
            redis::cmd("SET")
                .arg(self.snapshot_key(id))
                .arg(serde_json::to_string(&snapshot)?)
                .query_async::<()>(&mut conn)
                .await
                .map_err(map_redis_err)?;
        }
        Ok(())
    }

    async fn purge_snapshots(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize> {
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.snapshots_index_key())
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        let mut purged = 0;
        for id in ids {
            let Some(snapshot) = self.load_snapshot(&mut conn, &id).await? else {
                redis::cmd("SREM")
                    .arg(self.snapshots_index_key())
                    .arg(&id)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(map_redis_err)?;
                continue;
            };

            let stale = match snapshot.expires_at {
                Some(_) => snapshot.is_expired(now),
                None => snapshot.captured_at + retention <= now,
            };
            if !stale {
                continue;
            }

            redis::cmd("DEL")
                .arg(self.snapshot_key(&id))
                .query_async::<()>(&mut conn)
                .await
                .map_err(map_redis_err)?;
            redis::cmd("ZREM")
                .arg(self.owner_snapshots_key(&snapshot.owner_id))
                .arg(&id)
                .query_async::<()>(&mut conn)
                .await
                .map_err(map_redis_err)?;
            redis::cmd("SREM")
                .arg(self.snapshots_index_key())
                .arg(&id)
                .query_async::<()>(&mut conn)
                .await
                .map_err(map_redis_err)?;
            purged += 1;
        }
        Ok(purged)
    }

    async fn archive_transcript(&self, transcript: ArchivedTranscript) -> Result<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("SET")
            .arg(self.transcript_key(&transcript.transcript_ref))
            .arg(serde_json::to_string(&transcript)?)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)?;
        redis::cmd("ZADD")
            .arg(self.transcripts_index_key())
            .arg(transcript.archived_at.timestamp_micros())
            .arg(&transcript.transcript_ref)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn purge_transcripts(&self, archived_before: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.get_connection().await?;
        let cutoff = format!("({}", archived_before.timestamp_micros());
        let refs: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.transcripts_index_key())
            .arg("-inf")
            .arg(&cutoff)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        for transcript_ref in &refs {
            redis::cmd("DEL")
                .arg(self.transcript_key(transcript_ref))
                .query_async::<()>(&mut conn)
                .await
                .map_err(map_redis_err)?;
        }
        redis::cmd("ZREMRANGEBYSCORE")
            .arg(self.transcripts_index_key())
            .arg("-inf")
            .arg(&cutoff)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(refs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let backend = RedisBackend::new("redis://127.0.0.1:6379")
            .unwrap()
            .with_prefix("test:");
        assert_eq!(backend.entry_key("e1"), "test:entry:e1");
        assert_eq!(backend.successor_key("e1"), "test:succ:e1");
        assert_eq!(backend.owner_key("u1"), "test:owner:u1");
        assert_eq!(backend.owner_snapshots_key("u1"), "test:snaps:u1");
        assert_eq!(backend.transcript_key("t1"), "test:transcript:t1");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(RedisBackend::new("not a url").is_err());
    }

    fn live_backend() -> RedisBackend {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        RedisBackend::new(&url)
            .unwrap()
            .with_prefix(format!("mnemos-test:{}:", Utc::now().timestamp_micros()))
    }

    fn preference(content: &str) -> MemoryEntry {
        MemoryEntry::new("u1", content, mnemos_core::EntryType::Preference, 5)
    }

    #[ignore]
    #[tokio::test]
    async fn test_concurrent_update_keeps_retirement() {
        let backend = live_backend();
        for _ in 0..20 {
            let old = backend.add(preference("prefers dark mode")).await.unwrap();
            let new = backend.add(preference("prefers light mode")).await.unwrap();
            let (updated, linked) = tokio::join!(
                backend.update(&old.id, EntryUpdate::default().content("prefers dark mode at night")),
                backend.mark_superseded(&old.id, &new.id, Some(Utc::now()))
            );
            updated.unwrap();
            assert!(linked.unwrap());

            let loaded = backend.get(&old.id).await.unwrap().unwrap();
            assert_eq!(loaded.content, "prefers dark mode at night");
            assert_eq!(loaded.superseded_by.as_deref(), Some(new.id.as_str()));
            assert!(loaded.valid_until.is_some());
        }
    }

    #[ignore]
    #[tokio::test]
    async fn test_concurrent_commitment_transitions_accept_one() {
        let backend = live_backend();
        let c = backend
            .add(MemoryEntry::commitment("u1", "call Ana", None, None))
            .await
            .unwrap();
        let (done, cancelled) = tokio::join!(
            backend.transition_commitment(&c.id, CommitmentStatus::Completed),
            backend.transition_commitment(&c.id, CommitmentStatus::Cancelled)
        );
        assert_eq!(done.is_ok() as u8 + cancelled.is_ok() as u8, 1);
    }
}
