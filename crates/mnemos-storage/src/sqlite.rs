//! SQLite backend: relational rows plus stored embeddings, ranked in process

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tracing::debug;

use mnemos_core::{
    ArchivedTranscript, CommitmentDetails, CommitmentStatus, ContextSnapshot, EntryType,
    EntryUpdate, MemoryBackend, MemoryEntry, MemoryError, MemoryFilter, Result, ScoredEntry,
    SearchQuery, SnapshotTrigger, Tier, WorkingState, rank_entries,
};

type EntryRow = (
    String,
    String,
    String,
    String,
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<String>,
);

type SnapshotRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
);

const ENTRY_COLUMNS: &str = "id, owner_id, content, entry_type, importance, tier, embedding, \
     valid_from, valid_until, superseded_by, created_at, metadata, commitment";

pub struct SqliteBackend {
    pool: sqlx::SqlitePool,
}

fn map_sqlx_err(e: sqlx::Error) -> MemoryError {
    MemoryError::Persistence(e.to_string())
}

fn fmt_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MemoryError::Persistence(format!("bad timestamp {}: {}", raw, e)))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

impl SqliteBackend {
    pub async fn new(path: &str) -> Result<Self> {
        let pool = Self::connect(path).await?;
        let backend = Self { pool };
        backend.run_migrations().await?;
        Ok(backend)
    }

    pub async fn in_memory() -> Result<Self> {
        // A single connection keeps every query on the same in-memory database.
        let options = sqlx::sqlite::SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(map_sqlx_err)?;
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(map_sqlx_err)?;
        let backend = Self { pool };
        backend.run_migrations().await?;
        Ok(backend)
    }

    async fn connect(path: &str) -> Result<sqlx::SqlitePool> {
        let options = sqlx::sqlite::SqliteConnectOptions::from_str(path)
            .map_err(map_sqlx_err)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        sqlx::SqlitePool::connect_with(options)
            .await
            .map_err(map_sqlx_err)
    }

    async fn run_migrations(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS memory_entries (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                content TEXT NOT NULL,
                entry_type TEXT NOT NULL,
                importance INTEGER NOT NULL,
                tier TEXT NOT NULL,
                embedding TEXT NOT NULL,
                valid_from TEXT NOT NULL,
                valid_until TEXT,
                superseded_by TEXT,
                created_at TEXT NOT NULL,
                metadata TEXT NOT NULL,
                commitment TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_entries_owner_current ON memory_entries(owner_id, superseded_by)",
            "CREATE INDEX IF NOT EXISTS idx_entries_created_at ON memory_entries(created_at)",
            r#"
            CREATE TABLE IF NOT EXISTS context_snapshots (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                trigger TEXT NOT NULL,
                state TEXT NOT NULL,
                captured_at TEXT NOT NULL,
                expires_at TEXT,
                consumed_at TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_snapshots_owner ON context_snapshots(owner_id, captured_at)",
            r#"
            CREATE TABLE IF NOT EXISTS archived_transcripts (
                transcript_ref TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                content TEXT NOT NULL,
                archived_at TEXT NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        }
        Ok(())
    }

    fn entry_from_row(row: EntryRow) -> Result<MemoryEntry> {
        let (
            id,
            owner_id,
            content,
            entry_type,
            importance,
            tier,
            embedding,
            valid_from,
            valid_until,
            superseded_by,
            created_at,
            metadata,
            commitment,
        ) = row;

        let commitment: Option<CommitmentDetails> = commitment
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(MemoryEntry {
            id,
            owner_id,
            content,
            entry_type: EntryType::from_str(&entry_type)?,
            importance: importance.clamp(1, 10) as u8,
            tier: Tier::from_str(&tier)?,
            embedding: serde_json::from_str(&embedding)?,
            valid_from: parse_ts(&valid_from)?,
            valid_until: parse_opt_ts(valid_until)?,
            superseded_by,
            created_at: parse_ts(&created_at)?,
            metadata: serde_json::from_str::<HashMap<String, serde_json::Value>>(&metadata)?,
            commitment,
        })
    }

    fn snapshot_from_row(row: SnapshotRow) -> Result<ContextSnapshot> {
        let (id, owner_id, trigger, state, captured_at, expires_at, consumed_at) = row;
        Ok(ContextSnapshot {
            id,
            owner_id,
            trigger: serde_json::from_str::<SnapshotTrigger>(&trigger)?,
            state: serde_json::from_str::<WorkingState>(&state)?,
            captured_at: parse_ts(&captured_at)?,
            expires_at: parse_opt_ts(expires_at)?,
            consumed_at: parse_opt_ts(consumed_at)?,
        })
    }

    async fn write_entry(&self, entry: &MemoryEntry, upsert: bool) -> Result<()> {
        let verb = if upsert { "INSERT OR REPLACE" } else { "INSERT" };
        let sql = format!(
            "{} INTO memory_entries ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            verb, ENTRY_COLUMNS
        );
        let commitment = entry
            .commitment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(&sql)
            .bind(&entry.id)
            .bind(&entry.owner_id)
            .bind(&entry.content)
            .bind(entry.entry_type.as_str())
            .bind(entry.importance as i64)
            .bind(entry.tier.as_str())
            .bind(serde_json::to_string(&entry.embedding)?)
            .bind(fmt_ts(entry.valid_from))
            .bind(entry.valid_until.map(fmt_ts))
            .bind(&entry.superseded_by)
            .bind(fmt_ts(entry.created_at))
            .bind(serde_json::to_string(&entry.metadata)?)
            .bind(commitment)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    /// Rows narrowed by owner and currency in SQL; everything else is checked in process.
    async fn fetch_filtered(&self, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>> {
        let mut sql = format!("SELECT {} FROM memory_entries WHERE 1=1", ENTRY_COLUMNS);
        if filter.owner_id.is_some() {
            sql.push_str(" AND owner_id = ?");
        }
        if filter.current_only {
            sql.push_str(" AND superseded_by IS NULL");
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");

        let mut query = sqlx::query_as::<_, EntryRow>(&sql);
        if let Some(owner) = &filter.owner_id {
            query = query.bind(owner);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_err)?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let entry = Self::entry_from_row(row)?;
            if filter.matches(&entry) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn count_entries(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM memory_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(count)
    }
}

#[async_trait]
impl MemoryBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn add(&self, entry: MemoryEntry) -> Result<MemoryEntry> {
        self.write_entry(&entry, false).await?;
        debug!("[sqlite] added {} for {}", entry.id, entry.owner_id);
        Ok(entry)
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        let sql = format!("SELECT {} FROM memory_entries WHERE id = ?", ENTRY_COLUMNS);
        let row: Option<EntryRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.map(Self::entry_from_row).transpose()
    }

    async fn search(
        &self,
        query: &SearchQuery,
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>> {
        let candidates = self.fetch_filtered(filter).await?;
        Ok(rank_entries(query, candidates, limit))
    }

    /// Writes only the columns the update sets. Metadata keys are merged into
    /// the stored object in the same statement.
    async fn update(&self, id: &str, update: EntryUpdate) -> Result<MemoryEntry> {
        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new("UPDATE memory_entries SET ");
        let mut fields = builder.separated(", ");
        if let Some(content) = update.content {
            fields.push("content = ").push_bind_unseparated(content);
        }
        if let Some(importance) = update.importance {
            fields
                .push("importance = ")
                .push_bind_unseparated(importance.clamp(1, 10) as i64);
        }
        if let Some(tier) = update.tier {
            fields.push("tier = ").push_bind_unseparated(tier.as_str());
        }
        if let Some(embedding) = &update.embedding {
            fields
                .push("embedding = ")
                .push_bind_unseparated(serde_json::to_string(embedding)?);
        }
        if let Some(until) = update.valid_until {
            fields.push("valid_until = ").push_bind_unseparated(fmt_ts(until));
        }
        if let Some(details) = &update.commitment {
            fields
                .push("commitment = ")
                .push_bind_unseparated(serde_json::to_string(details)?);
        }
        if let Some(metadata) = &update.metadata {
            if !metadata.is_empty() {
                fields.push("metadata = ");
                for _ in 0..metadata.len() {
                    fields.push_unseparated("json_set(");
                }
                fields.push_unseparated("metadata");
                for (key, value) in metadata {
                    fields
                        .push_unseparated(", '$.' || json_quote(")
                        .push_bind_unseparated(key.clone())
                        .push_unseparated("), json(")
                        .push_bind_unseparated(serde_json::to_string(value)?)
                        .push_unseparated("))");
                }
            }
        }

        if builder.sql().ends_with("SET ") {
            return self
                .get(id)
                .await?
                .ok_or_else(|| MemoryError::NotFound(id.to_string()));
        }

        builder.push(" WHERE id = ").push_bind(id);
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(MemoryError::NotFound(id.to_string()));
        }

        self.get(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))
    }

    async fn mark_superseded(
        &self,
        id: &str,
        successor_id: &str,
        valid_until: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE memory_entries
            SET superseded_by = ?, valid_until = COALESCE(?, valid_until)
            WHERE id = ? AND superseded_by IS NULL
            "#,
        )
        .bind(successor_id)
        .bind(valid_until.map(fmt_ts))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.get(id).await?.is_none() {
            return Err(MemoryError::NotFound(id.to_string()));
        }
        Ok(false)
    }

    async fn release_superseded(&self, id: &str, successor_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE memory_entries SET superseded_by = NULL WHERE id = ? AND superseded_by = ?",
        )
        .bind(id)
        .bind(successor_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.get(id).await?.is_none() {
            return Err(MemoryError::NotFound(id.to_string()));
        }
        Ok(false)
    }

    async fn transition_commitment(&self, id: &str, to: CommitmentStatus) -> Result<MemoryEntry> {
        if to == CommitmentStatus::Active {
            return Err(MemoryError::InvalidTransition(
                "commitment is already active".into(),
            ));
        }

        let result = sqlx::query(
            r#"
            UPDATE memory_entries
            SET commitment = json_set(commitment, '$.status', ?)
            WHERE id = ? AND json_extract(commitment, '$.status') = 'active'
            "#,
        )
        .bind(to.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut entry = self
            .get(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        if result.rows_affected() == 1 {
            return Ok(entry);
        }
        // Lost to another transition, or never a commitment.
        entry.transition_commitment(to)?;
        Err(MemoryError::InvalidTransition(format!(
            "{} is no longer active",
            id
        )))
    }

    async fn list(&self, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>> {
        self.fetch_filtered(filter).await
    }

    async fn owners(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT owner_id FROM memory_entries ORDER BY owner_id")
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        Ok(rows.into_iter().map(|(owner,)| owner).collect())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| MemoryError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: ContextSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO context_snapshots
                (id, owner_id, trigger, state, captured_at, expires_at, consumed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.owner_id)
        .bind(serde_json::to_string(&snapshot.trigger)?)
        .bind(serde_json::to_string(&snapshot.state)?)
        .bind(fmt_ts(snapshot.captured_at))
        .bind(snapshot.expires_at.map(fmt_ts))
        .bind(snapshot.consumed_at.map(fmt_ts))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn latest_snapshot(&self, owner_id: &str) -> Result<Option<ContextSnapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, trigger, state, captured_at, expires_at, consumed_at
            FROM context_snapshots
            WHERE owner_id = ?
            ORDER BY captured_at DESC
            LIMIT 1
            "#,
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.map(Self::snapshot_from_row).transpose()
    }

    async fn mark_snapshot_consumed(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE context_snapshots SET consumed_at = COALESCE(consumed_at, ?) WHERE id = ?",
        )
        .bind(fmt_ts(at))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(MemoryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn purge_snapshots(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize> {
        let result = sqlx::query(
            r#"
            DELETE FROM context_snapshots
            WHERE (expires_at IS NOT NULL AND expires_at <= ?)
               OR (expires_at IS NULL AND captured_at <= ?)
            "#,
        )
        .bind(fmt_ts(now))
        .bind(fmt_ts(now - retention))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn archive_transcript(&self, transcript: ArchivedTranscript) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO archived_transcripts (transcript_ref, owner_id, content, archived_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&transcript.transcript_ref)
        .bind(&transcript.owner_id)
        .bind(&transcript.content)
        .bind(fmt_ts(transcript.archived_at))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn purge_transcripts(&self, archived_before: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query("DELETE FROM archived_transcripts WHERE archived_at < ?")
            .bind(fmt_ts(archived_before))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() as usize)
    }
}
