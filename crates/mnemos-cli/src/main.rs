//! Maintenance commands for a mnemos sqlite store
//!
//! Runs the background passes by hand and inspects what is stored, without a
//! model: consolidation uses extractive summaries.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mnemos::engine::EngineConfig;
use mnemos::memory::{
    Cleaner, CommitmentTracker, Consolidator, ExtractiveSummarizer, HashEmbedder, chain_from,
    commitment_line,
};
use mnemos::storage::{MemoryBackend, MemoryFilter, SqliteBackend};
use mnemos::MemoryEntry;

#[derive(Parser)]
#[command(name = "mnemos")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect and maintain a mnemos memory store", long_about = None)]
struct Cli {
    /// SQLite database (default: <data dir>/mnemos/memory.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Engine config YAML; only the consolidation and cleanup sections are used
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fold clusters of similar aged entries into insights
    Consolidate {
        /// Only run inside the configured low-activity window
        #[arg(long)]
        respect_window: bool,
    },

    /// Archive expired entries and purge stale snapshots and transcripts
    Cleanup,

    /// List an owner's entries
    List {
        #[arg(short, long)]
        owner: String,

        /// Include superseded entries
        #[arg(long)]
        all: bool,
    },

    /// Active commitments due within a window, past-due included
    Due {
        #[arg(short, long)]
        owner: String,

        #[arg(long, default_value = "72")]
        hours: i64,
    },

    /// Follow an entry's supersession chain to its current head
    History { id: String },

    /// Check that the store is reachable
    Health,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mnemos")
        .join("memory.db")
}

async fn open_store(path: Option<PathBuf>) -> Result<Arc<dyn MemoryBackend>> {
    let path = path.unwrap_or_else(default_db_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let backend = SqliteBackend::new(&path.to_string_lossy())
        .await
        .with_context(|| format!("cannot open {}", path.display()))?;
    info!("Opened {}", path.display());
    Ok(Arc::new(backend))
}

fn print_entry(entry: &MemoryEntry) {
    let status = match &entry.superseded_by {
        Some(next) => format!(" -> {}", next),
        None => String::new(),
    };
    println!(
        "{}  [{} {} imp={}] {}{}",
        entry.id,
        entry.entry_type.as_str(),
        entry.tier.as_str(),
        entry.importance,
        entry.content,
        status
    );
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let backend = open_store(cli.db).await?;

    match cli.command {
        Commands::Consolidate { respect_window } => {
            let consolidator = Consolidator::new(backend, Arc::new(ExtractiveSummarizer::new()))
                .with_config(config.consolidation)
                .with_embedder(Arc::new(HashEmbedder::default()));
            let now = Utc::now();
            let report = if respect_window {
                consolidator.run(now).await?
            } else {
                consolidator.run_now(now).await?
            };
            if cli.json {
                print_json(&report)?;
            } else if report.skipped {
                println!("Outside the consolidation window; nothing done");
            } else {
                println!(
                    "{} owner(s), {} candidate(s), {} cluster(s): {} insight(s) from {} entries, {} failed",
                    report.owners,
                    report.candidates,
                    report.clusters,
                    report.summaries_created,
                    report.entries_consolidated,
                    report.failed_clusters
                );
            }
        }

        Commands::Cleanup => {
            let report = Cleaner::new(backend)
                .with_config(config.cleanup)
                .run(Utc::now())
                .await?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "Archived {} entries; purged {} snapshot(s) and {} transcript(s)",
                    report.entries_archived, report.snapshots_purged, report.transcripts_purged
                );
            }
        }

        Commands::List { owner, all } => {
            let mut filter = MemoryFilter::owner(&owner);
            if !all {
                filter = filter.current();
            }
            let mut entries = backend.list(&filter).await?;
            entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if cli.json {
                print_json(&entries)?;
            } else if entries.is_empty() {
                println!("No entries for {}", owner);
            } else {
                entries.iter().for_each(print_entry);
            }
        }

        Commands::Due { owner, hours } => {
            let now = Utc::now();
            let due = CommitmentTracker::new(backend)
                .due_within(&owner, Duration::hours(hours), now)
                .await?;
            if cli.json {
                print_json(&due)?;
            } else if due.is_empty() {
                println!("Nothing due for {} in the next {}h", owner, hours);
            } else {
                for entry in &due {
                    println!("{}  {}", entry.id, commitment_line(entry, now));
                }
            }
        }

        Commands::History { id } => {
            let chain = chain_from(backend.as_ref(), &id).await?;
            if cli.json {
                print_json(&chain)?;
            } else {
                chain.iter().for_each(print_entry);
            }
        }

        Commands::Health => {
            backend.health_check().await?;
            println!("{}: ok", backend.name());
        }
    }

    Ok(())
}
