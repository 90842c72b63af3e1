//! One-shot channel sync runner.
//!
//! Reads a file of raw payloads produced by a channel scraper and pushes
//! them through the ingestion pipeline. The advisory `sync-<channel>` lock
//! keeps at most one sync per channel running at a time; the pipeline's
//! idempotency gate makes re-running a partially completed sync safe.

use anyhow::{bail, Context, Result};
use clap::Parser;
use contact_hub_identity::JobLocks;
use contact_hub_ingestion::{HttpSearchIndex, IngestPipeline, MemoryIndex, SearchIndex};
use contact_hub_schemas::Channel;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "channel-sync", about = "Run a one-shot sync for one channel")]
struct Args {
    /// Channel being synced (alias forms accepted, e.g. "imsg", "wa")
    #[arg(long)]
    channel: String,

    /// JSON file containing an array of raw scraper payloads
    #[arg(long)]
    file: String,

    /// Data directory for the flat-file stores
    #[arg(long)]
    data_dir: Option<String>,

    /// Base URL of the external indexing service
    #[arg(long)]
    index_url: Option<String>,

    /// Stop at the first error instead of collecting per-item outcomes
    #[arg(long)]
    fail_fast: bool,
}

fn default_data_dir() -> String {
    std::env::var("HUB_DATA_DIR").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Application Support/ContactHub", home)
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let args = Args::parse();

    let channel = Channel::from_alias(&args.channel)
        .with_context(|| format!("unsupported channel '{}'", args.channel))?;
    let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let raw = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading payload file {}", args.file))?;
    let payloads: Vec<Value> =
        serde_json::from_str(&raw).context("payload file is not a JSON array")?;
    info!("Loaded {} payloads for {}", payloads.len(), channel);

    let index_url = args.index_url.or_else(|| std::env::var("INDEX_URL").ok());
    let index: Arc<dyn SearchIndex> = match &index_url {
        Some(url) => Arc::new(HttpSearchIndex::new(url)),
        None => Arc::new(MemoryIndex::new()),
    };

    let pipeline = IngestPipeline::open(&data_dir, index)?;

    let locks = JobLocks::new(format!("{}/locks", data_dir));
    let lock_name = format!("sync-{}", channel.as_str());
    if !locks.acquire(&lock_name)? {
        bail!("another {} sync is already running", channel);
    }
    let report = pipeline.ingest_batch(&payloads, args.fail_fast).await;
    locks.release(&lock_name);

    info!(
        "Sync complete: {} accepted, {} duplicates, {} errors of {}",
        report.accepted, report.skipped, report.errors, report.total
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.errors > 0 {
        bail!("{} of {} payloads failed", report.errors, report.total);
    }
    Ok(())
}
