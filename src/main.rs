//! # Bluemonitor Topics
//!
//! Incremental topic clustering for collected news articles. Articles are
//! embedded, grouped by single-link cosine similarity and then merged into
//! persisted topics, with exact duplicates pinned to the topic of the story
//! they duplicate.
//!
//! ## Usage
//!
//! ```sh
//! bluemonitor_topics --store ./data/store.json import ./articles.jsonl
//! bluemonitor_topics --store ./data/store.json run
//! bluemonitor_topics --store ./data/store.json serve
//! bluemonitor_topics --store ./data/store.json topics
//! ```
//!
//! ## Architecture
//!
//! Each run follows one pipeline:
//! 1. **Selecting**: unclustered articles plus those still missing an embedding
//! 2. **Embedding**: OpenAI-compatible endpoint, bounded parallelism, per-call timeout
//! 3. **Grouping**: connected components over the similarity graph of the batch
//! 4. **Merging**: join the closest topic or create one, with optimistic commits

use clap::Parser;
use std::error::Error;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};
use uuid::Uuid;

mod cli;
mod config;
mod dedup;
mod embedding;
mod error;
mod grouper;
mod ingest;
mod merger;
mod models;
mod orchestrator;
mod report;
mod scheduler;
mod store;
mod utils;
mod vector;

use cli::{Cli, Command};
use config::Settings;
use dedup::ContentHasher;
use embedding::{HttpEmbedder, RetryEmbed};
use orchestrator::Orchestrator;
use store::{ArticleStore, JsonFileStore};
use utils::ensure_writable_dir;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = Instant::now();
    info!("bluemonitor_topics starting up");

    let args = Cli::parse();
    debug!(command = ?args.command, store = %args.store, "Parsed CLI arguments");

    let mut settings = Settings::load(args.config.as_deref())?;
    if args.embedding_api_key.is_some() {
        settings.embedding.api_key = args.embedding_api_key.clone();
    }

    // Early check: ensure the report dir is writable
    if let Some(dir) = args.report_dir.as_deref() {
        if let Err(e) = ensure_writable_dir(dir).await {
            error!(
                path = %dir,
                error = %e,
                "Report directory is not writable (fix perms or choose a different path)"
            );
            return Err(e);
        }
    }

    let store = JsonFileStore::open(&args.store).await?;

    match &args.command {
        Command::Import { file } => {
            let hasher = ContentHasher::new(settings.dedup.clone());
            let report = ingest::import_file(&store, file, &hasher).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Topics => {
            let topics = store.get_topic_centroids().await?;
            println!("{}", serde_json::to_string_pretty(&report::topic_listing(&topics))?);
        }
        Command::Run | Command::Serve => {
            let owner = args
                .owner
                .clone()
                .unwrap_or_else(|| format!("worker-{}-{}", std::process::id(), Uuid::new_v4()));
            let embedder = RetryEmbed::new(
                HttpEmbedder::new(&settings.embedding)?,
                settings.embedding.max_retries,
                Duration::from_millis(500),
            );
            let period = settings.run_interval();
            let orchestrator = Orchestrator::new(store, embedder, settings, owner);
            let shutdown = shutdown_on_ctrl_c();

            if matches!(args.command, Command::Run) {
                let stats =
                    scheduler::run_and_report(&orchestrator, &shutdown, args.report_dir.as_deref())
                        .await?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                scheduler::run_periodic(&orchestrator, period, args.report_dir.as_deref(), shutdown)
                    .await;
            }
        }
    }

    info!(
        elapsed_ms = start_time.elapsed().as_millis() as u64,
        "bluemonitor_topics finished"
    );
    Ok(())
}

/// Watch flag that turns true on the first Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received; finishing current step and shutting down");
                let _ = tx.send(true);
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });
    rx
}
