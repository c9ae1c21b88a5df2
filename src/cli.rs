//! Command-line interface definitions.
//!
//! Global options select the configuration file and the store; the
//! subcommand picks what to do with them. Store path, report directory,
//! owner and API key can also come from the environment.

use clap::{Parser, Subcommand};

/// Incremental topic clustering for collected news articles.
///
/// # Examples
///
/// ```sh
/// # Import the collector's output, then cluster once
/// bluemonitor_topics --store ./data/store.json import ./articles.jsonl
/// bluemonitor_topics --store ./data/store.json --report-dir ./reports run
///
/// # Cluster every `run_interval_minutes` until Ctrl-C
/// bluemonitor_topics -c config.yaml --store ./data/store.json serve
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional path to config.yaml file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path of the JSON article store
    #[arg(long, env = "BLUEMONITOR_STORE", default_value = "store.json", global = true)]
    pub store: String,

    /// Directory for per-run JSON reports
    #[arg(long, env = "BLUEMONITOR_REPORT_DIR", global = true)]
    pub report_dir: Option<String>,

    /// Lease owner id; defaults to a random id per process
    #[arg(long, env = "BLUEMONITOR_OWNER", global = true)]
    pub owner: Option<String>,

    /// API key for the embedding endpoint
    #[arg(long, env = "EMBEDDING_API_KEY", hide_env_values = true, global = true)]
    pub embedding_api_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Perform a single clustering run
    Run,
    /// Run periodically until interrupted
    Serve,
    /// Import collected articles from a JSON lines file
    Import {
        /// JSON lines file produced by the collector
        file: String,
    },
    /// Print the persisted topics as JSON
    Topics,
}
