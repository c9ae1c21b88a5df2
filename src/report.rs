//! JSON run reports.
//!
//! Every completed, skipped or cancelled run can be written out so the
//! statistics survive the process.
//!
//! # Output Structure
//!
//! Files are organized by the UTC date the run started:
//! ```text
//! report_dir/
//! └── 2025-04-02/
//!     ├── 090000_6f1c….json
//!     └── 210000_a93e….json
//! ```

use crate::models::{RunStats, Topic, TopicSummary};
use itertools::Itertools;
use std::error::Error;
use std::path::PathBuf;
use tokio::fs;
use tracing::{error, info, instrument};

/// Path of the report for `stats` under `report_dir`.
pub fn report_path(stats: &RunStats, report_dir: &str) -> PathBuf {
    let day = stats.started_at.format("%Y-%m-%d").to_string();
    let file = format!("{}_{}.json", stats.started_at.format("%H%M%S"), stats.run_id);
    PathBuf::from(report_dir).join(day).join(file)
}

/// Write `stats` as pretty JSON, creating the date directory as needed.
#[instrument(level = "info", skip_all, fields(report_dir = %report_dir, run_id = %stats.run_id))]
pub async fn write_run_report(stats: &RunStats, report_dir: &str) -> Result<PathBuf, Box<dyn Error>> {
    let json = serde_json::to_string_pretty(stats)?;
    let path = report_path(stats, report_dir);

    if let Some(dir) = path.parent() {
        if let Err(e) = fs::create_dir_all(dir).await {
            error!(dir = %dir.display(), error = %e, "Failed to create report dir");
            return Err(e.into());
        }
    }

    fs::write(&path, json).await?;
    info!(path = %path.display(), "Wrote run report");
    Ok(path)
}

/// Topics for display: largest first, then by id.
pub fn topic_listing(topics: &[Topic]) -> Vec<TopicSummary> {
    topics
        .iter()
        .map(TopicSummary::from)
        .sorted_by(|a, b| {
            b.member_count
                .cmp(&a.member_count)
                .then_with(|| a.id.cmp(&b.id))
        })
        .collect()
}
