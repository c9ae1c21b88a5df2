//! Import of collected articles.
//!
//! The collector emits one JSON object per line:
//!
//! ```text
//! {"url": "https://g1.globo.com/...", "title": "...", "description": "...", "published_at": "2025-04-02T09:00:00Z"}
//! ```
//!
//! `id`, `description`, `published_at` and `embedding` are optional. Lines
//! that do not parse are logged and counted; they never stop an import.

use crate::dedup::ContentHasher;
use crate::error::StoreError;
use crate::models::{Article, RawArticle};
use crate::store::ArticleStore;
use crate::utils::truncate_for_log;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::error::Error;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub read: usize,
    pub inserted: usize,
    /// Lines whose id was already in the store.
    pub existing: usize,
    pub rejected: usize,
}

/// Build a store article from a collector record.
pub fn to_article(raw: RawArticle, hasher: &ContentHasher, now: DateTime<Utc>) -> Article {
    let content_hash = hasher.hash(&raw.title, &raw.url, raw.description.as_deref());
    Article {
        id: raw
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        url: raw.url,
        title: raw.title,
        description: raw.description,
        published_at: raw.published_at.unwrap_or(now),
        content_hash,
        embedding: raw.embedding,
        topic_id: None,
        unprocessable: None,
    }
}

/// Import every JSON line of `input`.
///
/// # Arguments
/// * `store` - Destination; existing ids are left untouched
/// * `input` - Collector output, one [`RawArticle`] per line
/// * `hasher` - Content hasher used for duplicate detection
/// * `now` - Publication time for records that carry none
///
/// # Returns
/// Line counts by outcome. Malformed lines are counted as rejected.
///
/// # Errors
/// The first store failure; lines before it stay imported.
pub async fn import_lines<S: ArticleStore>(
    store: &S,
    input: &str,
    hasher: &ContentHasher,
    now: DateTime<Utc>,
) -> Result<ImportReport, StoreError> {
    let mut report = ImportReport::default();
    for (lineno, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        report.read += 1;
        let raw: RawArticle = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(line = lineno + 1, error = %e, preview = %truncate_for_log(line, 120), "Skipping malformed article line");
                report.rejected += 1;
                continue;
            }
        };
        let article = to_article(raw, hasher, now);
        let id = article.id.clone();
        if store.insert_article(article).await? {
            debug!(article_id = %id, "Imported article");
            report.inserted += 1;
        } else {
            report.existing += 1;
        }
    }
    Ok(report)
}

/// Read `path` and import it with [`import_lines`].
#[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
pub async fn import_file<S: ArticleStore>(
    store: &S,
    path: impl AsRef<Path>,
    hasher: &ContentHasher,
) -> Result<ImportReport, Box<dyn Error>> {
    let input = fs::read_to_string(path.as_ref()).await?;
    let report = import_lines(store, &input, hasher, Utc::now()).await?;
    info!(
        read = report.read,
        inserted = report.inserted,
        existing = report.existing,
        rejected = report.rejected,
        "Import finished"
    );
    Ok(report)
}
