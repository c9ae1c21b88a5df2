//! Runtime configuration loaded from a YAML file.
//!
//! Every key is optional; a missing file section falls back to the defaults
//! below. Example:
//!
//! ```yaml
//! similarity_group_threshold: 0.85
//! similarity_merge_threshold: 0.80
//! batch_size: 1000
//! run_lock_timeout_seconds: 900
//! embedding:
//!   endpoint: http://localhost:8080/v1
//!   dimension: 384
//! dedup:
//!   fields: [title, url]
//! ```

use crate::error::ConfigError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration as StdDuration;
use tracing::{info, warn};

/// Upper bound for `run_lock_timeout_seconds`: one week.
pub const MAX_LEASE_SECONDS: u64 = 7 * 24 * 60 * 60;
/// Upper bound for the day windows: a century.
pub const MAX_WINDOW_DAYS: u32 = 36_500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Cosine similarity at or above which two articles are linked in a batch.
    pub similarity_group_threshold: f32,
    /// Cosine similarity at or above which a group joins an existing topic.
    pub similarity_merge_threshold: f32,
    /// Maximum number of unclustered articles selected per run.
    pub batch_size: usize,
    /// Lifetime of the run lease; a run renews it between groups.
    pub run_lock_timeout_seconds: u64,
    /// Interval between runs in `serve` mode.
    pub run_interval_minutes: u64,
    /// Only articles published within this many days are selected.
    pub lookback_days: Option<u32>,
    /// Only topics updated within this many days are merge candidates.
    pub topic_window_days: Option<u32>,
    /// Articles published longer ago than this are pruned after each run.
    pub retention_days: Option<u32>,
    /// Attempts per group when topic commits keep conflicting.
    pub commit_retry_attempts: usize,
    /// Merge topics whose centroids end up within the merge threshold.
    pub consolidate_topics: bool,
    pub embedding: EmbeddingSettings,
    pub dedup: DedupSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            similarity_group_threshold: 0.85,
            similarity_merge_threshold: 0.80,
            batch_size: 1000,
            run_lock_timeout_seconds: 900,
            run_interval_minutes: 720,
            lookback_days: Some(30),
            topic_window_days: Some(30),
            retention_days: None,
            commit_retry_attempts: 3,
            consolidate_topics: true,
            embedding: EmbeddingSettings::default(),
            dedup: DedupSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// Base URL of an OpenAI-compatible API; `/embeddings` is appended.
    pub endpoint: String,
    pub model: String,
    pub dimension: usize,
    pub timeout_seconds: u64,
    pub max_retries: usize,
    /// Embedding calls in flight at once.
    pub concurrency: usize,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/v1".to_string(),
            model: "sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2".to_string(),
            dimension: 384,
            timeout_seconds: 30,
            max_retries: 3,
            concurrency: 8,
            api_key: None,
        }
    }
}

impl EmbeddingSettings {
    pub fn timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.timeout_seconds)
    }
}

/// Fields that make up an article's content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashField {
    Title,
    Url,
    Description,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub fields: Vec<HashField>,
    /// Drop the query string when normalizing urls.
    pub strip_query: bool,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            fields: vec![HashField::Title, HashField::Url],
            strip_query: true,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or defaults when no path is given.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let settings = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(Path::new(p)).map_err(ConfigError::Read)?;
                let s = Self::from_yaml(&raw)?;
                info!(config_path = p, "Loaded configuration");
                s
            }
            None => {
                info!("No config file given; using defaults");
                Self::default()
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, v) in [
            ("similarity_group_threshold", self.similarity_group_threshold),
            ("similarity_merge_threshold", self.similarity_merge_threshold),
        ] {
            if !(-1.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid(format!("{name} must be within [-1, 1], got {v}")));
            }
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if self.commit_retry_attempts == 0 {
            return Err(ConfigError::Invalid("commit_retry_attempts must be positive".into()));
        }
        if !(1..=MAX_LEASE_SECONDS).contains(&self.run_lock_timeout_seconds) {
            return Err(ConfigError::Invalid(format!(
                "run_lock_timeout_seconds must be within [1, {MAX_LEASE_SECONDS}], got {}",
                self.run_lock_timeout_seconds
            )));
        }
        for (name, days) in [
            ("lookback_days", self.lookback_days),
            ("topic_window_days", self.topic_window_days),
            ("retention_days", self.retention_days),
        ] {
            if days.is_some_and(|d| d > MAX_WINDOW_DAYS) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be at most {MAX_WINDOW_DAYS}, got {days:?}"
                )));
            }
        }
        if self.embedding.dimension == 0 {
            return Err(ConfigError::Invalid("embedding.dimension must be positive".into()));
        }
        if self.embedding.concurrency == 0 {
            return Err(ConfigError::Invalid("embedding.concurrency must be positive".into()));
        }
        if self.dedup.fields.is_empty() {
            return Err(ConfigError::Invalid("dedup.fields must name at least one field".into()));
        }
        if self.similarity_merge_threshold < self.similarity_group_threshold {
            warn!(
                group = self.similarity_group_threshold,
                merge = self.similarity_merge_threshold,
                "Merge threshold is below group threshold; groups join existing topics more easily than they form"
            );
        }
        Ok(())
    }

    /// Run lease lifetime, capped at [`MAX_LEASE_SECONDS`].
    pub fn lease_ttl(&self) -> Duration {
        let secs = self.run_lock_timeout_seconds.min(MAX_LEASE_SECONDS);
        Duration::try_seconds(secs as i64).unwrap_or(Duration::MAX)
    }

    pub fn lookback(&self) -> Option<Duration> {
        self.lookback_days.map(days)
    }

    pub fn topic_window(&self) -> Option<Duration> {
        self.topic_window_days.map(days)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_days.map(days)
    }

    pub fn run_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.run_interval_minutes.clamp(1, u64::MAX / 60) * 60)
    }
}

/// `n` days, capped at [`MAX_WINDOW_DAYS`].
fn days(n: u32) -> Duration {
    Duration::try_days(i64::from(n.min(MAX_WINDOW_DAYS))).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.similarity_group_threshold, 0.85);
        assert_eq!(s.similarity_merge_threshold, 0.80);
        assert_eq!(s.commit_retry_attempts, 3);
        assert_eq!(s.embedding.dimension, 384);
        assert_eq!(s.dedup.fields, vec![HashField::Title, HashField::Url]);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let s = Settings::from_yaml(
            "batch_size: 50\nembedding:\n  dimension: 3\ndedup:\n  fields: [url]\n",
        )
        .unwrap();
        assert_eq!(s.batch_size, 50);
        assert_eq!(s.embedding.dimension, 3);
        assert_eq!(s.embedding.concurrency, 8);
        assert_eq!(s.dedup.fields, vec![HashField::Url]);
        assert!(s.dedup.strip_query);
        assert_eq!(s.similarity_group_threshold, 0.85);
    }

    #[test]
    fn empty_yaml_is_default() {
        assert_eq!(Settings::from_yaml("  \n").unwrap(), Settings::default());
    }

    #[test]
    fn null_windows_disable_them() {
        let s = Settings::from_yaml("lookback_days: null\ntopic_window_days: ~\n").unwrap();
        assert!(s.lookback_days.is_none());
        assert!(s.topic_window_days.is_none());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let s = Settings {
            similarity_group_threshold: 1.5,
            ..Settings::default()
        };
        assert!(matches!(s.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_batch_and_retries() {
        let s = Settings {
            batch_size: 0,
            ..Settings::default()
        };
        assert!(s.validate().is_err());
        let s = Settings {
            commit_retry_attempts: 0,
            ..Settings::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn huge_lease_and_windows_are_rejected_not_wrapped() {
        let s = Settings {
            run_lock_timeout_seconds: u64::MAX,
            ..Settings::default()
        };
        assert!(matches!(s.validate(), Err(ConfigError::Invalid(_))));
        assert_eq!(s.lease_ttl(), Duration::seconds(MAX_LEASE_SECONDS as i64));

        let s = Settings {
            lookback_days: Some(u32::MAX),
            ..Settings::default()
        };
        assert!(s.validate().is_err());
        assert_eq!(s.lookback(), Some(Duration::days(i64::from(MAX_WINDOW_DAYS))));
        assert_eq!(Settings::default().lease_ttl(), Duration::seconds(900));
    }

    #[test]
    fn malformed_yaml_is_parse_error() {
        assert!(matches!(
            Settings::from_yaml("batch_size: [unclosed"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "run_interval_minutes: 5\n").unwrap();
        let s = Settings::load(path.to_str()).unwrap();
        assert_eq!(s.run_interval(), StdDuration::from_secs(300));
        assert!(matches!(
            Settings::load(Some("/nonexistent/config.yaml")),
            Err(ConfigError::Read(_))
        ));
    }
}
