//! Error types for the clustering pipeline.
//!
//! Errors are split along the lines the pipeline reacts to them:
//! transient failures are retried or deferred to the next run, data errors
//! mark an article unprocessable, and store failures abort only the unit of
//! work (a group, or the whole run when selection itself fails).

use crate::merger::MergeReport;
use std::time::Duration;
use thiserror::Error;

/// Failure of the embedding provider for a single text.
#[derive(Error, Debug)]
pub enum EmbedError {
    /// Retryable: network failure, rate limit, server error.
    #[error("transient embedding failure: {0}")]
    Transient(String),

    /// The content cannot be embedded (empty text, rejected input).
    #[error("text cannot be embedded: {0}")]
    Permanent(String),

    #[error("embedding call timed out after {0:?}")]
    Timeout(Duration),
}

impl EmbedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbedError::Transient(_) | EmbedError::Timeout(_))
    }
}

/// Article/topic store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store invariant violated: {0}")]
    Invariant(String),
}

/// Input handed to the grouper is not a valid batch.
#[derive(Error, Debug, PartialEq)]
pub enum GroupError {
    #[error("article {id} has dimension {found}, expected {expected}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        found: usize,
    },
}

/// Failure merging one group; recorded in the run statistics, never fatal.
///
/// Every variant carries the commits made before the failure, so callers
/// can account for them and know which members are still unclustered.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("store error: {source}")]
    Store {
        source: StoreError,
        partial: Box<MergeReport>,
    },

    #[error("topic {topic_id:?} still conflicting after {attempts} attempts")]
    RetriesExhausted {
        topic_id: Option<String>,
        attempts: usize,
        partial: Box<MergeReport>,
    },
}

impl MergeError {
    /// What the merge committed before it failed.
    pub fn partial(&self) -> &MergeReport {
        match self {
            MergeError::Store { partial, .. } | MergeError::RetriesExhausted { partial, .. } => partial,
        }
    }

    pub fn into_partial(self) -> MergeReport {
        match self {
            MergeError::Store { partial, .. } | MergeError::RetriesExhausted { partial, .. } => *partial,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure that aborts a whole orchestrator run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_transient_are_retryable() {
        assert!(EmbedError::Transient("503".into()).is_transient());
        assert!(EmbedError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!EmbedError::Permanent("empty".into()).is_transient());
    }

    #[test]
    fn retry_exhaustion_names_topic() {
        let e = MergeError::RetriesExhausted {
            topic_id: Some("t1".into()),
            attempts: 3,
            partial: Box::new(MergeReport {
                committed: vec!["a".into()],
                ..MergeReport::default()
            }),
        };
        assert!(e.to_string().contains("t1"));
        assert!(e.to_string().contains('3'));
        assert_eq!(e.partial().committed, vec!["a"]);
    }
}
