//! Article and topic persistence.
//!
//! [`ArticleStore`] is the seam between the clustering pipeline and the
//! document database. The pipeline only ever talks to this trait; two
//! implementations ship with the crate:
//!
//! - [`MemoryStore`]: process-local, used by tests and dry runs
//! - [`JsonFileStore`]: a JSON snapshot on disk, rewritten after every mutation
//!
//! # Consistency
//!
//! [`ArticleStore::commit_assignment`] is the only write that touches topic
//! aggregates. It is atomic per article and guarded by the topic's
//! `version`: a commit built from a stale aggregate comes back as
//! [`CommitOutcome::Conflict`] and changes nothing.

use crate::error::StoreError;
use crate::models::{Article, RunLease, Topic};
use chrono::{DateTime, Duration, Utc};

mod json;
mod memory;
mod state;

pub use json::JsonFileStore;
pub use memory::MemoryStore;
pub use state::StoreState;

/// Result of [`ArticleStore::commit_assignment`] and [`ArticleStore::merge_topics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Version check or aggregate check failed; reload the topic and retry.
    Conflict { current_version: Option<u64> },
    /// The article was clustered in the meantime; nothing was written.
    AlreadyAssigned { topic_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeaseGrant {
    Acquired(RunLease),
    /// Another owner holds an unexpired lease.
    Held(RunLease),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub articles: usize,
    pub topics: usize,
}

/// Persistence operations consumed by the clustering pipeline.
///
/// Every method is one atomic read or write. Implementations report
/// backend failures as [`StoreError::Io`] or [`StoreError::Serialization`];
/// the other variants are documented per method.
pub trait ArticleStore {
    /// Insert `article` unless an article with the same id exists.
    ///
    /// # Returns
    /// `true` when the article was new.
    async fn insert_article(&self, article: Article) -> Result<bool, StoreError>;

    /// Embedded, unclustered, processable articles.
    ///
    /// # Arguments
    /// * `limit` - Maximum number of articles returned
    /// * `since` - When set, only articles published at or after it
    ///
    /// # Returns
    /// Most recent first, ties broken by id.
    async fn fetch_unclustered(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Article>, StoreError>;

    /// Unclustered, processable articles still waiting for an embedding.
    ///
    /// Takes the same `limit` and `since` as [`ArticleStore::fetch_unclustered`]
    /// and returns in the same order.
    async fn fetch_missing_embeddings(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Article>, StoreError>;

    /// Store the embedding of an article that has none.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for an unknown id, [`StoreError::Invariant`]
    /// when the article already carries an embedding.
    async fn set_embedding(&self, article_id: &str, embedding: Vec<f32>) -> Result<(), StoreError>;

    /// Exclude an article from clustering, recording `reason`.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for an unknown id.
    async fn mark_unprocessable(&self, article_id: &str, reason: &str) -> Result<(), StoreError>;

    /// All topics, ordered by id.
    async fn get_topic_centroids(&self) -> Result<Vec<Topic>, StoreError>;

    async fn get_topic(&self, topic_id: &str) -> Result<Option<Topic>, StoreError>;

    /// An already clustered article with this content hash.
    ///
    /// # Returns
    /// `(article_id, topic_id)` of the smallest matching id, or `None`.
    async fn find_assigned_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<(String, String)>, StoreError>;

    async fn list_members(&self, topic_id: &str) -> Result<Vec<Article>, StoreError>;

    /// Assign `article_id` to `topic` and write `topic` as the new aggregate.
    ///
    /// # Arguments
    /// * `article_id` - Unclustered, embedded article joining the topic
    /// * `topic` - The aggregate including this article
    /// * `expected_version` - Version `topic` was built from; `None` creates it
    ///
    /// # Returns
    /// [`CommitOutcome::Conflict`] when the stored version differs or
    /// `topic` is not exactly the stored aggregate plus this article.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for an unknown article,
    /// [`StoreError::Invariant`] when it has no embedding.
    async fn commit_assignment(
        &self,
        article_id: &str,
        topic: &Topic,
        expected_version: Option<u64>,
    ) -> Result<CommitOutcome, StoreError>;

    /// Fold `absorbed_id` into `merged.id`, repointing its members.
    ///
    /// # Arguments
    /// * `merged` - Survivor aggregate built by [`Topic::absorb`]
    /// * `survivor_version` - Version of the survivor `merged` was built from
    /// * `absorbed_id` - Topic deleted by the merge
    /// * `absorbed_version` - Version of the absorbed topic `merged` was built from
    ///
    /// # Returns
    /// [`CommitOutcome::Conflict`] when either topic changed or vanished;
    /// nothing is written in that case.
    async fn merge_topics(
        &self,
        merged: &Topic,
        survivor_version: u64,
        absorbed_id: &str,
        absorbed_version: u64,
    ) -> Result<CommitOutcome, StoreError>;

    /// Take the run lease for `ttl` unless another owner holds a live one.
    ///
    /// An expired lease, or one already held by `owner`, is replaced.
    async fn acquire_lease(
        &self,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<LeaseGrant, StoreError>;

    /// Extend the lease; `false` when `owner` no longer holds it.
    async fn renew_lease(&self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Drop the lease if `owner` holds it; `false` otherwise.
    async fn release_lease(&self, owner: &str) -> Result<bool, StoreError>;

    /// Delete articles published before `cutoff` and rebuild their topics.
    ///
    /// Topics left without members are deleted; the others get a fresh
    /// aggregate and representative stamped with `now`.
    async fn prune_published_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PruneReport, StoreError>;
}
