//! Data models for articles, topics and clustering runs.
//!
//! - [`Article`]: a collected news article, possibly embedded and clustered
//! - [`Topic`]: a group of articles with its running aggregate
//! - [`GroupMember`]: the validated view of an article the clustering code works on
//! - [`RunLease`]: the persisted run lock
//! - [`RunStats`]: the observable result of an orchestrator run

use crate::vector::{add_assign, centroid_from_sum, to_sum};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A news article as held by the article store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub published_at: DateTime<Utc>,
    /// Hash of the normalized title and url, see [`crate::dedup::ContentHasher`].
    pub content_hash: String,
    /// Written once by the embedding step, never changed afterwards.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// `None` means not yet clustered.
    #[serde(default)]
    pub topic_id: Option<String>,
    /// Reason the article was excluded from clustering.
    #[serde(default)]
    pub unprocessable: Option<String>,
}

impl Article {
    /// Text sent to the embedding provider: title, then description.
    pub fn embedding_text(&self) -> String {
        let title = self.title.trim();
        match self.description.as_deref().map(str::trim) {
            Some(desc) if !desc.is_empty() && !title.is_empty() => format!("{title}. {desc}"),
            Some(desc) if !desc.is_empty() => desc.to_string(),
            _ => title.to_string(),
        }
    }

    pub fn is_clusterable(&self) -> bool {
        self.topic_id.is_none() && self.unprocessable.is_none() && self.embedding.is_some()
    }
}

/// An article selected for clustering, with its embedding checked.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMember {
    pub id: String,
    pub title: String,
    /// Publishing domain, see [`crate::dedup::source_domain`].
    pub source: Option<String>,
    pub embedding: Vec<f32>,
    pub published_at: DateTime<Utc>,
    pub content_hash: String,
}

impl GroupMember {
    /// `true` when `self` should label a topic in preference to `other`:
    /// the more recent article wins, ties go to the smaller id.
    pub fn outranks(&self, other_id: &str, other_published_at: DateTime<Utc>) -> bool {
        outranks((self.id.as_str(), self.published_at), (other_id, other_published_at))
    }
}

fn outranks(a: (&str, DateTime<Utc>), b: (&str, DateTime<Utc>)) -> bool {
    match a.1.cmp(&b.1) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => a.0 < b.0,
    }
}

/// A topic and its aggregate over member embeddings.
///
/// `centroid == embedding_sum / member_count` holds after every commit;
/// `version` increases by one on each change and drives the optimistic
/// concurrency check in the store. `title` always follows the
/// representative article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub centroid: Vec<f32>,
    pub embedding_sum: Vec<f64>,
    pub member_count: usize,
    pub version: u64,
    /// Distinct member domains, sorted.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Publication time of the oldest member.
    #[serde(default)]
    pub first_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub representative_article_id: String,
    pub representative_published_at: DateTime<Utc>,
}

impl Topic {
    /// A new topic whose only member is `member`.
    pub fn seed(id: String, member: &GroupMember, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: member.title.clone(),
            centroid: member.embedding.clone(),
            embedding_sum: to_sum(&member.embedding),
            member_count: 1,
            version: 1,
            sources: member.source.iter().cloned().collect(),
            first_seen: member.published_at,
            created_at: now,
            updated_at: now,
            representative_article_id: member.id.clone(),
            representative_published_at: member.published_at,
        }
    }

    /// The aggregate after `member` joins, at the next version.
    pub fn with_member(&self, member: &GroupMember, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        add_assign(&mut next.embedding_sum, &member.embedding);
        next.member_count += 1;
        next.centroid = centroid_from_sum(&next.embedding_sum, next.member_count);
        next.version += 1;
        next.updated_at = now;
        next.first_seen = next.first_seen.min(member.published_at);
        if let Some(source) = &member.source {
            add_source(&mut next.sources, source);
        }
        if member.outranks(&self.representative_article_id, self.representative_published_at) {
            next.title = member.title.clone();
            next.representative_article_id = member.id.clone();
            next.representative_published_at = member.published_at;
        }
        next
    }

    /// The aggregate after every member of `other` moves into `self`.
    ///
    /// Keeps `self.id` and bumps `self.version`; `other` is expected to be
    /// deleted in the same store write.
    pub fn absorb(&self, other: &Topic, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        for (s, o) in next.embedding_sum.iter_mut().zip(&other.embedding_sum) {
            *s += o;
        }
        next.member_count += other.member_count;
        next.centroid = centroid_from_sum(&next.embedding_sum, next.member_count);
        next.version += 1;
        next.updated_at = now;
        next.created_at = next.created_at.min(other.created_at);
        next.first_seen = next.first_seen.min(other.first_seen);
        for source in &other.sources {
            add_source(&mut next.sources, source);
        }
        let theirs = (other.representative_article_id.as_str(), other.representative_published_at);
        let ours = (self.representative_article_id.as_str(), self.representative_published_at);
        if outranks(theirs, ours) {
            next.title = other.title.clone();
            next.representative_article_id = other.representative_article_id.clone();
            next.representative_published_at = other.representative_published_at;
        }
        next
    }
}

fn add_source(sources: &mut Vec<String>, source: &str) {
    if let Err(pos) = sources.binary_search_by(|s| s.as_str().cmp(source)) {
        sources.insert(pos, source.to_string());
    }
}

/// Read-only projection of a topic for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicSummary {
    pub id: String,
    pub title: String,
    pub member_count: usize,
    pub sources: Vec<String>,
    pub representative_article_id: String,
    pub first_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Topic> for TopicSummary {
    fn from(t: &Topic) -> Self {
        Self {
            id: t.id.clone(),
            title: t.title.clone(),
            member_count: t.member_count,
            sources: t.sources.clone(),
            representative_article_id: t.representative_article_id.clone(),
            first_seen: t.first_seen,
            updated_at: t.updated_at,
        }
    }
}

/// The persisted mutual-exclusion flag for orchestrator runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLease {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RunLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Steps of a single orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Selecting,
    Embedding,
    Grouping,
    Merging,
    Committing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunOutcome {
    Completed,
    /// Another owner holds a live lease.
    Skipped { holder: String },
    /// Shutdown was requested; stopped before `phase` started.
    Cancelled { phase: RunPhase },
    /// The lease expired or was taken over mid-run; remaining groups were left.
    LeaseLost,
}

/// A group whose merge did not complete in this run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedGroup {
    /// Articles that are still unclustered.
    pub article_ids: Vec<String>,
    pub reason: String,
}

/// The externally observable result of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStats {
    pub run_id: String,
    pub owner: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub articles_embedded: usize,
    pub embedding_deferred: usize,
    pub articles_unprocessable: usize,
    pub articles_processed: usize,
    pub groups_formed: usize,
    pub topics_created: usize,
    pub topics_merged: usize,
    /// Topics folded into a similar topic after committing.
    pub topics_consolidated: usize,
    pub articles_assigned: usize,
    pub duplicates_collapsed: usize,
    pub failed_groups: Vec<FailedGroup>,
    pub articles_pruned: usize,
    pub topics_pruned: usize,
}

impl RunStats {
    pub fn new(run_id: String, owner: String, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            owner,
            started_at,
            finished_at: None,
            outcome: RunOutcome::Completed,
            articles_embedded: 0,
            embedding_deferred: 0,
            articles_unprocessable: 0,
            articles_processed: 0,
            groups_formed: 0,
            topics_created: 0,
            topics_merged: 0,
            topics_consolidated: 0,
            articles_assigned: 0,
            duplicates_collapsed: 0,
            failed_groups: Vec::new(),
            articles_pruned: 0,
            topics_pruned: 0,
        }
    }

    pub fn failures(&self) -> usize {
        self.failed_groups.len()
    }

    /// `true` when the run changed nothing in the store.
    pub fn is_noop(&self) -> bool {
        self.articles_embedded == 0
            && self.articles_unprocessable == 0
            && self.articles_assigned == 0
            && self.topics_created == 0
            && self.topics_merged == 0
            && self.topics_consolidated == 0
            && self.articles_pruned == 0
    }
}

/// A collected article as emitted by the news collector, before import.
#[derive(Debug, Clone, Deserialize)]
pub struct RawArticle {
    #[serde(default)]
    pub id: Option<String>,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}
