//! Store contents and the rules every store implementation enforces.
//!
//! Both [`super::MemoryStore`] and [`super::JsonFileStore`] keep a
//! [`StoreState`] behind a mutex; this module holds the logic so that the
//! optimistic version check, the per-article commit and the pruning rules
//! are the same whichever backend is used.

use super::{CommitOutcome, LeaseGrant, PruneReport};
use crate::error::StoreError;
use crate::models::{Article, RunLease, Topic};
use crate::dedup::source_domain;
use crate::vector::{add_assign, centroid_from_sum, to_sum};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

const SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StoreState {
    pub articles: BTreeMap<String, Article>,
    pub topics: BTreeMap<String, Topic>,
    #[serde(default)]
    pub lease: Option<RunLease>,
}

/// Most recent first, then smallest id.
fn recency_order(a: &Article, b: &Article) -> std::cmp::Ordering {
    b.published_at
        .cmp(&a.published_at)
        .then_with(|| a.id.cmp(&b.id))
}

impl StoreState {
    pub fn insert_article(&mut self, article: Article) -> bool {
        if self.articles.contains_key(&article.id) {
            return false;
        }
        self.articles.insert(article.id.clone(), article);
        true
    }

    pub fn fetch_unclustered(&self, limit: usize, since: Option<DateTime<Utc>>) -> Vec<Article> {
        let mut out: Vec<Article> = self
            .articles
            .values()
            .filter(|a| a.is_clusterable())
            .filter(|a| since.is_none_or(|s| a.published_at >= s))
            .cloned()
            .collect();
        out.sort_by(recency_order);
        out.truncate(limit);
        out
    }

    pub fn fetch_missing_embeddings(&self, limit: usize, since: Option<DateTime<Utc>>) -> Vec<Article> {
        let mut out: Vec<Article> = self
            .articles
            .values()
            .filter(|a| a.embedding.is_none() && a.unprocessable.is_none() && a.topic_id.is_none())
            .filter(|a| since.is_none_or(|s| a.published_at >= s))
            .cloned()
            .collect();
        out.sort_by(recency_order);
        out.truncate(limit);
        out
    }

    pub fn set_embedding(&mut self, article_id: &str, embedding: Vec<f32>) -> Result<(), StoreError> {
        let article = self
            .articles
            .get_mut(article_id)
            .ok_or_else(|| StoreError::NotFound(format!("article {article_id}")))?;
        if article.embedding.is_some() {
            return Err(StoreError::Invariant(format!(
                "article {article_id} already has an embedding"
            )));
        }
        article.embedding = Some(embedding);
        Ok(())
    }

    pub fn mark_unprocessable(&mut self, article_id: &str, reason: &str) -> Result<(), StoreError> {
        let article = self
            .articles
            .get_mut(article_id)
            .ok_or_else(|| StoreError::NotFound(format!("article {article_id}")))?;
        article.unprocessable = Some(reason.to_string());
        Ok(())
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.topics.values().cloned().collect()
    }

    pub fn get_topic(&self, topic_id: &str) -> Option<Topic> {
        self.topics.get(topic_id).cloned()
    }

    /// Assigned article with `content_hash`, smallest id first.
    pub fn find_assigned_by_hash(&self, content_hash: &str) -> Option<(String, String)> {
        self.articles
            .values()
            .filter(|a| a.content_hash == content_hash)
            .find_map(|a| a.topic_id.as_ref().map(|t| (a.id.clone(), t.clone())))
    }

    pub fn list_members(&self, topic_id: &str) -> Vec<Article> {
        self.articles
            .values()
            .filter(|a| a.topic_id.as_deref() == Some(topic_id))
            .cloned()
            .collect()
    }

    /// Point `article_id` at `topic` and store the topic aggregate, or neither.
    ///
    /// `expected_version` is `None` when `topic` is being created. The new
    /// aggregate must be exactly the current one plus this article; anything
    /// else, including a stale version, is reported as a conflict.
    pub fn commit_assignment(
        &mut self,
        article_id: &str,
        topic: &Topic,
        expected_version: Option<u64>,
    ) -> Result<CommitOutcome, StoreError> {
        let article = self
            .articles
            .get(article_id)
            .ok_or_else(|| StoreError::NotFound(format!("article {article_id}")))?;
        if let Some(existing) = &article.topic_id {
            return Ok(CommitOutcome::AlreadyAssigned {
                topic_id: existing.clone(),
            });
        }
        let Some(embedding) = article.embedding.as_deref() else {
            return Err(StoreError::Invariant(format!(
                "article {article_id} has no embedding"
            )));
        };

        let current = self.topics.get(&topic.id);
        let consistent = match (current, expected_version) {
            (None, None) => {
                topic.member_count == 1
                    && topic.version == 1
                    && sum_matches(&topic.embedding_sum, Some(to_sum(embedding)))
            }
            (Some(cur), Some(v)) if cur.version == v => {
                topic.member_count == cur.member_count + 1
                    && topic.version == v + 1
                    && sum_matches(&topic.embedding_sum, plus(&cur.embedding_sum, embedding))
            }
            _ => false,
        };
        if !consistent {
            let current_version = current.map(|t| t.version);
            warn!(
                article_id,
                topic_id = %topic.id,
                ?expected_version,
                ?current_version,
                "Topic commit rejected"
            );
            return Ok(CommitOutcome::Conflict { current_version });
        }

        self.topics.insert(topic.id.clone(), topic.clone());
        if let Some(article) = self.articles.get_mut(article_id) {
            article.topic_id = Some(topic.id.clone());
        }
        debug!(article_id, topic_id = %topic.id, version = topic.version, "Assignment committed");
        Ok(CommitOutcome::Committed)
    }

    /// Move every member of `absorbed_id` into `merged` and delete `absorbed_id`.
    ///
    /// `merged` must be the survivor at `survivor_version` plus the absorbed
    /// topic at `absorbed_version`, exactly as [`Topic::absorb`] builds it.
    pub fn merge_topics(
        &mut self,
        merged: &Topic,
        survivor_version: u64,
        absorbed_id: &str,
        absorbed_version: u64,
    ) -> CommitOutcome {
        let consistent = match (self.topics.get(&merged.id), self.topics.get(absorbed_id)) {
            (Some(s), Some(a)) if merged.id != absorbed_id => {
                s.version == survivor_version
                    && a.version == absorbed_version
                    && merged.version == survivor_version + 1
                    && merged.member_count == s.member_count + a.member_count
                    && sum_matches(&merged.embedding_sum, combined(&s.embedding_sum, &a.embedding_sum))
            }
            _ => false,
        };
        if !consistent {
            let current_version = self.topics.get(&merged.id).map(|t| t.version);
            warn!(
                survivor = %merged.id,
                absorbed = absorbed_id,
                survivor_version,
                absorbed_version,
                ?current_version,
                "Topic merge rejected"
            );
            return CommitOutcome::Conflict { current_version };
        }

        self.topics.remove(absorbed_id);
        self.topics.insert(merged.id.clone(), merged.clone());
        let mut moved = 0;
        for article in self.articles.values_mut() {
            if article.topic_id.as_deref() == Some(absorbed_id) {
                article.topic_id = Some(merged.id.clone());
                moved += 1;
            }
        }
        debug!(survivor = %merged.id, absorbed = absorbed_id, moved, "Topics merged");
        CommitOutcome::Committed
    }

    pub fn acquire_lease(&mut self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> LeaseGrant {
        match &self.lease {
            Some(lease) if lease.owner != owner && !lease.is_expired(now) => {
                LeaseGrant::Held(lease.clone())
            }
            _ => {
                let lease = RunLease {
                    owner: owner.to_string(),
                    acquired_at: now,
                    expires_at: now + ttl,
                };
                self.lease = Some(lease.clone());
                LeaseGrant::Acquired(lease)
            }
        }
    }

    pub fn renew_lease(&mut self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        match &mut self.lease {
            Some(lease) if lease.owner == owner => {
                lease.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    pub fn release_lease(&mut self, owner: &str) -> bool {
        if self.lease.as_ref().is_some_and(|l| l.owner == owner) {
            self.lease = None;
            return true;
        }
        false
    }

    /// Remove articles published before `cutoff` and rebuild the topics they left.
    ///
    /// Topics left without members are deleted.
    pub fn prune_published_before(&mut self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> PruneReport {
        let expired: Vec<String> = self
            .articles
            .values()
            .filter(|a| a.published_at < cutoff)
            .map(|a| a.id.clone())
            .collect();

        let mut report = PruneReport::default();
        let mut touched: BTreeSet<String> = BTreeSet::new();
        for id in expired {
            if let Some(article) = self.articles.remove(&id) {
                report.articles += 1;
                touched.extend(article.topic_id);
            }
        }

        for topic_id in touched {
            let members = self.list_members(&topic_id);
            if members.is_empty() {
                self.topics.remove(&topic_id);
                report.topics += 1;
                continue;
            }
            let Some(topic) = self.topics.get_mut(&topic_id) else {
                continue;
            };
            let mut sum = vec![0.0f64; topic.embedding_sum.len()];
            for e in members.iter().filter_map(|m| m.embedding.as_deref()) {
                add_assign(&mut sum, e);
            }
            topic.embedding_sum = sum;
            topic.member_count = members.len();
            topic.centroid = centroid_from_sum(&topic.embedding_sum, topic.member_count);
            topic.version += 1;
            topic.updated_at = now;
            topic.sources = members
                .iter()
                .filter_map(|m| source_domain(&m.url))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if let Some(oldest) = members.iter().map(|m| m.published_at).min() {
                topic.first_seen = oldest;
            }
            if let Some(rep) = members.iter().min_by(|a, b| recency_order(a, b)) {
                topic.title = rep.title.clone();
                topic.representative_article_id = rep.id.clone();
                topic.representative_published_at = rep.published_at;
            }
        }
        report
    }
}

/// `sum + v`, or `None` when the dimensions differ.
fn plus(sum: &[f64], v: &[f32]) -> Option<Vec<f64>> {
    if sum.len() != v.len() {
        return None;
    }
    let mut out = sum.to_vec();
    add_assign(&mut out, v);
    Some(out)
}

fn combined(a: &[f64], b: &[f64]) -> Option<Vec<f64>> {
    (a.len() == b.len()).then(|| a.iter().zip(b).map(|(x, y)| x + y).collect())
}

fn sum_matches(new_sum: &[f64], expected: Option<Vec<f64>>) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    new_sum.len() == expected.len()
        && new_sum
            .iter()
            .zip(&expected)
            .all(|(s, e)| (s - e).abs() <= SUM_TOLERANCE * (1.0 + e.abs()))
}
