//! One clustering run, from lease to report.
//!
//! ```text
//! Idle → Selecting → Embedding → Grouping → Merging → Committing → Idle
//! ```
//!
//! A run holds the persisted run lease for its whole duration and renews it
//! between groups. Shutdown is observed between phases and between groups;
//! every article commit is atomic on its own, so stopping anywhere leaves the
//! store consistent and the remaining articles for the next run. Once every
//! group is committed, topics that have converged are merged pairwise.

use crate::config::Settings;
use crate::dedup::source_domain;
use crate::embedding::{EmbeddingProvider, embed_with_timeout};
use crate::error::{EmbedError, MergeError, RunError};
use crate::grouper::{ArticleGroup, group_articles};
use crate::merger::{MergeReport, TopicCatalog, TopicMerger};
use crate::models::{Article, FailedGroup, GroupMember, RunOutcome, RunPhase, RunStats};
use crate::store::{ArticleStore, LeaseGrant};
use crate::utils::truncate_for_log;
use crate::vector::is_usable;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use itertools::{Either, Itertools};
use std::collections::BTreeSet;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub struct Orchestrator<S, E> {
    store: S,
    embedder: E,
    settings: Settings,
    owner: String,
}

/// Articles whose content hash is already clustered, by target topic.
type Pinned = Vec<(String, Vec<GroupMember>)>;

enum Flow {
    Continue,
    Stop(RunOutcome),
}

impl<S, E> Orchestrator<S, E>
where
    S: ArticleStore,
    E: EmbeddingProvider,
{
    /// Build an orchestrator for one worker.
    ///
    /// # Arguments
    /// * `store` - Article and topic store shared with other workers
    /// * `embedder` - Provider used for articles that arrive without a vector
    /// * `settings` - Validated runtime settings
    /// * `owner` - Lease owner id; unique per worker process
    pub fn new(store: S, embedder: E, settings: Settings, owner: impl Into<String>) -> Self {
        Self {
            store,
            embedder,
            settings,
            owner: owner.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn merger(&self) -> TopicMerger<'_, S> {
        TopicMerger::new(
            &self.store,
            self.settings.similarity_merge_threshold,
            self.settings.commit_retry_attempts,
        )
    }

    /// Perform one run.
    ///
    /// # Returns
    /// The statistics of the run, whatever its [`RunOutcome`]. Groups that
    /// could not be merged are listed in [`RunStats::failed_groups`].
    ///
    /// # Errors
    /// [`RunError::Store`] only when the store fails while taking the lease
    /// or selecting the batch.
    #[instrument(level = "info", skip_all, fields(owner = %self.owner))]
    pub async fn run_once(&self, shutdown: &watch::Receiver<bool>) -> Result<RunStats, RunError> {
        let t0 = Instant::now();
        let started_at = Utc::now();
        let mut stats = RunStats::new(Uuid::new_v4().to_string(), self.owner.clone(), started_at);

        match self
            .store
            .acquire_lease(&self.owner, self.settings.lease_ttl(), started_at)
            .await?
        {
            LeaseGrant::Held(lease) => {
                info!(
                    holder = %lease.owner,
                    expires_at = %lease.expires_at,
                    "Run lock held by another owner; skipping run"
                );
                stats.outcome = RunOutcome::Skipped {
                    holder: lease.owner,
                };
                stats.finished_at = Some(Utc::now());
                return Ok(stats);
            }
            LeaseGrant::Acquired(lease) => {
                info!(run_id = %stats.run_id, expires_at = %lease.expires_at, "Run lock acquired");
            }
        }

        let result = self.run_phases(&mut stats, shutdown).await;

        match self.store.release_lease(&self.owner).await {
            Ok(true) => debug!("Run lock released"),
            Ok(false) => warn!("Run lock was no longer ours at release"),
            Err(e) => warn!(error = %e, "Failed to release run lock; it will expire"),
        }
        stats.finished_at = Some(Utc::now());
        debug!(phase = ?RunPhase::Idle, "Run phase");
        result?;

        info!(
            run_id = %stats.run_id,
            outcome = ?stats.outcome,
            processed = stats.articles_processed,
            embedded = stats.articles_embedded,
            deferred = stats.embedding_deferred,
            unprocessable = stats.articles_unprocessable,
            groups = stats.groups_formed,
            created = stats.topics_created,
            merged = stats.topics_merged,
            consolidated = stats.topics_consolidated,
            assigned = stats.articles_assigned,
            duplicates = stats.duplicates_collapsed,
            failed = stats.failures(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Run finished"
        );
        Ok(stats)
    }

    async fn run_phases(
        &self,
        stats: &mut RunStats,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), RunError> {
        let limit = self.settings.batch_size;
        let since = self.settings.lookback().map(|d| stats.started_at - d);

        if let Flow::Stop(o) = checkpoint(RunPhase::Selecting, shutdown) {
            stats.outcome = o;
            return Ok(());
        }
        let missing = self.store.fetch_missing_embeddings(limit, since).await?;
        let mut batch = self.store.fetch_unclustered(limit, since).await?;
        info!(
            unclustered = batch.len(),
            missing_embeddings = missing.len(),
            ?since,
            "Batch selected"
        );

        if !missing.is_empty() {
            if let Flow::Stop(o) = checkpoint(RunPhase::Embedding, shutdown) {
                stats.outcome = o;
                return Ok(());
            }
            let embedded = self.embed_missing(missing, stats).await;
            batch.extend(embedded);
            batch.truncate(limit);
        }

        if let Flow::Stop(o) = checkpoint(RunPhase::Grouping, shutdown) {
            stats.outcome = o;
            return Ok(());
        }
        let members = self.validate(batch, stats).await;
        stats.articles_processed = members.len();
        let (pinned, fresh) = self.pin_duplicates(members, stats).await;
        stats.duplicates_collapsed = pinned.iter().map(|(_, m)| m.len()).sum();

        let fresh_ids: Vec<String> = fresh.iter().map(|m| m.id.clone()).collect();
        let groups = match group_articles(fresh, self.settings.similarity_group_threshold) {
            Ok(groups) => groups,
            Err(e) => {
                error!(error = %e, "Grouping failed; batch left for next run");
                stats.failed_groups.push(FailedGroup {
                    article_ids: fresh_ids,
                    reason: e.to_string(),
                });
                Vec::new()
            }
        };
        stats.groups_formed = groups.len();
        info!(
            groups = groups.len(),
            pinned_topics = pinned.len(),
            "Grouping done"
        );

        if let Flow::Stop(o) = checkpoint(RunPhase::Merging, shutdown) {
            stats.outcome = o;
            return Ok(());
        }
        let window_start = self.settings.topic_window().map(|d| stats.started_at - d);
        let topics = match self.store.get_topic_centroids().await {
            Ok(topics) => topics,
            Err(e) => {
                error!(error = %e, "Failed to load topics; batch left for next run");
                let reason = format!("topic catalog unavailable: {e}");
                let units = pinned.iter().map(|(_, m)| m.as_slice());
                for members in units.chain(groups.iter().map(|g| g.members.as_slice())) {
                    stats.failed_groups.push(FailedGroup {
                        article_ids: members.iter().map(|m| m.id.clone()).collect(),
                        reason: reason.clone(),
                    });
                }
                return Ok(());
            }
        };
        let mut catalog = TopicCatalog::new(topics, window_start);
        if catalog.is_empty() {
            debug!("No existing topics; every group starts a new one");
        } else {
            info!(topics = catalog.len(), "Topic catalog loaded");
        }

        let mut touched = BTreeSet::new();
        if let Flow::Stop(o) = self
            .commit_all(pinned, groups, &mut catalog, &mut touched, stats, shutdown)
            .await
        {
            stats.outcome = o;
            return Ok(());
        }

        if self.settings.consolidate_topics && !touched.is_empty() {
            if let Flow::Stop(o) = self.keep_going(shutdown).await {
                stats.outcome = o;
                return Ok(());
            }
            stats.topics_consolidated = self
                .merger()
                .consolidate(&touched, &mut catalog, Utc::now())
                .await;
        }

        if let Some(retention) = self.settings.retention() {
            let now = Utc::now();
            let cutoff = now - retention;
            match self.store.prune_published_before(cutoff, now).await {
                Ok(report) => {
                    stats.articles_pruned = report.articles;
                    stats.topics_pruned = report.topics;
                    if report.articles > 0 {
                        info!(
                            %cutoff,
                            articles = report.articles,
                            topics = report.topics,
                            "Pruned old articles"
                        );
                    }
                }
                Err(e) => warn!(error = %e, %cutoff, "Retention pruning failed"),
            }
        }
        Ok(())
    }

    /// Embed `missing` and return the articles that now carry a vector.
    #[instrument(level = "info", skip_all, fields(n = missing.len()))]
    async fn embed_missing(&self, missing: Vec<Article>, stats: &mut RunStats) -> Vec<Article> {
        let embedder = &self.embedder;
        let limit = self.settings.embedding.timeout();
        let t0 = Instant::now();

        let mut results: Vec<(Article, Result<Vec<f32>, EmbedError>)> = stream::iter(missing)
            .map(|article| async move {
                let text = article.embedding_text();
                let result = if text.trim().is_empty() {
                    Err(EmbedError::Permanent("article has no text".into()))
                } else {
                    embed_with_timeout(embedder, &text, limit).await
                };
                (article, result)
            })
            .buffer_unordered(self.settings.embedding.concurrency)
            .collect()
            .await;
        results.sort_by(|a, b| a.0.id.cmp(&b.0.id));

        let mut embedded = Vec::new();
        for (mut article, result) in results {
            match result {
                Ok(vector) => match self.store.set_embedding(&article.id, vector.clone()).await {
                    Ok(()) => {
                        stats.articles_embedded += 1;
                        article.embedding = Some(vector);
                        embedded.push(article);
                    }
                    Err(e) => {
                        warn!(article_id = %article.id, error = %e, "Failed to store embedding; deferring");
                        stats.embedding_deferred += 1;
                    }
                },
                Err(EmbedError::Permanent(reason)) => {
                    warn!(
                        article_id = %article.id,
                        title = %truncate_for_log(&article.title, 80),
                        %reason,
                        "Article cannot be embedded; marking unprocessable"
                    );
                    self.mark(&article.id, &reason, stats).await;
                }
                Err(e) => {
                    warn!(article_id = %article.id, error = %e, "Embedding deferred to next run");
                    stats.embedding_deferred += 1;
                }
            }
        }
        info!(
            embedded = stats.articles_embedded,
            deferred = stats.embedding_deferred,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Embedding step done"
        );
        embedded
    }

    async fn mark(&self, article_id: &str, reason: &str, stats: &mut RunStats) {
        match self.store.mark_unprocessable(article_id, reason).await {
            Ok(()) => stats.articles_unprocessable += 1,
            Err(e) => warn!(%article_id, error = %e, "Failed to mark article unprocessable"),
        }
    }

    /// Turn selected articles into group members, excluding bad data.
    async fn validate(&self, batch: Vec<Article>, stats: &mut RunStats) -> Vec<GroupMember> {
        let dimension = self.embedder.dimension();
        let mut members = Vec::with_capacity(batch.len());
        for article in batch {
            match check_article(&article, dimension) {
                Ok(()) => members.push(GroupMember {
                    source: source_domain(&article.url),
                    id: article.id,
                    title: article.title,
                    embedding: article.embedding.unwrap_or_default(),
                    published_at: article.published_at,
                    content_hash: article.content_hash,
                }),
                Err(reason) => {
                    warn!(article_id = %article.id, %reason, "Excluding article from clustering");
                    self.mark(&article.id, &reason, stats).await;
                }
            }
        }
        members
    }

    /// Split off articles whose content hash is already clustered.
    ///
    /// An article whose lookup fails is left out of the run, so it can never
    /// land in a different topic than its clustered duplicate.
    async fn pin_duplicates(
        &self,
        members: Vec<GroupMember>,
        stats: &mut RunStats,
    ) -> (Pinned, Vec<GroupMember>) {
        let mut looked_up = Vec::with_capacity(members.len());
        for member in members {
            match self.store.find_assigned_by_hash(&member.content_hash).await {
                Ok(hit) => looked_up.push((member, hit)),
                Err(e) => {
                    warn!(article_id = %member.id, error = %e, "Duplicate lookup failed; deferring article");
                    stats.failed_groups.push(FailedGroup {
                        article_ids: vec![member.id],
                        reason: format!("duplicate lookup failed: {e}"),
                    });
                }
            }
        }

        let (pinned, fresh): (Vec<(String, GroupMember)>, Vec<GroupMember>) =
            looked_up.into_iter().partition_map(|(member, hit)| match hit {
                Some((original_id, topic_id)) => {
                    debug!(article_id = %member.id, %original_id, %topic_id, "Duplicate of clustered article");
                    Either::Left((topic_id, member))
                }
                None => Either::Right(member),
            });

        let pinned = pinned
            .into_iter()
            .into_group_map()
            .into_iter()
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .collect();
        (pinned, fresh)
    }

    /// Stop on shutdown or when the lease is gone, renewing it otherwise.
    async fn keep_going(&self, shutdown: &watch::Receiver<bool>) -> Flow {
        if *shutdown.borrow() {
            info!(phase = ?RunPhase::Committing, "Shutdown requested; stopping run");
            return Flow::Stop(RunOutcome::Cancelled {
                phase: RunPhase::Committing,
            });
        }
        match self
            .store
            .renew_lease(&self.owner, self.settings.lease_ttl(), Utc::now())
            .await
        {
            Ok(true) => Flow::Continue,
            Ok(false) => {
                error!("Run lock lost mid-run; leaving remaining groups for the next run");
                Flow::Stop(RunOutcome::LeaseLost)
            }
            Err(e) => {
                warn!(error = %e, "Failed to renew run lock");
                Flow::Continue
            }
        }
    }

    async fn commit_all(
        &self,
        pinned: Pinned,
        groups: Vec<ArticleGroup>,
        catalog: &mut TopicCatalog,
        touched: &mut BTreeSet<String>,
        stats: &mut RunStats,
        shutdown: &watch::Receiver<bool>,
    ) -> Flow {
        let merger = self.merger();
        info!(
            pinned = pinned.len(),
            groups = groups.len(),
            phase = ?RunPhase::Committing,
            "Run phase"
        );

        let units = pinned
            .into_iter()
            .map(|(topic_id, members)| (Some(topic_id), ArticleGroup { members }))
            .chain(groups.into_iter().map(|g| (None, g)));

        for (target, group) in units {
            if let Flow::Stop(o) = self.keep_going(shutdown).await {
                return Flow::Stop(o);
            }
            let now = Utc::now();
            let result = match &target {
                Some(topic_id) => {
                    merger
                        .join_topic(&group.members, topic_id, catalog, now)
                        .await
                }
                None => merger.merge_group(&group, catalog, now).await,
            };
            record(result, &group, stats, touched);
        }
        Flow::Continue
    }
}

/// Count what a merge committed, even when it then failed.
fn record(
    result: Result<MergeReport, MergeError>,
    group: &ArticleGroup,
    stats: &mut RunStats,
    touched: &mut BTreeSet<String>,
) {
    let (report, failure) = match result {
        Ok(report) => (report, None),
        Err(e) => {
            let reason = e.to_string();
            (e.into_partial(), Some(reason))
        }
    };
    stats.articles_assigned += report.assigned();
    if report.created {
        stats.topics_created += 1;
    } else if report.assigned() > 0 {
        stats.topics_merged += 1;
    }
    if report.assigned() > 0 {
        touched.extend(report.topic_id.clone());
    }

    if let Some(reason) = failure {
        let article_ids: Vec<String> = group
            .ids()
            .into_iter()
            .filter(|id| !report.settled(id))
            .collect();
        error!(
            articles = ?article_ids,
            committed = report.assigned(),
            %reason,
            "Group merge failed; left for next run"
        );
        stats.failed_groups.push(FailedGroup { article_ids, reason });
    }
}

fn checkpoint(phase: RunPhase, shutdown: &watch::Receiver<bool>) -> Flow {
    if *shutdown.borrow() {
        info!(?phase, "Shutdown requested; stopping run");
        return Flow::Stop(RunOutcome::Cancelled { phase });
    }
    info!(?phase, "Run phase");
    Flow::Continue
}

/// Reason `article` cannot be clustered, if any.
fn check_article(article: &Article, dimension: usize) -> Result<(), String> {
    if article.title.trim().is_empty() && article.url.trim().is_empty() {
        return Err("article has neither title nor url".into());
    }
    let Some(embedding) = article.embedding.as_deref() else {
        return Err("article has no embedding".into());
    };
    if embedding.len() != dimension {
        return Err(format!(
            "embedding has dimension {}, expected {dimension}",
            embedding.len()
        ));
    }
    if !is_usable(embedding) {
        return Err("embedding is all zeros or not finite".into());
    }
    Ok(())
}
