//! Reconciles freshly formed groups with the persisted topics.
//!
//! For each group the merger computes the group centroid, compares it with
//! the centroid of every candidate topic and either joins the most similar
//! topic (similarity at or above the merge threshold) or creates a new one.
//!
//! Commits happen one article at a time through
//! [`ArticleStore::commit_assignment`], each carrying the aggregate built
//! from the topic version the merger last saw. When the store reports a
//! conflict, the topic is reloaded and the remaining articles are retried
//! against the fresh aggregate; after `retry_attempts` conflicts the group
//! is given up and its uncommitted articles stay unclustered.
//!
//! After a run has committed its groups, [`TopicMerger::consolidate`] folds
//! together topics whose centroids have moved within the merge threshold of
//! each other.

use crate::error::{MergeError, StoreError};
use crate::grouper::ArticleGroup;
use crate::models::{GroupMember, Topic};
use crate::store::{ArticleStore, CommitOutcome};
use crate::vector::{cosine_similarity, mean};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    Join { topic_id: String, similarity: f32 },
    Create,
}

/// In-run view of the topics, kept current as the run commits.
#[derive(Debug, Clone, Default)]
pub struct TopicCatalog {
    topics: BTreeMap<String, Topic>,
    /// Topics last updated before this are not merge candidates.
    window_start: Option<DateTime<Utc>>,
}

impl TopicCatalog {
    pub fn new(topics: Vec<Topic>, window_start: Option<DateTime<Utc>>) -> Self {
        Self {
            topics: topics.into_iter().map(|t| (t.id.clone(), t)).collect(),
            window_start,
        }
    }

    /// Candidate topics in id order.
    pub fn candidates(&self) -> impl Iterator<Item = &Topic> {
        self.topics
            .values()
            .filter(move |t| self.window_start.is_none_or(|w| t.updated_at >= w))
    }

    pub fn get(&self, topic_id: &str) -> Option<&Topic> {
        self.topics.get(topic_id)
    }

    pub fn upsert(&mut self, topic: Topic) {
        self.topics.insert(topic.id.clone(), topic);
    }

    pub fn remove(&mut self, topic_id: &str) {
        self.topics.remove(topic_id);
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

pub fn group_centroid(members: &[GroupMember]) -> Vec<f32> {
    mean(members.iter().map(|m| m.embedding.as_slice()))
}

/// Choose between joining an existing topic and creating a new one.
///
/// # Arguments
/// * `centroid` - Mean embedding of the group being placed
/// * `candidates` - Topics eligible for joining, in id order
/// * `threshold` - Minimum cosine similarity for a join
///
/// # Returns
/// [`MergeDecision::Join`] with the most similar candidate when its
/// similarity is at least `threshold`, otherwise [`MergeDecision::Create`].
/// Equal similarities resolve to the first candidate, which is the smallest
/// topic id when `candidates` comes from [`TopicCatalog::candidates`].
pub fn decide<'a>(
    centroid: &[f32],
    candidates: impl IntoIterator<Item = &'a Topic>,
    threshold: f32,
) -> MergeDecision {
    let mut best: Option<(&Topic, f32)> = None;
    for topic in candidates {
        let sim = cosine_similarity(centroid, &topic.centroid);
        if best.is_none_or(|(_, s)| sim > s) {
            best = Some((topic, sim));
        }
    }
    match best {
        Some((topic, similarity)) if similarity >= threshold => MergeDecision::Join {
            topic_id: topic.id.clone(),
            similarity,
        },
        _ => MergeDecision::Create,
    }
}

/// What one merge committed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergeReport {
    /// Topic the group ended up in; `None` when nothing was committed.
    pub topic_id: Option<String>,
    pub created: bool,
    /// Members assigned by this merge, in commit order.
    pub committed: Vec<String>,
    /// Members some other writer had already clustered.
    pub already_assigned: Vec<String>,
    pub conflicts: usize,
}

impl MergeReport {
    pub fn assigned(&self) -> usize {
        self.committed.len()
    }

    /// `true` when `article_id` no longer waits for a topic.
    pub fn settled(&self, article_id: &str) -> bool {
        self.committed.iter().chain(&self.already_assigned).any(|id| id == article_id)
    }
}

/// `true` when `a` should survive a merge with `b`: more members, then smaller id.
fn outlasts(a: &Topic, b: &Topic) -> bool {
    a.member_count > b.member_count || (a.member_count == b.member_count && a.id < b.id)
}

pub struct TopicMerger<'a, S> {
    store: &'a S,
    threshold: f32,
    retry_attempts: usize,
}

impl<'a, S: ArticleStore> TopicMerger<'a, S> {
    /// Create a merger committing through `store`.
    ///
    /// # Arguments
    /// * `store` - Where assignments and topic aggregates are written
    /// * `threshold` - Cosine similarity at or above which a group joins a topic
    /// * `retry_attempts` - Conflicts tolerated per group before giving up; at least 1
    pub fn new(store: &'a S, threshold: f32, retry_attempts: usize) -> Self {
        Self {
            store,
            threshold,
            retry_attempts: retry_attempts.max(1),
        }
    }

    /// Decide join-vs-create for `group` and commit every member.
    ///
    /// `catalog` is updated with each committed aggregate so later groups in
    /// the same run see it.
    ///
    /// # Errors
    /// [`MergeError::RetriesExhausted`] after `retry_attempts` conflicts and
    /// [`MergeError::Store`] when the store fails. Both carry the commits
    /// made before the failure.
    #[instrument(level = "info", skip_all, fields(size = group.len()))]
    pub async fn merge_group(
        &self,
        group: &ArticleGroup,
        catalog: &mut TopicCatalog,
        now: DateTime<Utc>,
    ) -> Result<MergeReport, MergeError> {
        if group.is_empty() {
            return Ok(MergeReport::default());
        }
        let centroid = group_centroid(&group.members);
        let decision = decide(&centroid, catalog.candidates(), self.threshold);
        let target = match decision {
            MergeDecision::Join {
                topic_id,
                similarity,
            } => {
                debug!(%topic_id, similarity, "Group joins existing topic");
                Some(topic_id)
            }
            MergeDecision::Create => None,
        };
        self.commit_members(&group.members, target, catalog, now).await
    }

    /// Commit `members` into `topic_id` regardless of similarity.
    ///
    /// Used for articles whose content hash matches an already clustered
    /// one. A topic that no longer exists is recreated under a new id.
    ///
    /// # Errors
    /// Same as [`TopicMerger::merge_group`].
    #[instrument(level = "info", skip_all, fields(%topic_id, size = members.len()))]
    pub async fn join_topic(
        &self,
        members: &[GroupMember],
        topic_id: &str,
        catalog: &mut TopicCatalog,
        now: DateTime<Utc>,
    ) -> Result<MergeReport, MergeError> {
        self.commit_members(members, Some(topic_id.to_string()), catalog, now)
            .await
    }

    async fn load(&self, topic_id: &str, catalog: &mut TopicCatalog) -> Result<Option<Topic>, StoreError> {
        let fresh = self.store.get_topic(topic_id).await?;
        match &fresh {
            Some(t) => catalog.upsert(t.clone()),
            None => catalog.remove(topic_id),
        }
        Ok(fresh)
    }

    async fn commit_members(
        &self,
        members: &[GroupMember],
        target: Option<String>,
        catalog: &mut TopicCatalog,
        now: DateTime<Utc>,
    ) -> Result<MergeReport, MergeError> {
        // Newest first, so a created topic is seeded by its representative.
        let mut order: Vec<&GroupMember> = members.iter().collect();
        order.sort_by(|a, b| {
            b.published_at
                .cmp(&a.published_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut report = MergeReport::default();
        let mut current = match target {
            Some(id) => match catalog.get(&id) {
                Some(t) => Some(t.clone()),
                None => self
                    .load(&id, catalog)
                    .await
                    .map_err(|e| store_failure(e, &report, None))?,
            },
            None => None,
        };

        let mut idx = 0;
        while let Some(member) = order.get(idx).copied() {
            let (next, expected) = match &current {
                Some(t) => (t.with_member(member, now), Some(t.version)),
                None => (Topic::seed(Uuid::new_v4().to_string(), member, now), None),
            };

            let outcome = self
                .store
                .commit_assignment(&member.id, &next, expected)
                .await
                .map_err(|e| store_failure(e, &report, current.as_ref()))?;
            match outcome {
                CommitOutcome::Committed => {
                    report.created |= expected.is_none();
                    report.committed.push(member.id.clone());
                    catalog.upsert(next.clone());
                    current = Some(next);
                    idx += 1;
                }
                CommitOutcome::AlreadyAssigned { topic_id } => {
                    debug!(article_id = %member.id, %topic_id, "Article already clustered; skipping");
                    report.already_assigned.push(member.id.clone());
                    idx += 1;
                }
                CommitOutcome::Conflict { current_version } => {
                    report.conflicts += 1;
                    let topic_id = current.as_ref().map(|t| t.id.clone());
                    if report.conflicts >= self.retry_attempts {
                        warn!(
                            ?topic_id,
                            attempts = report.conflicts,
                            committed = report.assigned(),
                            "Topic commit retries exhausted"
                        );
                        return Err(MergeError::RetriesExhausted {
                            topic_id,
                            attempts: report.conflicts,
                            partial: Box::new(settled_report(&report, current.as_ref())),
                        });
                    }
                    warn!(
                        ?topic_id,
                        ?current_version,
                        attempt = report.conflicts,
                        "Topic changed concurrently; reloading"
                    );
                    let reloaded = match topic_id {
                        Some(id) => self.load(&id, catalog).await,
                        None => Ok(None),
                    };
                    current = reloaded.map_err(|e| store_failure(e, &report, current.as_ref()))?;
                }
            }
        }

        let report = settled_report(&report, current.as_ref());
        if report.assigned() > 0 {
            info!(
                topic_id = ?report.topic_id,
                created = report.created,
                assigned = report.assigned(),
                "Group committed"
            );
        }
        Ok(report)
    }

    /// Merge topics whose centroids now sit within the merge threshold.
    ///
    /// Each topic in `touched` is compared with every other candidate in
    /// `catalog`. The closest one at or above the threshold is folded in
    /// through [`ArticleStore::merge_topics`], the larger topic surviving
    /// (ties keep the smaller id), and the survivor is checked again.
    ///
    /// # Arguments
    /// * `touched` - Topics created or joined during this run
    /// * `catalog` - In-run view of the topics; kept current with every merge
    ///
    /// # Returns
    /// Number of topics absorbed. Store failures and repeated conflicts are
    /// logged and end the attempt for that topic only.
    #[instrument(level = "info", skip_all, fields(touched = touched.len()))]
    pub async fn consolidate(
        &self,
        touched: &BTreeSet<String>,
        catalog: &mut TopicCatalog,
        now: DateTime<Utc>,
    ) -> usize {
        let mut absorbed = 0;
        for start in touched {
            let mut current = start.clone();
            let mut conflicts = 0;
            while let Some(topic) = catalog.get(&current).cloned() {
                let others = catalog.candidates().filter(|t| t.id != topic.id);
                let MergeDecision::Join {
                    topic_id: partner,
                    similarity,
                } = decide(&topic.centroid, others, self.threshold)
                else {
                    break;
                };
                let Some(other) = catalog.get(&partner).cloned() else {
                    break;
                };
                let (survivor, gone) = if outlasts(&topic, &other) {
                    (topic, other)
                } else {
                    (other, topic)
                };
                let merged = survivor.absorb(&gone, now);

                match self
                    .store
                    .merge_topics(&merged, survivor.version, &gone.id, gone.version)
                    .await
                {
                    Ok(CommitOutcome::Committed) => {
                        info!(
                            survivor = %merged.id,
                            absorbed = %gone.id,
                            similarity,
                            members = merged.member_count,
                            "Similar topics merged"
                        );
                        catalog.remove(&gone.id);
                        current = merged.id.clone();
                        catalog.upsert(merged);
                        absorbed += 1;
                        conflicts = 0;
                    }
                    Ok(outcome) => {
                        conflicts += 1;
                        if conflicts >= self.retry_attempts {
                            warn!(
                                survivor = %survivor.id,
                                absorbed = %gone.id,
                                attempts = conflicts,
                                "Topic merge retries exhausted"
                            );
                            break;
                        }
                        debug!(?outcome, "Topics changed concurrently; reloading");
                        let reloaded = match self.load(&survivor.id, catalog).await {
                            Ok(_) => self.load(&gone.id, catalog).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = reloaded {
                            warn!(error = %e, topic_id = %current, "Failed to reload topics; skipping merge");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, survivor = %survivor.id, absorbed = %gone.id, "Topic merge failed");
                        break;
                    }
                }
            }
        }
        if absorbed > 0 {
            info!(absorbed, topics = catalog.len(), "Topic consolidation done");
        }
        absorbed
    }
}

/// `report` pointing at the topic its commits went to, if any.
fn settled_report(report: &MergeReport, current: Option<&Topic>) -> MergeReport {
    let mut out = report.clone();
    out.topic_id = current.filter(|_| report.assigned() > 0).map(|t| t.id.clone());
    out
}

fn store_failure(source: StoreError, report: &MergeReport, current: Option<&Topic>) -> MergeError {
    MergeError::Store {
        source,
        partial: Box::new(settled_report(report, current)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Article;
    use crate::store::MemoryStore;
    use crate::store::tests::{FlakyStore, article, member_of, ts};

    fn topic_with_centroid(id: &str, centroid: Vec<f32>, updated_day: u32) -> Topic {
        let m = GroupMember {
            id: format!("rep-{id}"),
            title: format!("Tópico {id}"),
            source: None,
            embedding: centroid,
            published_at: ts(1, 0),
            content_hash: "h".into(),
        };
        let mut t = Topic::seed(id.to_string(), &m, ts(updated_day, 0));
        t.updated_at = ts(updated_day, 0);
        t
    }

    async fn stored(store: &MemoryStore, a: Article) -> GroupMember {
        let m = member_of(&a);
        store.insert_article(a).await.unwrap();
        m
    }

    #[test]
    fn decide_picks_most_similar_above_threshold() {
        let topics = vec![
            topic_with_centroid("t1", vec![1.0, 0.0], 2),
            topic_with_centroid("t2", vec![0.7, 0.7], 2),
        ];
        let d = decide(&[0.6, 0.8], &topics, 0.8);
        assert!(matches!(d, MergeDecision::Join { ref topic_id, .. } if topic_id == "t2"));
        assert_eq!(decide(&[0.0, 1.0], &topics, 0.8), MergeDecision::Create);
        assert_eq!(decide(&[0.0, 1.0], &[], 0.8), MergeDecision::Create);
    }

    #[test]
    fn decide_tie_goes_to_smallest_topic_id() {
        let topics = vec![
            topic_with_centroid("a-topic", vec![1.0, 0.0], 2),
            topic_with_centroid("b-topic", vec![1.0, 0.0], 2),
        ];
        let catalog = TopicCatalog::new(topics, None);
        let d = decide(&[1.0, 0.0], catalog.candidates(), 0.8);
        assert!(matches!(d, MergeDecision::Join { ref topic_id, .. } if topic_id == "a-topic"));
    }

    #[test]
    fn catalog_window_hides_stale_topics() {
        let catalog = TopicCatalog::new(
            vec![
                topic_with_centroid("old", vec![1.0, 0.0], 1),
                topic_with_centroid("new", vec![1.0, 0.0], 10),
            ],
            Some(ts(5, 0)),
        );
        let ids: Vec<&str> = catalog.candidates().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["new"]);
        assert_eq!(catalog.len(), 2);
    }

    #[tokio::test]
    async fn new_groups_create_topics_with_group_sizes() {
        let store = MemoryStore::new();
        let a = stored(&store, article("A", Some(vec![1.0, 0.0, 0.0]), ts(2, 9))).await;
        let b = stored(&store, article("B", Some(vec![0.9, 0.43589, 0.0]), ts(2, 10))).await;
        let c = stored(&store, article("C", Some(vec![0.3, 0.0688, 0.9515]), ts(2, 11))).await;

        let merger = TopicMerger::new(&store, 0.80, 3);
        let mut catalog = TopicCatalog::default();
        let ab = ArticleGroup { members: vec![a, b] };
        let c_group = ArticleGroup { members: vec![c] };

        let r1 = merger.merge_group(&ab, &mut catalog, ts(3, 0)).await.unwrap();
        let r2 = merger.merge_group(&c_group, &mut catalog, ts(3, 0)).await.unwrap();
        assert!(r1.created && r2.created);
        assert_ne!(r1.topic_id, r2.topic_id);

        let t1 = store.get_topic(r1.topic_id.as_deref().unwrap()).await.unwrap().unwrap();
        let t2 = store.get_topic(r2.topic_id.as_deref().unwrap()).await.unwrap().unwrap();
        assert_eq!(t1.member_count, 2);
        assert_eq!(t2.member_count, 1);
        // most recent member seeds the topic
        assert_eq!(t1.representative_article_id, "B");
        let expected = group_centroid(&ab.members);
        for (x, y) in t1.centroid.iter().zip(&expected) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn group_joins_topic_and_centroid_covers_union() {
        let store = MemoryStore::new();
        let x = stored(&store, article("X", Some(vec![1.0, 0.0]), ts(2, 9))).await;
        let seed = Topic::seed("T".into(), &x, ts(2, 9));
        store.commit_assignment("X", &seed, None).await.unwrap();

        let y_emb = vec![0.82f32, (1.0f32 - 0.82 * 0.82).sqrt()];
        let y = stored(&store, article("Y", Some(y_emb.clone()), ts(2, 12))).await;
        assert!((cosine_similarity(&seed.centroid, &y_emb) - 0.82).abs() < 1e-5);

        let merger = TopicMerger::new(&store, 0.80, 3);
        let mut catalog = TopicCatalog::new(store.get_topic_centroids().await.unwrap(), None);
        let report = merger
            .merge_group(&ArticleGroup { members: vec![y] }, &mut catalog, ts(3, 0))
            .await
            .unwrap();
        assert_eq!(report.topic_id.as_deref(), Some("T"));
        assert!(!report.created);

        let t = store.get_topic("T").await.unwrap().unwrap();
        assert_eq!(t.member_count, 2);
        assert!((t.centroid[0] - 0.91).abs() < 1e-6);
        assert!((t.centroid[1] - y_emb[1] / 2.0).abs() < 1e-6);
        assert_eq!(t.representative_article_id, "Y");
    }

    #[tokio::test]
    async fn stale_catalog_conflicts_then_reloads() {
        let store = MemoryStore::new();
        let x = stored(&store, article("X", Some(vec![1.0, 0.0]), ts(2, 9))).await;
        let seed = Topic::seed("T".into(), &x, ts(2, 9));
        store.commit_assignment("X", &seed, None).await.unwrap();

        let mut catalog = TopicCatalog::new(store.get_topic_centroids().await.unwrap(), None);

        // another writer joins T after the catalog was loaded
        let w = stored(&store, article("W", Some(vec![0.99, 0.1]), ts(2, 10))).await;
        store
            .commit_assignment("W", &seed.with_member(&w, ts(2, 10)), Some(1))
            .await
            .unwrap();

        let y = stored(&store, article("Y", Some(vec![0.98, 0.15]), ts(2, 11))).await;
        let merger = TopicMerger::new(&store, 0.80, 3);
        let report = merger
            .merge_group(&ArticleGroup { members: vec![y] }, &mut catalog, ts(3, 0))
            .await
            .unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.assigned(), 1);

        let t = store.get_topic("T").await.unwrap().unwrap();
        assert_eq!(t.member_count, 3);
        assert_eq!(t.version, 3);
        let members = store.list_members("T").await.unwrap();
        let expected = mean(members.iter().filter_map(|a| a.embedding.as_deref()));
        for (c, e) in t.centroid.iter().zip(&expected) {
            assert!((c - e).abs() < 1e-6);
        }
        assert_eq!(catalog.get("T").unwrap().version, 3);
    }

    #[tokio::test]
    async fn pinned_duplicates_join_despite_low_similarity() {
        let store = MemoryStore::new();
        let x = stored(&store, article("X", Some(vec![1.0, 0.0]), ts(2, 9))).await;
        store
            .commit_assignment("X", &Topic::seed("T".into(), &x, ts(2, 9)), None)
            .await
            .unwrap();
        let dup = stored(&store, article("X-copy", Some(vec![0.0, 1.0]), ts(2, 10))).await;

        let merger = TopicMerger::new(&store, 0.99, 3);
        let mut catalog = TopicCatalog::new(store.get_topic_centroids().await.unwrap(), None);
        let report = merger.join_topic(&[dup], "T", &mut catalog, ts(3, 0)).await.unwrap();
        assert_eq!(report.topic_id.as_deref(), Some("T"));
        assert_eq!(store.get_topic("T").await.unwrap().unwrap().member_count, 2);
    }

    #[tokio::test]
    async fn vanished_target_topic_is_recreated() {
        let store = MemoryStore::new();
        let y = stored(&store, article("Y", Some(vec![1.0, 0.0]), ts(2, 9))).await;
        let merger = TopicMerger::new(&store, 0.80, 3);
        let mut catalog = TopicCatalog::default();
        let report = merger.join_topic(&[y], "gone", &mut catalog, ts(3, 0)).await.unwrap();
        assert!(report.created);
        assert_ne!(report.topic_id.as_deref(), Some("gone"));
    }

    #[tokio::test]
    async fn retries_exhaust_and_leave_articles_unclustered() {
        let store = FlakyStore {
            commit_budget: Some(0),
            ..FlakyStore::default()
        };
        let a = article("A", Some(vec![1.0, 0.0]), ts(2, 9));
        let m = member_of(&a);
        store.insert_article(a).await.unwrap();

        let merger = TopicMerger::new(&store, 0.80, 3);
        let mut catalog = TopicCatalog::default();
        let err = merger
            .merge_group(&ArticleGroup { members: vec![m] }, &mut catalog, ts(3, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(err.partial(), &MergeReport { conflicts: 3, ..MergeReport::default() });
        assert_eq!(store.fetch_unclustered(10, None).await.unwrap().len(), 1);
        assert!(store.get_topic_centroids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_keep_commits_made_before() {
        let store = FlakyStore {
            commit_budget: Some(1),
            ..FlakyStore::default()
        };
        let a = article("A", Some(vec![1.0, 0.0]), ts(2, 9));
        let b = article("B", Some(vec![0.9, 0.43589]), ts(2, 10));
        let members = vec![member_of(&a), member_of(&b)];
        store.insert_article(a).await.unwrap();
        store.insert_article(b).await.unwrap();

        let merger = TopicMerger::new(&store, 0.80, 3);
        let mut catalog = TopicCatalog::default();
        let err = merger
            .merge_group(&ArticleGroup { members }, &mut catalog, ts(3, 0))
            .await
            .unwrap_err();

        // the newest member seeded the topic before every later commit conflicted
        let partial = err.partial();
        assert!(partial.created);
        assert_eq!(partial.committed, vec!["B"]);
        assert!(partial.settled("B") && !partial.settled("A"));
        let topics = store.get_topic_centroids().await.unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(partial.topic_id.as_deref(), Some(topics[0].id.as_str()));
        let left: Vec<String> = store
            .fetch_unclustered(10, None)
            .await
            .unwrap()
            .into_iter()
            .map(|x| x.id)
            .collect();
        assert_eq!(left, vec!["A"]);
    }

    #[tokio::test]
    async fn drifted_topics_are_consolidated() {
        let store = MemoryStore::new();
        let x = stored(&store, article("X", Some(vec![1.0, 0.0]), ts(2, 9))).await;
        let y = stored(&store, article("Y", Some(vec![0.95, 0.31]), ts(2, 10))).await;
        let z = stored(&store, article("Z", Some(vec![0.0, 1.0]), ts(2, 11))).await;
        for (id, m) in [("T-a", &x), ("T-b", &y), ("T-c", &z)] {
            store
                .commit_assignment(&m.id, &Topic::seed(id.into(), m, ts(2, 12)), None)
                .await
                .unwrap();
        }

        let merger = TopicMerger::new(&store, 0.80, 3);
        let mut catalog = TopicCatalog::new(store.get_topic_centroids().await.unwrap(), None);
        let touched: BTreeSet<String> = ["T-b".to_string()].into();
        assert_eq!(merger.consolidate(&touched, &mut catalog, ts(3, 0)).await, 1);

        // equal sizes: the smaller id survives and takes the newer representative
        assert!(store.get_topic("T-b").await.unwrap().is_none());
        let survivor = store.get_topic("T-a").await.unwrap().unwrap();
        assert_eq!(survivor.member_count, 2);
        assert_eq!(survivor.representative_article_id, "Y");
        assert!((survivor.centroid[0] - 0.975).abs() < 1e-6);
        let ids: Vec<String> = store
            .list_members("T-a")
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["X", "Y"]);
        assert_eq!(store.get_topic("T-c").await.unwrap().unwrap().member_count, 1);
        assert!(catalog.get("T-b").is_none());

        // nothing left within the threshold
        let touched: BTreeSet<String> = ["T-a".to_string()].into();
        assert_eq!(merger.consolidate(&touched, &mut catalog, ts(3, 1)).await, 0);
    }
}
