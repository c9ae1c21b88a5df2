use super::{ArticleStore, CommitOutcome, LeaseGrant, PruneReport, StoreState};
use crate::error::StoreError;
use crate::models::{Article, Topic};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents.
    pub async fn snapshot(&self) -> StoreState {
        self.state.lock().await.clone()
    }
}

impl ArticleStore for MemoryStore {
    async fn insert_article(&self, article: Article) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.insert_article(article))
    }

    async fn fetch_unclustered(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Article>, StoreError> {
        Ok(self.state.lock().await.fetch_unclustered(limit, since))
    }

    async fn fetch_missing_embeddings(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Article>, StoreError> {
        Ok(self.state.lock().await.fetch_missing_embeddings(limit, since))
    }

    async fn set_embedding(&self, article_id: &str, embedding: Vec<f32>) -> Result<(), StoreError> {
        self.state.lock().await.set_embedding(article_id, embedding)
    }

    async fn mark_unprocessable(&self, article_id: &str, reason: &str) -> Result<(), StoreError> {
        self.state.lock().await.mark_unprocessable(article_id, reason)
    }

    async fn get_topic_centroids(&self) -> Result<Vec<Topic>, StoreError> {
        Ok(self.state.lock().await.topics())
    }

    async fn get_topic(&self, topic_id: &str) -> Result<Option<Topic>, StoreError> {
        Ok(self.state.lock().await.get_topic(topic_id))
    }

    async fn find_assigned_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<(String, String)>, StoreError> {
        Ok(self.state.lock().await.find_assigned_by_hash(content_hash))
    }

    async fn list_members(&self, topic_id: &str) -> Result<Vec<Article>, StoreError> {
        Ok(self.state.lock().await.list_members(topic_id))
    }

    async fn commit_assignment(
        &self,
        article_id: &str,
        topic: &Topic,
        expected_version: Option<u64>,
    ) -> Result<CommitOutcome, StoreError> {
        self.state
            .lock()
            .await
            .commit_assignment(article_id, topic, expected_version)
    }

    async fn merge_topics(
        &self,
        merged: &Topic,
        survivor_version: u64,
        absorbed_id: &str,
        absorbed_version: u64,
    ) -> Result<CommitOutcome, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .merge_topics(merged, survivor_version, absorbed_id, absorbed_version))
    }

    async fn acquire_lease(
        &self,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<LeaseGrant, StoreError> {
        Ok(self.state.lock().await.acquire_lease(owner, ttl, now))
    }

    async fn renew_lease(&self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.renew_lease(owner, ttl, now))
    }

    async fn release_lease(&self, owner: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.release_lease(owner))
    }

    async fn prune_published_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PruneReport, StoreError> {
        Ok(self.state.lock().await.prune_published_before(cutoff, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::exercise_store;

    #[tokio::test]
    async fn memory_store_contract() {
        exercise_store(&MemoryStore::new()).await;
    }
}
