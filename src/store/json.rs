//! JSON snapshot store.
//!
//! The whole [`StoreState`] (articles, topics and the run lease) lives in one
//! JSON file, shared by every process pointed at the same path. Each
//! operation takes an advisory lock on a sibling `.lock` file (shared for
//! reads, exclusive for writes), reads the snapshot from disk, and for
//! writes persists the result as a temp file renamed over the original
//! before the lock is dropped. A crash leaves either the old or the new
//! snapshot on disk, never a torn one, and no process decides on a copy that
//! another process has since replaced.

use super::{ArticleStore, CommitOutcome, LeaseGrant, PruneReport, StoreState};
use crate::error::StoreError;
use crate::models::{Article, Topic};
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, instrument};

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty when the file does not exist.
    ///
    /// # Errors
    /// [`StoreError::Serialization`] when the file holds something other than
    /// a store snapshot, [`StoreError::Io`] when it or its lock file cannot
    /// be accessed.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            lock_path: path.with_extension("json.lock"),
            path,
        };
        let (articles, topics) = store
            .read(|s| (s.articles.len(), s.topics.len()))
            .await?;
        info!(articles, topics, "Opened JSON store");
        Ok(store)
    }

    /// Block (off the runtime) until the store lock is ours.
    ///
    /// The lock lasts until the returned file is dropped.
    async fn lock(&self, mode: LockMode) -> Result<File, StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let lock_path = self.lock_path.clone();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            match mode {
                LockMode::Shared => FileExt::lock_shared(&file)?,
                LockMode::Exclusive => FileExt::lock_exclusive(&file)?,
            }
            Ok(file)
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(file)
    }

    async fn load(&self) -> Result<StoreState, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(StoreState::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreState::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let json = serde_json::to_vec(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!(bytes = json.len(), "Persisted store snapshot");
        Ok(())
    }

    /// Evaluate `f` against the snapshot currently on disk.
    async fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> Result<T, StoreError> {
        let _lock = self.lock(LockMode::Shared).await?;
        let state = self.load().await?;
        Ok(f(&state))
    }

    /// Apply `f` to the snapshot on disk and persist it if `f` changed something.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<(T, bool), StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = self.lock(LockMode::Exclusive).await?;
        let mut state = self.load().await?;
        let (value, changed) = f(&mut state)?;
        if changed {
            self.persist(&state).await?;
        }
        Ok(value)
    }
}

impl ArticleStore for JsonFileStore {
    async fn insert_article(&self, article: Article) -> Result<bool, StoreError> {
        self.mutate(|s| {
            let inserted = s.insert_article(article);
            Ok((inserted, inserted))
        })
        .await
    }

    async fn fetch_unclustered(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Article>, StoreError> {
        self.read(|s| s.fetch_unclustered(limit, since)).await
    }

    async fn fetch_missing_embeddings(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Article>, StoreError> {
        self.read(|s| s.fetch_missing_embeddings(limit, since)).await
    }

    async fn set_embedding(&self, article_id: &str, embedding: Vec<f32>) -> Result<(), StoreError> {
        self.mutate(|s| s.set_embedding(article_id, embedding).map(|()| ((), true)))
            .await
    }

    async fn mark_unprocessable(&self, article_id: &str, reason: &str) -> Result<(), StoreError> {
        self.mutate(|s| s.mark_unprocessable(article_id, reason).map(|()| ((), true)))
            .await
    }

    async fn get_topic_centroids(&self) -> Result<Vec<Topic>, StoreError> {
        self.read(StoreState::topics).await
    }

    async fn get_topic(&self, topic_id: &str) -> Result<Option<Topic>, StoreError> {
        self.read(|s| s.get_topic(topic_id)).await
    }

    async fn find_assigned_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<(String, String)>, StoreError> {
        self.read(|s| s.find_assigned_by_hash(content_hash)).await
    }

    async fn list_members(&self, topic_id: &str) -> Result<Vec<Article>, StoreError> {
        self.read(|s| s.list_members(topic_id)).await
    }

    async fn commit_assignment(
        &self,
        article_id: &str,
        topic: &Topic,
        expected_version: Option<u64>,
    ) -> Result<CommitOutcome, StoreError> {
        self.mutate(|s| {
            let outcome = s.commit_assignment(article_id, topic, expected_version)?;
            let changed = outcome == CommitOutcome::Committed;
            Ok((outcome, changed))
        })
        .await
    }

    async fn merge_topics(
        &self,
        merged: &Topic,
        survivor_version: u64,
        absorbed_id: &str,
        absorbed_version: u64,
    ) -> Result<CommitOutcome, StoreError> {
        self.mutate(|s| {
            let outcome = s.merge_topics(merged, survivor_version, absorbed_id, absorbed_version);
            let changed = outcome == CommitOutcome::Committed;
            Ok((outcome, changed))
        })
        .await
    }

    async fn acquire_lease(
        &self,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<LeaseGrant, StoreError> {
        self.mutate(|s| {
            let grant = s.acquire_lease(owner, ttl, now);
            let changed = matches!(grant, LeaseGrant::Acquired(_));
            Ok((grant, changed))
        })
        .await
    }

    async fn renew_lease(&self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.mutate(|s| {
            let renewed = s.renew_lease(owner, ttl, now);
            Ok((renewed, renewed))
        })
        .await
    }

    async fn release_lease(&self, owner: &str) -> Result<bool, StoreError> {
        self.mutate(|s| {
            let released = s.release_lease(owner);
            Ok((released, released))
        })
        .await
    }

    async fn prune_published_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PruneReport, StoreError> {
        self.mutate(|s| {
            let report = s.prune_published_before(cutoff, now);
            Ok((report, report.articles > 0))
        })
        .await
    }
}
