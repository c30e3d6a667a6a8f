// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::future::Future;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::memory::{LibrarySnapshot, MemoryStore};
use super::{RefreshRecord, Repository, Transition};
use crate::error::StoreError;
use crate::model::{
    DownloadStatus, Episode, EpisodeFilter, EpisodeId, NewEpisode, NewSubscription, Subscription,
    SubscriptionId,
};
use crate::settings::PolicyOverride;

/// Repository persisted as a JSON snapshot after every mutation
///
/// The snapshot is written to a temporary sibling file and renamed over the
/// previous one, so a crash leaves either the old or the new state on disk.
/// A mutation whose write fails is undone in memory before the error returns.
pub struct FileStore {
    memory: MemoryStore,
    path: PathBuf,
    save_lock: Mutex<()>,
}

impl FileStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let memory = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let content =
                tokio::fs::read(&path)
                    .await
                    .map_err(|e| StoreError::ReadFailed {
                        path: path.clone(),
                        source: e,
                    })?;
            let snapshot: LibrarySnapshot =
                serde_json::from_slice(&content).map_err(|e| StoreError::JsonParseFailed {
                    path: path.clone(),
                    source: e,
                })?;
            tracing::debug!(
                path = %path.display(),
                subscriptions = snapshot.subscriptions.len(),
                episodes = snapshot.episodes.len(),
                "Loaded library"
            );
            MemoryStore::from_snapshot(snapshot)
        } else {
            MemoryStore::new()
        };

        Ok(Self {
            memory,
            path,
            save_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, snapshot: &LibrarySnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(snapshot)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::WriteFailed {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: tmp_path.clone(),
                source: e,
            })?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: self.path.clone(),
                source: e,
            })
    }

    /// Run `mutation` against memory and persist the result when `changed` says so
    ///
    /// A failed write puts memory back to its state before the mutation.
    async fn apply<T, F, Fut>(
        &self,
        mutation: F,
        changed: impl FnOnce(&T) -> bool,
    ) -> Result<T, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        // Mutations are serialized so the rollback image is never stale
        let _guard = self.save_lock.lock().await;
        let before = self.memory.snapshot().await;
        let value = mutation().await?;
        if !changed(&value) {
            return Ok(value);
        }

        let after = self.memory.snapshot().await;
        if let Err(e) = self.write(&after).await {
            tracing::warn!(path = %self.path.display(), error = %e, "Rolling back unsaved change");
            self.memory.restore(before).await;
            return Err(e);
        }
        Ok(value)
    }
}

#[async_trait]
impl Repository for FileStore {
    async fn insert_subscription(&self, new: NewSubscription) -> Result<Subscription, StoreError> {
        self.apply(|| self.memory.insert_subscription(new), |_| true)
            .await
    }

    async fn subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        self.memory.subscription(id).await
    }

    async fn subscription_by_url(
        &self,
        feed_url: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        self.memory.subscription_by_url(feed_url).await
    }

    async fn subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        self.memory.subscriptions().await
    }

    async fn record_refresh(
        &self,
        id: SubscriptionId,
        record: RefreshRecord,
    ) -> Result<Option<Subscription>, StoreError> {
        self.apply(|| self.memory.record_refresh(id, record), Option::is_some)
            .await
    }

    async fn set_policy(
        &self,
        id: SubscriptionId,
        policy: PolicyOverride,
    ) -> Result<Option<Subscription>, StoreError> {
        self.apply(|| self.memory.set_policy(id, policy), Option::is_some)
            .await
    }

    async fn remove_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<(Subscription, Vec<Episode>)>, StoreError> {
        self.apply(|| self.memory.remove_subscription(id), Option::is_some)
            .await
    }

    async fn insert_episode(&self, new: NewEpisode) -> Result<Option<Episode>, StoreError> {
        self.apply(|| self.memory.insert_episode(new), Option::is_some)
            .await
    }

    async fn insert_episodes(
        &self,
        batch: Vec<NewEpisode>,
    ) -> Result<Vec<Option<Episode>>, StoreError> {
        self.apply(
            || self.memory.insert_episodes(batch),
            |results: &Vec<Option<Episode>>| results.iter().any(Option::is_some),
        )
        .await
    }

    async fn episode(&self, id: EpisodeId) -> Result<Option<Episode>, StoreError> {
        self.memory.episode(id).await
    }

    async fn episodes(
        &self,
        subscription_id: SubscriptionId,
        filter: &EpisodeFilter,
    ) -> Result<Vec<Episode>, StoreError> {
        self.memory.episodes(subscription_id, filter).await
    }

    async fn episodes_by_status(
        &self,
        statuses: &[DownloadStatus],
    ) -> Result<Vec<Episode>, StoreError> {
        self.memory.episodes_by_status(statuses).await
    }

    async fn transition(
        &self,
        id: EpisodeId,
        from: &[DownloadStatus],
        to: DownloadStatus,
    ) -> Result<Transition, StoreError> {
        self.apply(|| self.memory.transition(id, from, to), Transition::is_applied)
            .await
    }

    async fn complete_download(
        &self,
        id: EpisodeId,
        path: PathBuf,
        content_hash: String,
    ) -> Result<Transition, StoreError> {
        self.apply(
            || self.memory.complete_download(id, path, content_hash),
            Transition::is_applied,
        )
        .await
    }

    async fn clear_download(&self, id: EpisodeId) -> Result<Option<Episode>, StoreError> {
        self.apply(|| self.memory.clear_download(id), Option::is_some)
            .await
    }

    async fn set_local_artwork(
        &self,
        id: EpisodeId,
        path: Option<PathBuf>,
    ) -> Result<Option<Episode>, StoreError> {
        self.apply(|| self.memory.set_local_artwork(id, path), Option::is_some)
            .await
    }

    async fn set_played(&self, id: EpisodeId, played: bool) -> Result<Option<Episode>, StoreError> {
        self.apply(|| self.memory.set_played(id, played), Option::is_some)
            .await
    }

    async fn set_bookmarked(
        &self,
        id: EpisodeId,
        bookmarked: bool,
    ) -> Result<Option<Episode>, StoreError> {
        self.apply(|| self.memory.set_bookmarked(id, bookmarked), Option::is_some)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_subscription() -> NewSubscription {
        NewSubscription {
            feed_url: "https://example.com/feed.xml".to_string(),
            title: "Show".to_string(),
            description: Some("About things".to_string()),
            artwork_url: None,
            storage_dir: "Show".to_string(),
        }
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");

        let store = FileStore::open(&path).await.unwrap();
        let sub = store.insert_subscription(new_subscription()).await.unwrap();
        let episode = store
            .insert_episode(NewEpisode {
                subscription_id: sub.id,
                external_id: "guid-1".to_string(),
                title: "Pilot".to_string(),
                description: None,
                published_at: None,
                enclosure_url: "https://example.com/pilot.mp3".to_string(),
                enclosure_type: Some("audio/mpeg".to_string()),
                enclosure_length: Some(10),
                episode_number: Some(1),
                duration: None,
                artwork_url: None,
            })
            .await
            .unwrap()
            .unwrap();
        store.set_bookmarked(episode.id, true).await.unwrap();
        drop(store);

        let reopened = FileStore::open(&path).await.unwrap();
        let restored = reopened.episode(episode.id).await.unwrap().unwrap();
        assert!(restored.bookmarked);
        assert_eq!(restored.title, "Pilot");
        assert_eq!(
            reopened.subscription(sub.id).await.unwrap().unwrap().description,
            Some("About things".to_string())
        );
        assert!(!dir.path().join("library.json.tmp").exists());
    }

    fn new_episode(subscription_id: SubscriptionId, guid: &str) -> NewEpisode {
        NewEpisode {
            subscription_id,
            external_id: guid.to_string(),
            title: format!("Episode {guid}"),
            description: None,
            published_at: None,
            enclosure_url: format!("https://example.com/{guid}.mp3"),
            enclosure_type: None,
            enclosure_length: None,
            episode_number: None,
            duration: None,
            artwork_url: None,
        }
    }

    #[tokio::test]
    async fn failed_write_leaves_no_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");
        let store = FileStore::open(&path).await.unwrap();

        // A directory in the way of the temporary file makes every write fail
        let blocker = dir.path().join("library.json.tmp");
        std::fs::create_dir(&blocker).unwrap();

        let result = store.insert_subscription(new_subscription()).await;
        assert!(matches!(result, Err(StoreError::WriteFailed { .. })));
        assert!(store.subscriptions().await.unwrap().is_empty());

        std::fs::remove_dir(&blocker).unwrap();
        let sub = store.insert_subscription(new_subscription()).await.unwrap();
        assert_eq!(sub.id, SubscriptionId(1));

        let reopened = FileStore::open(&path).await.unwrap();
        assert_eq!(reopened.subscriptions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_batch_write_inserts_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");
        let store = FileStore::open(&path).await.unwrap();
        let sub = store.insert_subscription(new_subscription()).await.unwrap();

        let blocker = dir.path().join("library.json.tmp");
        std::fs::create_dir(&blocker).unwrap();
        let batch = vec![new_episode(sub.id, "a"), new_episode(sub.id, "b")];
        assert!(store.insert_episodes(batch.clone()).await.is_err());
        assert!(
            store
                .episodes(sub.id, &EpisodeFilter::default())
                .await
                .unwrap()
                .is_empty()
        );

        std::fs::remove_dir(&blocker).unwrap();
        let results = store.insert_episodes(batch).await.unwrap();
        assert!(results.iter().all(Option::is_some));

        let reopened = FileStore::open(&path).await.unwrap();
        assert_eq!(
            reopened
                .episodes(sub.id, &EpisodeFilter::default())
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("nested").join("library.json"))
            .await
            .unwrap();
        assert!(store.subscriptions().await.unwrap().is_empty());

        store.insert_subscription(new_subscription()).await.unwrap();
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            FileStore::open(&path).await,
            Err(StoreError::JsonParseFailed { .. })
        ));
    }
}
