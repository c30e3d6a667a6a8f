// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{RefreshRecord, Repository, Transition};
use crate::error::StoreError;
use crate::model::{
    DownloadStatus, Episode, EpisodeFilter, EpisodeId, NewEpisode, NewSubscription, Subscription,
    SubscriptionId, newest_first,
};
use crate::settings::PolicyOverride;

/// Serializable image of the whole library
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibrarySnapshot {
    pub next_subscription_id: u64,
    pub next_episode_id: u64,
    pub subscriptions: Vec<Subscription>,
    pub episodes: Vec<Episode>,
}

#[derive(Default)]
struct Inner {
    next_subscription_id: u64,
    next_episode_id: u64,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    episodes: BTreeMap<EpisodeId, Episode>,
    /// `(subscription, external id)` uniqueness index
    by_external_id: HashMap<(SubscriptionId, String), EpisodeId>,
}

impl Inner {
    fn from_snapshot(snapshot: LibrarySnapshot) -> Self {
        let subscriptions: BTreeMap<_, _> = snapshot
            .subscriptions
            .into_iter()
            .map(|s| (s.id, s))
            .collect();

        let mut episodes = BTreeMap::new();
        let mut by_external_id = HashMap::new();
        for episode in snapshot.episodes {
            if !subscriptions.contains_key(&episode.subscription_id) {
                continue;
            }
            by_external_id.insert(
                (episode.subscription_id, episode.external_id.clone()),
                episode.id,
            );
            episodes.insert(episode.id, episode);
        }

        // Counters never go backwards, even if the snapshot is inconsistent
        let next_subscription_id = subscriptions
            .keys()
            .map(|id| id.0 + 1)
            .max()
            .unwrap_or(1)
            .max(snapshot.next_subscription_id);
        let next_episode_id = episodes
            .keys()
            .map(|id| id.0 + 1)
            .max()
            .unwrap_or(1)
            .max(snapshot.next_episode_id);

        Self {
            next_subscription_id,
            next_episode_id,
            subscriptions,
            episodes,
            by_external_id,
        }
    }

    fn episode_mut(&mut self, id: EpisodeId) -> Option<&mut Episode> {
        self.episodes.get_mut(&id)
    }

    fn insert_episode(&mut self, new: NewEpisode) -> Option<Episode> {
        let key = (new.subscription_id, new.external_id.clone());
        if self.by_external_id.contains_key(&key)
            || !self.subscriptions.contains_key(&new.subscription_id)
        {
            return None;
        }

        let id = EpisodeId(allocate(&mut self.next_episode_id));
        let episode = Episode {
            id,
            subscription_id: new.subscription_id,
            external_id: new.external_id,
            title: new.title,
            description: new.description,
            published_at: new.published_at,
            enclosure_url: new.enclosure_url,
            enclosure_type: new.enclosure_type,
            enclosure_length: new.enclosure_length,
            episode_number: new.episode_number,
            duration: new.duration,
            artwork_url: new.artwork_url,
            local_path: None,
            local_artwork_path: None,
            content_hash: None,
            status: DownloadStatus::NotDownloaded,
            played: false,
            bookmarked: false,
            discovered_at: Utc::now(),
            downloaded_at: None,
        };

        if let (Some(published), Some(subscription)) = (
            episode.published_at,
            self.subscriptions.get_mut(&episode.subscription_id),
        ) {
            if subscription
                .last_episode_at
                .is_none_or(|latest| published > latest)
            {
                subscription.last_episode_at = Some(published);
            }
        }

        self.by_external_id.insert(key, id);
        self.episodes.insert(id, episode.clone());
        Some(episode)
    }
}

/// In-memory repository
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a snapshot, restoring the uniqueness index
    pub fn from_snapshot(snapshot: LibrarySnapshot) -> Self {
        Self {
            inner: RwLock::new(Inner::from_snapshot(snapshot)),
        }
    }

    /// Replace the whole state with `snapshot`
    pub async fn restore(&self, snapshot: LibrarySnapshot) {
        *self.inner.write().await = Inner::from_snapshot(snapshot);
    }

    pub async fn snapshot(&self) -> LibrarySnapshot {
        let inner = self.inner.read().await;
        LibrarySnapshot {
            next_subscription_id: inner.next_subscription_id,
            next_episode_id: inner.next_episode_id,
            subscriptions: inner.subscriptions.values().cloned().collect(),
            episodes: inner.episodes.values().cloned().collect(),
        }
    }
}

fn allocate(counter: &mut u64) -> u64 {
    if *counter == 0 {
        *counter = 1;
    }
    let id = *counter;
    *counter += 1;
    id
}

#[async_trait]
impl Repository for MemoryStore {
    async fn insert_subscription(&self, new: NewSubscription) -> Result<Subscription, StoreError> {
        let mut inner = self.inner.write().await;

        if inner
            .subscriptions
            .values()
            .any(|s| s.feed_url == new.feed_url)
        {
            return Err(StoreError::DuplicateSubscription {
                feed_url: new.feed_url,
            });
        }

        let id = SubscriptionId(allocate(&mut inner.next_subscription_id));
        let subscription = Subscription {
            id,
            feed_url: new.feed_url,
            title: new.title,
            description: new.description,
            artwork_url: new.artwork_url,
            storage_dir: new.storage_dir,
            policy: PolicyOverride::default(),
            created_at: Utc::now(),
            last_refreshed_at: None,
            last_episode_at: None,
        };
        inner.subscriptions.insert(id, subscription.clone());
        Ok(subscription)
    }

    async fn subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        Ok(self.inner.read().await.subscriptions.get(&id).cloned())
    }

    async fn subscription_by_url(
        &self,
        feed_url: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .subscriptions
            .values()
            .find(|s| s.feed_url == feed_url)
            .cloned())
    }

    async fn subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .subscriptions
            .values()
            .cloned()
            .collect())
    }

    async fn record_refresh(
        &self,
        id: SubscriptionId,
        record: RefreshRecord,
    ) -> Result<Option<Subscription>, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.subscriptions.get_mut(&id).map(|subscription| {
            subscription.title = record.title;
            subscription.description = record.description;
            subscription.artwork_url = record.artwork_url;
            subscription.last_refreshed_at = Some(record.refreshed_at);
            subscription.clone()
        }))
    }

    async fn set_policy(
        &self,
        id: SubscriptionId,
        policy: PolicyOverride,
    ) -> Result<Option<Subscription>, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.subscriptions.get_mut(&id).map(|subscription| {
            subscription.policy = policy;
            subscription.clone()
        }))
    }

    async fn remove_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<(Subscription, Vec<Episode>)>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(subscription) = inner.subscriptions.remove(&id) else {
            return Ok(None);
        };

        let episode_ids: Vec<EpisodeId> = inner
            .episodes
            .values()
            .filter(|e| e.subscription_id == id)
            .map(|e| e.id)
            .collect();

        let mut removed = Vec::with_capacity(episode_ids.len());
        for episode_id in episode_ids {
            if let Some(episode) = inner.episodes.remove(&episode_id) {
                inner
                    .by_external_id
                    .remove(&(id, episode.external_id.clone()));
                removed.push(episode);
            }
        }

        Ok(Some((subscription, removed)))
    }

    async fn insert_episode(&self, new: NewEpisode) -> Result<Option<Episode>, StoreError> {
        Ok(self.inner.write().await.insert_episode(new))
    }

    async fn insert_episodes(
        &self,
        batch: Vec<NewEpisode>,
    ) -> Result<Vec<Option<Episode>>, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(batch
            .into_iter()
            .map(|new| inner.insert_episode(new))
            .collect())
    }

    async fn episode(&self, id: EpisodeId) -> Result<Option<Episode>, StoreError> {
        Ok(self.inner.read().await.episodes.get(&id).cloned())
    }

    async fn episodes(
        &self,
        subscription_id: SubscriptionId,
        filter: &EpisodeFilter,
    ) -> Result<Vec<Episode>, StoreError> {
        let inner = self.inner.read().await;
        let mut episodes: Vec<Episode> = inner
            .episodes
            .values()
            .filter(|e| e.subscription_id == subscription_id && filter.matches(e))
            .cloned()
            .collect();
        episodes.sort_by(newest_first);
        Ok(episodes)
    }

    async fn episodes_by_status(
        &self,
        statuses: &[DownloadStatus],
    ) -> Result<Vec<Episode>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .episodes
            .values()
            .filter(|e| statuses.contains(&e.status))
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        id: EpisodeId,
        from: &[DownloadStatus],
        to: DownloadStatus,
    ) -> Result<Transition, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(episode) = inner.episode_mut(id) else {
            return Ok(Transition::Missing);
        };
        if !from.contains(&episode.status) {
            return Ok(Transition::Rejected(episode.status));
        }
        episode.status = to;
        Ok(Transition::Applied(episode.clone()))
    }

    async fn complete_download(
        &self,
        id: EpisodeId,
        path: PathBuf,
        content_hash: String,
    ) -> Result<Transition, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(episode) = inner.episode_mut(id) else {
            return Ok(Transition::Missing);
        };
        if episode.status != DownloadStatus::Downloading {
            return Ok(Transition::Rejected(episode.status));
        }
        episode.status = DownloadStatus::Downloaded;
        episode.local_path = Some(path);
        episode.content_hash = Some(content_hash);
        episode.downloaded_at = Some(Utc::now());
        Ok(Transition::Applied(episode.clone()))
    }

    async fn clear_download(&self, id: EpisodeId) -> Result<Option<Episode>, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.episode_mut(id).map(|episode| {
            let before = episode.clone();
            episode.status = DownloadStatus::NotDownloaded;
            episode.local_path = None;
            episode.local_artwork_path = None;
            episode.content_hash = None;
            episode.downloaded_at = None;
            before
        }))
    }

    async fn set_local_artwork(
        &self,
        id: EpisodeId,
        path: Option<PathBuf>,
    ) -> Result<Option<Episode>, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.episode_mut(id).map(|episode| {
            episode.local_artwork_path = path;
            episode.clone()
        }))
    }

    async fn set_played(&self, id: EpisodeId, played: bool) -> Result<Option<Episode>, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.episode_mut(id).map(|episode| {
            episode.played = played;
            episode.clone()
        }))
    }

    async fn set_bookmarked(
        &self,
        id: EpisodeId,
        bookmarked: bool,
    ) -> Result<Option<Episode>, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.episode_mut(id).map(|episode| {
            episode.bookmarked = bookmarked;
            episode.clone()
        }))
    }
}
