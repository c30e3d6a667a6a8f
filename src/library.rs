// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The public face of the pipeline.
//!
//! A [`Library`] owns the download scheduler and the refresh coordinator and
//! exposes subscription management, downloads and per-episode user state.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::{Config, RetryConfig};
use crate::coordinator::{RefreshCoordinator, RefreshHandle, SubscriptionRefresh};
use crate::episode::storage_dir_name;
use crate::error::PipelineError;
use crate::feed::{fetch_feed, normalize_feed_url};
use crate::http::SharedHttpClient;
use crate::model::{
    DownloadStatus, Episode, EpisodeFilter, EpisodeId, NewSubscription, SortOrder, Subscription,
    SubscriptionId, SubscriptionSort, sort_subscriptions,
};
use crate::progress::SharedProgressReporter;
use crate::retry::with_retry;
use crate::scheduler::{DownloadScheduler, EnqueueOutcome, SchedulerConfig};
use crate::settings::{PolicyOverride, SettingsHandle};
use crate::store::SharedRepository;

/// A new subscription and the refresh started for it
#[derive(Debug)]
pub struct AddedSubscription {
    pub subscription: Subscription,
    pub refresh: RefreshHandle,
}

/// What happens to downloaded files when a subscription is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Remove the subscription's storage directory as well
    WithFiles,
    /// Leave downloaded files on disk
    KeepFiles,
}

#[derive(Clone)]
pub struct Library {
    store: SharedRepository,
    client: SharedHttpClient,
    settings: SettingsHandle,
    scheduler: DownloadScheduler,
    coordinator: RefreshCoordinator,
    library_dir: PathBuf,
    retry: RetryConfig,
}

impl Library {
    /// Start the worker pools and recover downloads interrupted by a previous run
    pub async fn open(
        config: &Config,
        store: SharedRepository,
        client: SharedHttpClient,
        reporter: SharedProgressReporter,
    ) -> Result<Self, PipelineError> {
        tokio::fs::create_dir_all(&config.library_dir)
            .await
            .map_err(|e| PipelineError::Io {
                path: config.library_dir.clone(),
                source: e,
            })?;

        let settings = SettingsHandle::new(config.settings.clone());
        let scheduler = DownloadScheduler::start(
            SchedulerConfig::from_config(config),
            store.clone(),
            client.clone(),
            settings.clone(),
            reporter.clone(),
        );
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            client.clone(),
            settings.clone(),
            scheduler.clone(),
            reporter,
            config.retry.clone(),
            config.refresh_concurrency,
        );

        let library = Self {
            store,
            client,
            settings,
            scheduler,
            coordinator,
            library_dir: config.library_dir.clone(),
            retry: config.retry.clone(),
        };
        library.scheduler.recover().await?;
        Ok(library)
    }

    /// Subscribe to a feed
    ///
    /// The feed is fetched once to validate it and to take its title. The
    /// returned handle tracks the first refresh, which runs the download policy.
    pub async fn add_subscription(&self, url: &str) -> Result<AddedSubscription, PipelineError> {
        let feed_url = normalize_feed_url(url)?;
        if self.store.subscription_by_url(&feed_url).await?.is_some() {
            return Err(PipelineError::DuplicateSubscription { feed_url });
        }

        let client = self.client.as_ref();
        let target = feed_url.as_str();
        let document = with_retry(&self.retry, move || fetch_feed(client, target)).await?;

        let storage_dir = self.unique_storage_dir(&document.title).await?;
        let subscription = self
            .store
            .insert_subscription(NewSubscription {
                feed_url,
                title: document.title,
                description: document.description,
                artwork_url: document.artwork_url.map(|u| u.to_string()),
                storage_dir,
            })
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            url = %subscription.feed_url,
            title = %subscription.title,
            "Subscription added"
        );

        let refresh = self.coordinator.refresh_one(subscription.id);
        Ok(AddedSubscription {
            subscription,
            refresh,
        })
    }

    /// Directory name derived from `title` that no subscription or leftover directory uses
    async fn unique_storage_dir(&self, title: &str) -> Result<String, PipelineError> {
        let taken: HashSet<String> = self
            .store
            .subscriptions()
            .await?
            .into_iter()
            .map(|s| s.storage_dir)
            .collect();

        let base = storage_dir_name(title);
        let mut candidate = base.clone();
        let mut suffix = 2;
        while taken.contains(&candidate)
            || tokio::fs::try_exists(self.library_dir.join(&candidate))
                .await
                .unwrap_or(false)
        {
            candidate = format!("{base}-{suffix}");
            suffix += 1;
        }
        Ok(candidate)
    }

    pub fn refresh_one(&self, subscription_id: SubscriptionId) -> RefreshHandle {
        self.coordinator.refresh_one(subscription_id)
    }

    pub async fn refresh_all(&self) -> Result<Vec<SubscriptionRefresh>, PipelineError> {
        self.coordinator.refresh_all().await
    }

    /// Refresh all subscriptions every `interval` until shutdown
    pub fn spawn_periodic_refresh(&self, interval: Duration) -> JoinHandle<()> {
        self.coordinator.spawn_periodic(interval)
    }

    /// Queue every episode of a subscription that is not downloaded yet
    ///
    /// Returns how many episodes were newly queued.
    pub async fn enqueue_all_undownloaded(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<usize, PipelineError> {
        self.subscription(subscription_id).await?;

        let candidates = self
            .store
            .episodes(
                subscription_id,
                &EpisodeFilter::with_status(&[DownloadStatus::NotDownloaded, DownloadStatus::Failed]),
            )
            .await?;

        let mut queued = 0;
        for episode in candidates {
            if self.scheduler.enqueue(episode.id).await?.is_queued() {
                queued += 1;
            }
        }
        tracing::debug!(subscription_id = %subscription_id, queued, "Queued undownloaded episodes");
        Ok(queued)
    }

    pub async fn enqueue_one(&self, episode_id: EpisodeId) -> Result<EnqueueOutcome, PipelineError> {
        self.scheduler.enqueue(episode_id).await
    }

    /// Delete an episode's downloaded file and return the episode to `NotDownloaded`
    ///
    /// A pending or running download of the episode is cancelled.
    pub async fn delete_downloaded_file(
        &self,
        episode_id: EpisodeId,
    ) -> Result<Episode, PipelineError> {
        self.scheduler.cancel(episode_id);

        let previous = self
            .store
            .clear_download(episode_id)
            .await?
            .ok_or(PipelineError::EpisodeNotFound(episode_id))?;
        remove_episode_files(&previous).await?;

        tracing::info!(episode_id = %episode_id, "Downloaded file deleted");
        self.episode(episode_id).await
    }

    pub async fn set_played(
        &self,
        episode_id: EpisodeId,
        played: bool,
    ) -> Result<Episode, PipelineError> {
        self.store
            .set_played(episode_id, played)
            .await?
            .ok_or(PipelineError::EpisodeNotFound(episode_id))
    }

    pub async fn set_bookmarked(
        &self,
        episode_id: EpisodeId,
        bookmarked: bool,
    ) -> Result<Episode, PipelineError> {
        self.store
            .set_bookmarked(episode_id, bookmarked)
            .await?
            .ok_or(PipelineError::EpisodeNotFound(episode_id))
    }

    /// Episodes of a subscription matching `filter`, newest first
    pub async fn list_episodes(
        &self,
        subscription_id: SubscriptionId,
        filter: &EpisodeFilter,
    ) -> Result<Vec<Episode>, PipelineError> {
        self.subscription(subscription_id).await?;
        Ok(self.store.episodes(subscription_id, filter).await?)
    }

    pub async fn episode(&self, episode_id: EpisodeId) -> Result<Episode, PipelineError> {
        self.store
            .episode(episode_id)
            .await?
            .ok_or(PipelineError::EpisodeNotFound(episode_id))
    }

    pub async fn subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Subscription, PipelineError> {
        self.store
            .subscription(subscription_id)
            .await?
            .ok_or(PipelineError::SubscriptionNotFound(subscription_id))
    }

    pub async fn list_subscriptions(
        &self,
        sort: SubscriptionSort,
        order: SortOrder,
    ) -> Result<Vec<Subscription>, PipelineError> {
        let mut subscriptions = self.store.subscriptions().await?;
        sort_subscriptions(&mut subscriptions, sort, order);
        Ok(subscriptions)
    }

    pub async fn set_subscription_policy(
        &self,
        subscription_id: SubscriptionId,
        policy: PolicyOverride,
    ) -> Result<Subscription, PipelineError> {
        self.store
            .set_policy(subscription_id, policy)
            .await?
            .ok_or(PipelineError::SubscriptionNotFound(subscription_id))
    }

    /// Remove a subscription and all of its episodes
    ///
    /// Downloads in flight are cancelled first; they discard their output
    /// once they notice the episode is gone.
    pub async fn delete_subscription(
        &self,
        subscription_id: SubscriptionId,
        mode: DeleteMode,
    ) -> Result<Subscription, PipelineError> {
        for episode in self
            .store
            .episodes(subscription_id, &EpisodeFilter::default())
            .await?
        {
            self.scheduler.cancel(episode.id);
        }

        let (subscription, episodes) = self
            .store
            .remove_subscription(subscription_id)
            .await?
            .ok_or(PipelineError::SubscriptionNotFound(subscription_id))?;

        // Episodes inserted by a refresh racing with the listing above
        for episode in &episodes {
            self.scheduler.cancel(episode.id);
        }

        if mode == DeleteMode::WithFiles {
            let dir = self.library_dir.join(&subscription.storage_dir);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(PipelineError::Io { path: dir, source: e }),
            }
        }

        tracing::info!(
            subscription_id = %subscription_id,
            episodes = episodes.len(),
            ?mode,
            "Subscription deleted"
        );
        Ok(subscription)
    }

    /// Delete every downloaded file of a subscription, keeping all records
    ///
    /// Returns how many episodes had a file or an active download.
    pub async fn delete_subscription_files(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<usize, PipelineError> {
        self.subscription(subscription_id).await?;

        let affected = self
            .store
            .episodes(
                subscription_id,
                &EpisodeFilter::with_status(&[
                    DownloadStatus::Queued,
                    DownloadStatus::Downloading,
                    DownloadStatus::Downloaded,
                ]),
            )
            .await?;

        let mut cleared = 0;
        for episode in affected {
            self.scheduler.cancel(episode.id);
            if let Some(previous) = self.store.clear_download(episode.id).await? {
                remove_episode_files(&previous).await?;
                cleared += 1;
            }
        }
        tracing::info!(subscription_id = %subscription_id, cleared, "Subscription files deleted");
        Ok(cleared)
    }

    /// Live settings; changes apply to decisions made afterwards
    pub fn settings(&self) -> SettingsHandle {
        self.settings.clone()
    }

    /// Wait until no download is queued or running
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await;
    }

    /// Stop refreshing and downloading; interrupted downloads resume on the next open
    pub async fn shutdown(&self) {
        self.coordinator.shutdown();
        self.scheduler.shutdown().await;
    }
}

async fn remove_episode_files(episode: &Episode) -> Result<(), PipelineError> {
    for path in [&episode.local_path, &episode.local_artwork_path]
        .into_iter()
        .flatten()
    {
        remove_if_exists(path).await?;
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), PipelineError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
