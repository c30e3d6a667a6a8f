// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Repository of subscriptions and episodes.
//!
//! Every mutation is a single atomic update keyed by id. Download status
//! changes go through [`Repository::transition`], a compare-and-swap on the
//! current status, so concurrent enqueues and cancellations cannot both win.

mod file;
mod memory;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{
    DownloadStatus, Episode, EpisodeFilter, EpisodeId, NewEpisode, NewSubscription, Subscription,
    SubscriptionId,
};
use crate::settings::PolicyOverride;

pub use file::FileStore;
pub use memory::{LibrarySnapshot, MemoryStore};

/// Result of a compare-and-swap on an episode's download status
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The status matched and the episode now looks like this
    Applied(Episode),
    /// The episode exists but was in this status
    Rejected(DownloadStatus),
    /// No such episode
    Missing,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Feed metadata recorded after a successful refresh
#[derive(Debug, Clone)]
pub struct RefreshRecord {
    pub title: String,
    pub description: Option<String>,
    pub artwork_url: Option<String>,
    pub refreshed_at: DateTime<Utc>,
}

/// Storage collaborator used by every pipeline component
#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert a subscription; the feed URL must be unique
    async fn insert_subscription(&self, new: NewSubscription) -> Result<Subscription, StoreError>;

    async fn subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError>;

    async fn subscription_by_url(&self, feed_url: &str)
    -> Result<Option<Subscription>, StoreError>;

    /// All subscriptions in id order
    async fn subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;

    async fn record_refresh(
        &self,
        id: SubscriptionId,
        record: RefreshRecord,
    ) -> Result<Option<Subscription>, StoreError>;

    async fn set_policy(
        &self,
        id: SubscriptionId,
        policy: PolicyOverride,
    ) -> Result<Option<Subscription>, StoreError>;

    /// Remove a subscription and all of its episodes, returning what was removed
    async fn remove_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<(Subscription, Vec<Episode>)>, StoreError>;

    /// Insert an episode unless `(subscription, external id)` already exists
    ///
    /// Returns `None` when the episode is already known or the subscription is gone.
    async fn insert_episode(&self, new: NewEpisode) -> Result<Option<Episode>, StoreError>;

    /// Insert a batch of episodes as one update, one result per input in order
    async fn insert_episodes(
        &self,
        batch: Vec<NewEpisode>,
    ) -> Result<Vec<Option<Episode>>, StoreError>;

    async fn episode(&self, id: EpisodeId) -> Result<Option<Episode>, StoreError>;

    /// Episodes of a subscription matching `filter`, newest first
    async fn episodes(
        &self,
        subscription_id: SubscriptionId,
        filter: &EpisodeFilter,
    ) -> Result<Vec<Episode>, StoreError>;

    /// Episodes of every subscription currently in one of `statuses`
    async fn episodes_by_status(
        &self,
        statuses: &[DownloadStatus],
    ) -> Result<Vec<Episode>, StoreError>;

    /// Move an episode to `to` if its current status is one of `from`
    async fn transition(
        &self,
        id: EpisodeId,
        from: &[DownloadStatus],
        to: DownloadStatus,
    ) -> Result<Transition, StoreError>;

    /// `Downloading -> Downloaded`, recording the file location and hash
    async fn complete_download(
        &self,
        id: EpisodeId,
        path: PathBuf,
        content_hash: String,
    ) -> Result<Transition, StoreError>;

    /// Reset an episode to `NotDownloaded`, clearing its local file data
    ///
    /// Returns the episode as it was before the reset.
    async fn clear_download(&self, id: EpisodeId) -> Result<Option<Episode>, StoreError>;

    async fn set_local_artwork(
        &self,
        id: EpisodeId,
        path: Option<PathBuf>,
    ) -> Result<Option<Episode>, StoreError>;

    async fn set_played(&self, id: EpisodeId, played: bool) -> Result<Option<Episode>, StoreError>;

    async fn set_bookmarked(
        &self,
        id: EpisodeId,
        bookmarked: bool,
    ) -> Result<Option<Episode>, StoreError>;
}

/// A shared reference to a repository
pub type SharedRepository = Arc<dyn Repository>;
