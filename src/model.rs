// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::settings::PolicyOverride;

/// Identifier of a stored subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

/// Identifier of a stored episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A followed feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    /// Normalized feed URL, unique across subscriptions
    pub feed_url: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_url: Option<String>,
    /// Directory name (relative to the library directory) holding downloaded files
    pub storage_dir: String,
    #[serde(default)]
    pub policy: PolicyOverride,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refreshed_at: Option<DateTime<Utc>>,
    /// Publish date of the newest known episode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_episode_at: Option<DateTime<Utc>>,
}

/// Data needed to create a subscription
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub feed_url: String,
    pub title: String,
    pub description: Option<String>,
    pub artwork_url: Option<String>,
    pub storage_dir: String,
}

/// Per-episode download state machine
///
/// `NotDownloaded -> Queued -> Downloading -> Downloaded | Failed`, with
/// `Downloaded -> NotDownloaded` on file deletion and `Failed -> Queued` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    NotDownloaded,
    Queued,
    Downloading,
    Downloaded,
    Failed,
}

impl DownloadStatus {
    /// Whether a download for this episode is pending or running
    pub fn is_active(self) -> bool {
        matches!(self, DownloadStatus::Queued | DownloadStatus::Downloading)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DownloadStatus::NotDownloaded => "not downloaded",
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Downloaded => "downloaded",
            DownloadStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One media item of a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    pub subscription_id: SubscriptionId,
    /// Feed GUID, or the enclosure URL when the feed provides none
    pub external_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub enclosure_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclosure_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclosure_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_artwork_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub status: DownloadStatus,
    #[serde(default)]
    pub played: bool,
    #[serde(default)]
    pub bookmarked: bool,
    pub discovered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
}

/// Data needed to insert a newly discovered episode
#[derive(Debug, Clone)]
pub struct NewEpisode {
    pub subscription_id: SubscriptionId,
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub enclosure_url: String,
    pub enclosure_type: Option<String>,
    pub enclosure_length: Option<u64>,
    pub episode_number: Option<u32>,
    pub duration: Option<String>,
    pub artwork_url: Option<String>,
}

/// Three-way filter over a boolean episode property
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlagFilter {
    #[default]
    Any,
    Only,
    Exclude,
}

impl FlagFilter {
    pub fn matches(self, value: bool) -> bool {
        match self {
            FlagFilter::Any => true,
            FlagFilter::Only => value,
            FlagFilter::Exclude => !value,
        }
    }
}

/// Filter for listing the episodes of a subscription
#[derive(Debug, Clone, Default)]
pub struct EpisodeFilter {
    pub downloaded: FlagFilter,
    pub played: FlagFilter,
    /// Only episodes published at or after this instant
    pub from_date: Option<DateTime<Utc>>,
    /// Restrict to these download states (empty = any)
    pub statuses: Vec<DownloadStatus>,
}

impl EpisodeFilter {
    pub fn downloaded_only() -> Self {
        Self {
            downloaded: FlagFilter::Only,
            ..Default::default()
        }
    }

    pub fn with_status(statuses: &[DownloadStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }

    pub fn matches(&self, episode: &Episode) -> bool {
        if !self
            .downloaded
            .matches(episode.status == DownloadStatus::Downloaded)
        {
            return false;
        }
        if !self.played.matches(episode.played) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&episode.status) {
            return false;
        }
        match (self.from_date, episode.published_at) {
            (Some(from), Some(published)) => published >= from,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

/// Sort key for listing subscriptions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubscriptionSort {
    #[default]
    DateAdded,
    Name,
    LastEpisode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Sort subscriptions in place
pub fn sort_subscriptions(
    subscriptions: &mut [Subscription],
    sort: SubscriptionSort,
    order: SortOrder,
) {
    subscriptions.sort_by(|a, b| {
        let ordering = match sort {
            SubscriptionSort::DateAdded => a.created_at.cmp(&b.created_at),
            SubscriptionSort::Name => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
            SubscriptionSort::LastEpisode => a.last_episode_at.cmp(&b.last_episode_at),
        }
        .then_with(|| a.id.cmp(&b.id));

        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}

/// Order episodes newest first; undated episodes sort last
pub fn newest_first(a: &Episode, b: &Episode) -> std::cmp::Ordering {
    b.published_at
        .cmp(&a.published_at)
        .then_with(|| a.external_id.cmp(&b.external_id))
}
