// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::{EpisodeId, SubscriptionId};
use crate::retry::IsRetryable;

/// Errors that can occur when fetching or parsing feeds
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to fetch feed from {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for feed {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Unsupported content type '{content_type}' for feed {url}")]
    UnsupportedContentType { url: String, content_type: String },

    #[error("Feed is neither valid RSS ({rss}) nor Atom ({atom})")]
    Malformed {
        rss: rss::Error,
        atom: atom_syndication::Error,
    },

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl IsRetryable for FeedError {
    fn is_retryable(&self) -> bool {
        match self {
            FeedError::FetchFailed { source, .. } => is_transient_reqwest(source),
            FeedError::HttpStatus { status, .. } => is_transient_status(*status),
            FeedError::UnsupportedContentType { .. }
            | FeedError::Malformed { .. }
            | FeedError::InvalidUrl(_) => false,
        }
    }
}

/// Errors that can occur during episode downloads
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("No data received from {url} for {after:?}")]
    ChunkTimeout { url: String, after: Duration },

    #[error("Download of {url} ended after {received} of {expected} bytes")]
    Incomplete {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("Failed to create file {path}: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move {from} into place: {source}")]
    RenameFailed {
        from: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Download of {url} was cancelled")]
    Cancelled { url: String },
}

impl IsRetryable for DownloadError {
    fn is_retryable(&self) -> bool {
        match self {
            DownloadError::HttpFailed { source, .. } => is_transient_reqwest(source),
            DownloadError::HttpStatus { status, .. } => is_transient_status(*status),
            DownloadError::StreamFailed { .. }
            | DownloadError::ChunkTimeout { .. }
            | DownloadError::Incomplete { .. } => true,
            DownloadError::FileCreateFailed { .. }
            | DownloadError::FileWriteFailed { .. }
            | DownloadError::RenameFailed { .. }
            | DownloadError::Cancelled { .. } => false,
        }
    }
}

/// Errors raised by the episode/subscription store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("A subscription for {feed_url} already exists")]
    DuplicateSubscription { feed_url: String },

    #[error("Failed to read library file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write library file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse library JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize library: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),
}

/// Errors that can occur when loading or saving the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
}

/// Top-level errors returned by library operations
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("A subscription for {feed_url} already exists")]
    DuplicateSubscription { feed_url: String },

    #[error("Subscription {0} not found")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Episode {0} not found")]
    EpisodeNotFound(EpisodeId),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("The download scheduler is shutting down")]
    ShuttingDown,
}

impl From<StoreError> for PipelineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::DuplicateSubscription { feed_url } => {
                PipelineError::DuplicateSubscription { feed_url }
            }
            other => PipelineError::Store(other),
        }
    }
}

/// Timeouts, connection failures and interrupted bodies are worth retrying
fn is_transient_reqwest(error: &reqwest::Error) -> bool {
    if error.is_redirect() || error.is_builder() {
        return false;
    }
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

/// 5xx, 408 Request Timeout and 429 Too Many Requests are transient
fn is_transient_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}
