// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use crate::model::{EpisodeId, SubscriptionId};

/// Events emitted by the refresh and download pipeline for progress reporting
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A subscription's feed is being fetched
    RefreshStarted {
        subscription_id: SubscriptionId,
        url: String,
    },

    /// A refresh finished and its episodes were reconciled
    RefreshCompleted {
        subscription_id: SubscriptionId,
        title: String,
        new_episodes: usize,
        queued: usize,
    },

    /// A refresh failed; existing episodes are untouched
    RefreshFailed {
        subscription_id: SubscriptionId,
        error: String,
    },

    /// An episode was accepted by the download scheduler
    DownloadQueued {
        episode_id: EpisodeId,
        episode_title: String,
    },

    /// A worker started streaming an episode
    DownloadStarting {
        episode_id: EpisodeId,
        episode_title: String,
        /// Expected content length in bytes, if known
        content_length: Option<u64>,
    },

    /// Download progress update
    DownloadProgress {
        episode_id: EpisodeId,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },

    /// A download completed and the file is in place
    DownloadCompleted {
        episode_id: EpisodeId,
        episode_title: String,
        bytes_downloaded: u64,
        hash: String,
    },

    /// A download failed after its retries
    DownloadFailed {
        episode_id: EpisodeId,
        episode_title: String,
        error: String,
    },

    /// A download was cancelled by a deletion
    DownloadCancelled { episode_id: EpisodeId },

    /// Stale partial files were removed during recovery
    PartialFilesCleanedUp { count: usize },
}

/// Trait for reporting pipeline progress.
///
/// Implementations can use this to display progress bars, log messages,
/// or collect statistics.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {}
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingReporter {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressReporter for CollectingReporter {
        fn report(&self, event: ProgressEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn noop_reporter_handles_all_events() {
        let reporter = NoopReporter::shared();

        reporter.report(ProgressEvent::RefreshStarted {
            subscription_id: SubscriptionId(1),
            url: "https://example.com/feed.xml".to_string(),
        });
        reporter.report(ProgressEvent::DownloadProgress {
            episode_id: EpisodeId(1),
            bytes_downloaded: 512,
            total_bytes: Some(1024),
        });
        reporter.report(ProgressEvent::DownloadCancelled {
            episode_id: EpisodeId(1),
        });
        reporter.report(ProgressEvent::PartialFilesCleanedUp { count: 2 });
    }

    #[test]
    fn shared_reporter_receives_events_in_order() {
        let collector = Arc::new(CollectingReporter::default());
        let shared: SharedProgressReporter = collector.clone();

        shared.report(ProgressEvent::DownloadQueued {
            episode_id: EpisodeId(7),
            episode_title: "Pilot".to_string(),
        });
        shared.report(ProgressEvent::DownloadFailed {
            episode_id: EpisodeId(7),
            episode_title: "Pilot".to_string(),
            error: "HTTP error 404".to_string(),
        });

        let events = collector.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ProgressEvent::DownloadQueued { .. }));
        assert!(matches!(events[1], ProgressEvent::DownloadFailed { .. }));
    }
}
