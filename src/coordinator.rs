// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Orchestrates fetch, reconcile, policy and scheduling per subscription.
//!
//! Refreshes run as spawned tasks bounded by a semaphore. Requests for a
//! subscription that is already refreshing share the running refresh.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::PipelineError;
use crate::feed::fetch_feed;
use crate::http::SharedHttpClient;
use crate::model::{EpisodeFilter, SubscriptionId};
use crate::policy;
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::reconcile::reconcile;
use crate::retry::{IsRetryable, with_retry_until};
use crate::scheduler::{DownloadScheduler, EnqueueOutcome};
use crate::settings::SettingsHandle;
use crate::store::{RefreshRecord, SharedRepository};

/// Counts of a successful refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSummary {
    pub title: String,
    pub new_episodes: usize,
    pub existing: usize,
    pub rejected: usize,
    /// Episodes handed to the download scheduler
    pub queued: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshFailureKind {
    /// The subscription does not exist (anymore)
    NotFound,
    /// Network trouble that outlasted the retries
    Transient,
    /// The feed itself is unusable
    Permanent,
    Store,
    /// The refresh task was stopped before finishing
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshFailure {
    pub kind: RefreshFailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(RefreshSummary),
    Failed(RefreshFailure),
}

/// Result of refreshing one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRefresh {
    pub subscription_id: SubscriptionId,
    pub outcome: RefreshOutcome,
}

impl SubscriptionRefresh {
    fn failed(subscription_id: SubscriptionId, kind: RefreshFailureKind, message: String) -> Self {
        Self {
            subscription_id,
            outcome: RefreshOutcome::Failed(RefreshFailure { kind, message }),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RefreshOutcome::Refreshed(_))
    }
}

/// Awaitable refresh; cloned handles observe the same refresh
///
/// Dropping every handle does not stop the refresh.
#[derive(Clone)]
pub struct RefreshHandle {
    subscription_id: SubscriptionId,
    result: Shared<BoxFuture<'static, SubscriptionRefresh>>,
}

impl RefreshHandle {
    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    pub async fn wait(self) -> SubscriptionRefresh {
        self.result.await
    }
}

impl std::fmt::Debug for RefreshHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshHandle")
            .field("subscription_id", &self.subscription_id)
            .finish_non_exhaustive()
    }
}

struct Inner {
    store: SharedRepository,
    client: SharedHttpClient,
    settings: SettingsHandle,
    scheduler: DownloadScheduler,
    reporter: SharedProgressReporter,
    retry: RetryConfig,
    permits: Arc<Semaphore>,
    inflight: Mutex<HashMap<SubscriptionId, RefreshHandle>>,
    shutdown: CancellationToken,
}

impl Inner {
    fn inflight(&self) -> MutexGuard<'_, HashMap<SubscriptionId, RefreshHandle>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the in-flight entry even if the refresh task panics
struct InflightGuard {
    inner: Arc<Inner>,
    subscription_id: SubscriptionId,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inner.inflight().remove(&self.subscription_id);
    }
}

/// Runs refreshes with bounded parallelism and per-subscription single-flight
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: SharedRepository,
        client: SharedHttpClient,
        settings: SettingsHandle,
        scheduler: DownloadScheduler,
        reporter: SharedProgressReporter,
        retry: RetryConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                client,
                settings,
                scheduler,
                reporter,
                retry,
                permits: Arc::new(Semaphore::new(concurrency.max(1))),
                inflight: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start (or join) the refresh of one subscription
    pub fn refresh_one(&self, subscription_id: SubscriptionId) -> RefreshHandle {
        let mut inflight = self.inner.inflight();
        if let Some(handle) = inflight.get(&subscription_id) {
            tracing::debug!(subscription_id = %subscription_id, "Joining in-flight refresh");
            return handle.clone();
        }

        let (tx, rx) = oneshot::channel();
        let result = async move {
            rx.await.unwrap_or_else(|_| {
                SubscriptionRefresh::failed(
                    subscription_id,
                    RefreshFailureKind::Cancelled,
                    "refresh task ended before reporting".to_string(),
                )
            })
        }
        .boxed()
        .shared();

        let handle = RefreshHandle {
            subscription_id,
            result,
        };
        inflight.insert(subscription_id, handle.clone());
        drop(inflight);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let guard = InflightGuard {
                inner: inner.clone(),
                subscription_id,
            };
            let refresh = run_with_permit(&inner, subscription_id).await;
            // New requests after this point start a fresh refresh
            drop(guard);
            let _ = tx.send(refresh);
        });

        handle
    }

    /// Refresh every subscription; one result per subscription
    pub async fn refresh_all(&self) -> Result<Vec<SubscriptionRefresh>, PipelineError> {
        let subscriptions = self.inner.store.subscriptions().await?;
        let handles: Vec<_> = subscriptions
            .iter()
            .map(|s| self.refresh_one(s.id))
            .collect();

        let results = futures::future::join_all(handles.into_iter().map(RefreshHandle::wait)).await;

        let failed = results.iter().filter(|r| !r.is_success()).count();
        tracing::info!(
            subscriptions = results.len(),
            failed,
            "Refreshed all subscriptions"
        );
        Ok(results)
    }

    /// Refresh everything every `interval` until [`shutdown`](Self::shutdown)
    pub fn spawn_periodic(&self, interval: Duration) -> JoinHandle<()> {
        let coordinator = self.clone();
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                tracing::debug!("Periodic refresh starting");
                if let Err(e) = coordinator.refresh_all().await {
                    tracing::error!(error = %e, "Periodic refresh failed");
                }
            }
            tracing::debug!("Periodic refresh stopped");
        })
    }

    /// Stop periodic refreshes and refuse to start new ones
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.permits.close();
    }
}

async fn run_with_permit(inner: &Inner, subscription_id: SubscriptionId) -> SubscriptionRefresh {
    let Ok(_permit) = inner.permits.clone().acquire_owned().await else {
        return SubscriptionRefresh::failed(
            subscription_id,
            RefreshFailureKind::Cancelled,
            "shutting down".to_string(),
        );
    };

    let outcome = match refresh(inner, subscription_id).await {
        Ok(summary) => {
            inner.reporter.report(ProgressEvent::RefreshCompleted {
                subscription_id,
                title: summary.title.clone(),
                new_episodes: summary.new_episodes,
                queued: summary.queued,
            });
            RefreshOutcome::Refreshed(summary)
        }
        Err(failure) => {
            tracing::warn!(
                subscription_id = %subscription_id,
                error = %failure.message,
                "Refresh failed"
            );
            inner.reporter.report(ProgressEvent::RefreshFailed {
                subscription_id,
                error: failure.message.clone(),
            });
            RefreshOutcome::Failed(failure)
        }
    };

    SubscriptionRefresh {
        subscription_id,
        outcome,
    }
}

/// Fetch, reconcile, decide and enqueue, strictly in this order
async fn refresh(
    inner: &Inner,
    subscription_id: SubscriptionId,
) -> Result<RefreshSummary, RefreshFailure> {
    let store_failure = |e: &dyn std::fmt::Display| RefreshFailure {
        kind: RefreshFailureKind::Store,
        message: e.to_string(),
    };
    let not_found = || RefreshFailure {
        kind: RefreshFailureKind::NotFound,
        message: format!("Subscription {subscription_id} not found"),
    };

    let subscription = inner
        .store
        .subscription(subscription_id)
        .await
        .map_err(|e| store_failure(&e))?
        .ok_or_else(not_found)?;

    inner.reporter.report(ProgressEvent::RefreshStarted {
        subscription_id,
        url: subscription.feed_url.clone(),
    });

    let client = inner.client.as_ref();
    let url = subscription.feed_url.as_str();
    let document = with_retry_until(&inner.retry, &inner.shutdown, move || {
        fetch_feed(client, url)
    })
    .await
    .map_err(|e| RefreshFailure {
        kind: if inner.shutdown.is_cancelled() {
            RefreshFailureKind::Cancelled
        } else if e.is_retryable() {
            RefreshFailureKind::Transient
        } else {
            RefreshFailureKind::Permanent
        },
        message: e.to_string(),
    })?;

    let previously_downloaded = inner
        .store
        .episodes(subscription_id, &EpisodeFilter::downloaded_only())
        .await
        .map_err(|e| store_failure(&e))?
        .len();

    let reconciled = reconcile(inner.store.as_ref(), subscription_id, &document)
        .await
        .map_err(|e| store_failure(&e))?;

    let selected = policy::decide(
        &subscription,
        previously_downloaded,
        &reconciled.inserted,
        &inner.settings.snapshot(),
    );

    inner
        .store
        .record_refresh(
            subscription_id,
            RefreshRecord {
                title: document.title.clone(),
                description: document.description.clone(),
                artwork_url: document.artwork_url.as_ref().map(|u| u.to_string()),
                refreshed_at: Utc::now(),
            },
        )
        .await
        .map_err(|e| store_failure(&e))?
        .ok_or_else(not_found)?;

    let mut queued = 0;
    for episode_id in selected {
        match inner.scheduler.enqueue(episode_id).await {
            Ok(EnqueueOutcome::Queued(_)) => queued += 1,
            Ok(_) => {}
            Err(PipelineError::ShuttingDown) => break,
            Err(e) => {
                tracing::warn!(episode_id = %episode_id, error = %e, "Failed to enqueue episode");
            }
        }
    }

    tracing::info!(
        subscription_id = %subscription_id,
        title = %document.title,
        new_episodes = reconciled.inserted.len(),
        queued,
        "Subscription refreshed"
    );

    Ok(RefreshSummary {
        title: document.title,
        new_episodes: reconciled.inserted.len(),
        existing: reconciled.existing,
        rejected: reconciled.rejected,
        queued,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DownloadStatus, NewSubscription};
    use crate::progress::NoopReporter;
    use crate::scheduler::SchedulerConfig;
    use crate::settings::Settings;
    use crate::store::{MemoryStore, Repository};
    use crate::testing::{MockHttpClient, rss_feed};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        client: Arc<MockHttpClient>,
        scheduler: DownloadScheduler,
        coordinator: RefreshCoordinator,
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 1,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn fixture(settings: Settings) -> Fixture {
        fixture_with_retry(settings, fast_retry())
    }

    fn fixture_with_retry(settings: Settings, retry: RetryConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MockHttpClient::new());
        let settings = SettingsHandle::new(settings);
        let scheduler = DownloadScheduler::start(
            SchedulerConfig {
                workers: 2,
                queue_capacity: 64,
                library_dir: dir.path().to_path_buf(),
                retry: fast_retry(),
                chunk_timeout: Duration::from_secs(5),
            },
            store.clone(),
            client.clone(),
            settings.clone(),
            NoopReporter::shared(),
        );
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            client.clone(),
            settings,
            scheduler.clone(),
            NoopReporter::shared(),
            retry,
            5,
        );
        Fixture {
            _dir: dir,
            store,
            client,
            scheduler,
            coordinator,
        }
    }

    async fn subscribe(fx: &Fixture, url: &str, show: &str) -> SubscriptionId {
        fx.store
            .insert_subscription(NewSubscription {
                feed_url: url.to_string(),
                title: show.to_string(),
                description: None,
                artwork_url: None,
                storage_dir: show.to_string(),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn first_refresh_queues_newest_episodes() {
        let fx = fixture(Settings {
            initial_download_count: 3,
            ..Default::default()
        });
        let url = "https://example.com/show.xml";
        fx.client.add_feed(url, rss_feed("Show", 10));
        fx.client.serve_episodes("Show", 10);
        let id = subscribe(&fx, url, "Show").await;

        let refresh = fx.coordinator.refresh_one(id).wait().await;
        fx.scheduler.wait_idle().await;

        let RefreshOutcome::Refreshed(summary) = refresh.outcome else {
            panic!("refresh failed: {refresh:?}");
        };
        assert_eq!(summary.new_episodes, 10);
        assert_eq!(summary.queued, 3);

        let downloaded = fx
            .store
            .episodes(id, &EpisodeFilter::downloaded_only())
            .await
            .unwrap();
        let titles: Vec<_> = downloaded.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Show Episode 10", "Show Episode 9", "Show Episode 8"]
        );

        let subscription = fx.store.subscription(id).await.unwrap().unwrap();
        assert!(subscription.last_refreshed_at.is_some());
    }

    #[tokio::test]
    async fn second_refresh_only_queues_with_auto_download() {
        let fx = fixture(Settings {
            initial_download_count: 1,
            ..Default::default()
        });
        let url = "https://example.com/show.xml";
        fx.client.add_feed(url, rss_feed("Show", 2));
        fx.client.serve_episodes("Show", 4);
        let id = subscribe(&fx, url, "Show").await;

        fx.coordinator.refresh_one(id).wait().await;
        fx.client.add_feed(url, rss_feed("Show", 4));
        let second = fx.coordinator.refresh_one(id).wait().await;
        fx.scheduler.wait_idle().await;

        let RefreshOutcome::Refreshed(summary) = second.outcome else {
            panic!("refresh failed");
        };
        assert_eq!(summary.new_episodes, 2);
        assert_eq!(summary.existing, 2);
        assert_eq!(summary.queued, 0);
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_fetch() {
        let fx = fixture(Settings {
            download_on_add: false,
            ..Default::default()
        });
        let url = "https://example.com/slow.xml";
        fx.client
            .add_delayed_feed(url, rss_feed("Slow", 2), Duration::from_millis(100));
        let id = subscribe(&fx, url, "Slow").await;

        let first = fx.coordinator.refresh_one(id);
        let second = fx.coordinator.refresh_one(id);
        let (a, b) = tokio::join!(first.wait(), second.wait());

        assert_eq!(a, b);
        assert!(a.is_success());
        assert_eq!(fx.client.calls(url), 1);

        // Once finished, a new request fetches again
        fx.coordinator.refresh_one(id).wait().await;
        assert_eq!(fx.client.calls(url), 2);
    }

    #[tokio::test]
    async fn one_broken_feed_does_not_stop_the_others() {
        let fx = fixture(Settings {
            initial_download_count: 2,
            ..Default::default()
        });
        let broken = subscribe(&fx, "https://a.example.com/feed.xml", "Broken").await;
        fx.client.add_status("https://a.example.com/feed.xml", 404);
        let healthy = subscribe(&fx, "https://b.example.com/feed.xml", "Healthy").await;
        fx.client
            .add_feed("https://b.example.com/feed.xml", rss_feed("Healthy", 3));
        fx.client.serve_episodes("Healthy", 3);

        let results = fx.coordinator.refresh_all().await.unwrap();
        fx.scheduler.wait_idle().await;

        assert_eq!(results.len(), 2);
        let broken_result = results.iter().find(|r| r.subscription_id == broken).unwrap();
        assert!(matches!(
            &broken_result.outcome,
            RefreshOutcome::Failed(RefreshFailure {
                kind: RefreshFailureKind::Permanent,
                ..
            })
        ));
        let healthy_result = results.iter().find(|r| r.subscription_id == healthy).unwrap();
        assert!(healthy_result.is_success());

        let episodes = fx
            .store
            .episodes(healthy, &EpisodeFilter::default())
            .await
            .unwrap();
        assert_eq!(episodes.len(), 3);
        let downloaded = episodes
            .iter()
            .filter(|e| e.status == DownloadStatus::Downloaded)
            .count();
        assert_eq!(downloaded, 2);

        let broken_sub = fx.store.subscription(broken).await.unwrap().unwrap();
        assert!(broken_sub.last_refreshed_at.is_none());
    }

    #[tokio::test]
    async fn transient_failure_is_classified() {
        let fx = fixture(Settings::default());
        let url = "https://example.com/down.xml";
        fx.client.add_status(url, 503);
        let id = subscribe(&fx, url, "Down").await;

        let result = fx.coordinator.refresh_one(id).wait().await;

        assert!(matches!(
            result.outcome,
            RefreshOutcome::Failed(RefreshFailure {
                kind: RefreshFailureKind::Transient,
                ..
            })
        ));
        assert_eq!(fx.client.calls(url), 2);
    }

    #[tokio::test]
    async fn shutdown_interrupts_refresh_backoff() {
        let fx = fixture_with_retry(
            Settings::default(),
            RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 60_000,
                max_delay_ms: 60_000,
                backoff_multiplier: 1.0,
                jitter: false,
            },
        );
        let url = "https://example.com/down.xml";
        fx.client.add_status(url, 503);
        let id = subscribe(&fx, url, "Down").await;

        let handle = fx.coordinator.refresh_one(id);
        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.coordinator.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("refresh should stop once shut down");
        assert!(matches!(
            result.outcome,
            RefreshOutcome::Failed(RefreshFailure {
                kind: RefreshFailureKind::Cancelled,
                ..
            })
        ));
        assert_eq!(fx.client.calls(url), 1);
    }

    #[tokio::test]
    async fn unknown_subscription_is_not_found() {
        let fx = fixture(Settings::default());
        let result = fx.coordinator.refresh_one(SubscriptionId(99)).wait().await;
        assert!(matches!(
            result.outcome,
            RefreshOutcome::Failed(RefreshFailure {
                kind: RefreshFailureKind::NotFound,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn periodic_refresh_runs_until_shutdown() {
        let fx = fixture(Settings {
            download_on_add: false,
            ..Default::default()
        });
        let url = "https://example.com/tick.xml";
        fx.client.add_feed(url, rss_feed("Tick", 1));
        subscribe(&fx, url, "Tick").await;

        let task = fx.coordinator.spawn_periodic(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(90)).await;
        fx.coordinator.shutdown();
        task.await.unwrap();

        assert!(fx.client.calls(url) >= 2);
    }
}
