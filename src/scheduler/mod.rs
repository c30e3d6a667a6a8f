// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Download scheduler and its fixed worker pool.
//!
//! Accepting a download is a compare-and-swap `NotDownloaded | Failed -> Queued`
//! in the store, so an episode is never queued twice. Each accepted job carries
//! a cancellation token registered under the episode id; deletions cancel it.

mod worker;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RetryConfig};
use crate::episode::PARTIAL_SUFFIX;
use crate::error::PipelineError;
use crate::http::SharedHttpClient;
use crate::model::{DownloadStatus, EpisodeId};
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::settings::SettingsHandle;
use crate::store::{SharedRepository, Transition};

/// Sizing and limits of the download pool
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Root under which subscription storage directories live
    pub library_dir: PathBuf,
    pub retry: RetryConfig,
    pub chunk_timeout: Duration,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.download_workers.max(1),
            queue_capacity: config.queue_capacity.max(1),
            library_dir: config.library_dir.clone(),
            retry: config.retry.clone(),
            chunk_timeout: config.http.chunk_timeout(),
        }
    }
}

/// Final result of one download job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded { path: PathBuf },
    Failed { reason: String },
    Cancelled,
}

/// Awaitable result of an accepted download; dropping it does not cancel the job
#[derive(Debug)]
pub struct DownloadHandle {
    episode_id: EpisodeId,
    done: oneshot::Receiver<DownloadOutcome>,
}

impl DownloadHandle {
    pub fn episode_id(&self) -> EpisodeId {
        self.episode_id
    }

    /// Wait for the job to finish; a job dropped at shutdown counts as cancelled
    pub async fn wait(self) -> DownloadOutcome {
        self.done.await.unwrap_or(DownloadOutcome::Cancelled)
    }
}

/// Result of an enqueue request
#[derive(Debug)]
pub enum EnqueueOutcome {
    Queued(DownloadHandle),
    /// Already queued or downloading; nothing changed
    AlreadyActive,
    AlreadyDownloaded,
}

impl EnqueueOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, EnqueueOutcome::Queued(_))
    }
}

/// What start-up recovery found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub partials_removed: usize,
}

struct Job {
    episode_id: EpisodeId,
    seq: u64,
    cancel: CancellationToken,
    done: oneshot::Sender<DownloadOutcome>,
}

/// State shared by the scheduler front end and its workers
struct Shared {
    store: SharedRepository,
    client: SharedHttpClient,
    settings: SettingsHandle,
    reporter: SharedProgressReporter,
    config: SchedulerConfig,
    /// Live job per episode: `(sequence number, token)`
    active: Mutex<HashMap<EpisodeId, (u64, CancellationToken)>>,
    /// Number of accepted jobs not yet finished
    pending: watch::Sender<usize>,
}

impl Shared {
    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<EpisodeId, (u64, CancellationToken)>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, episode_id: EpisodeId, seq: u64) {
        {
            let mut active = self.active();
            if active.get(&episode_id).is_some_and(|(live, _)| *live == seq) {
                active.remove(&episode_id);
            }
        }
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Bounded-concurrency download scheduler
#[derive(Clone)]
pub struct DownloadScheduler {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Job>,
    next_seq: Arc<AtomicU64>,
    shutdown: CancellationToken,
    workers: Arc<tokio::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl DownloadScheduler {
    /// Spawn the worker pool; must be called inside a tokio runtime
    pub fn start(
        config: SchedulerConfig,
        store: SharedRepository,
        client: SharedHttpClient,
        settings: SettingsHandle,
        reporter: SharedProgressReporter,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let (pending, _) = watch::channel(0usize);
        let shutdown = CancellationToken::new();
        let worker_count = config.workers;

        let shared = Arc::new(Shared {
            store,
            client,
            settings,
            reporter,
            config,
            active: Mutex::new(HashMap::new()),
            pending,
        });

        let workers = (0..worker_count)
            .map(|worker_id| {
                tokio::spawn(worker::run(
                    worker_id,
                    shared.clone(),
                    rx.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        tracing::debug!(workers = worker_count, "Download scheduler started");

        Self {
            shared,
            tx,
            next_seq: Arc::new(AtomicU64::new(1)),
            shutdown,
            workers: Arc::new(tokio::sync::Mutex::new(workers)),
        }
    }

    /// Queue an episode for download
    ///
    /// Idempotent: an episode that is already queued or downloading is left
    /// alone. Failed episodes are queued again.
    pub async fn enqueue(&self, episode_id: EpisodeId) -> Result<EnqueueOutcome, PipelineError> {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::ShuttingDown);
        }

        let transition = self
            .shared
            .store
            .transition(
                episode_id,
                &[DownloadStatus::NotDownloaded, DownloadStatus::Failed],
                DownloadStatus::Queued,
            )
            .await?;

        let episode = match transition {
            Transition::Applied(episode) => episode,
            Transition::Rejected(DownloadStatus::Downloaded) => {
                return Ok(EnqueueOutcome::AlreadyDownloaded);
            }
            Transition::Rejected(status) => {
                tracing::debug!(episode_id = %episode_id, %status, "Download already active");
                return Ok(EnqueueOutcome::AlreadyActive);
            }
            Transition::Missing => return Err(PipelineError::EpisodeNotFound(episode_id)),
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        self.shared
            .active()
            .insert(episode_id, (seq, cancel.clone()));
        self.shared.pending.send_modify(|n| *n += 1);

        let (done_tx, done_rx) = oneshot::channel();
        let job = Job {
            episode_id,
            seq,
            cancel,
            done: done_tx,
        };

        if self.tx.send(job).await.is_err() {
            self.shared.finish(episode_id, seq);
            self.shared
                .store
                .transition(
                    episode_id,
                    &[DownloadStatus::Queued],
                    DownloadStatus::NotDownloaded,
                )
                .await?;
            return Err(PipelineError::ShuttingDown);
        }

        tracing::debug!(episode_id = %episode_id, title = %episode.title, "Download queued");
        self.shared.reporter.report(ProgressEvent::DownloadQueued {
            episode_id,
            episode_title: episode.title,
        });

        Ok(EnqueueOutcome::Queued(DownloadHandle {
            episode_id,
            done: done_rx,
        }))
    }

    /// Cancel the pending or running job of an episode, if any
    pub fn cancel(&self, episode_id: EpisodeId) -> bool {
        match self.shared.active().remove(&episode_id) {
            Some((_, token)) => {
                token.cancel();
                tracing::debug!(episode_id = %episode_id, "Download cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether a job for the episode is pending or running
    pub fn is_active(&self, episode_id: EpisodeId) -> bool {
        self.shared.active().contains_key(&episode_id)
    }

    /// Resolve once no accepted job is pending, or the scheduler shuts down
    pub async fn wait_idle(&self) {
        let mut pending = self.shared.pending.subscribe();
        tokio::select! {
            _ = pending.wait_for(|n| *n == 0) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Reset downloads interrupted by a previous process and remove stale partial files
    pub async fn recover(&self) -> Result<RecoveryReport, PipelineError> {
        let store = &self.shared.store;
        let mut report = RecoveryReport::default();

        for subscription in store.subscriptions().await? {
            let dir = self.shared.config.library_dir.join(&subscription.storage_dir);
            report.partials_removed += remove_partial_files(&dir).await;
        }
        if report.partials_removed > 0 {
            self.shared.reporter.report(ProgressEvent::PartialFilesCleanedUp {
                count: report.partials_removed,
            });
        }

        let interrupted = store
            .episodes_by_status(&[DownloadStatus::Queued, DownloadStatus::Downloading])
            .await?;
        for episode in interrupted {
            store
                .transition(
                    episode.id,
                    &[DownloadStatus::Queued, DownloadStatus::Downloading],
                    DownloadStatus::NotDownloaded,
                )
                .await?;
            if self.enqueue(episode.id).await?.is_queued() {
                report.requeued += 1;
            }
        }

        if report != RecoveryReport::default() {
            tracing::info!(
                requeued = report.requeued,
                partials_removed = report.partials_removed,
                "Recovered interrupted downloads"
            );
        }
        Ok(report)
    }

    /// Stop the workers; in-flight downloads are cancelled and resumed by the next start-up
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Download worker ended abnormally");
            }
        }
        tracing::debug!("Download scheduler stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Delete `*.partial` files directly inside `dir`, returning how many were removed
///
/// The empty placeholder that reserved an interrupted download's name goes too.
async fn remove_partial_files(dir: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(reserved) = name.strip_suffix(PARTIAL_SUFFIX) else {
            continue;
        };
        let placeholder = reserved
            .rsplit_once('.')
            .filter(|(_, id)| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
            .map(|(final_name, _)| dir.join(final_name));

        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial file");
                continue;
            }
        }

        if let Some(placeholder) = placeholder {
            let empty = tokio::fs::metadata(&placeholder)
                .await
                .is_ok_and(|meta| meta.is_file() && meta.len() == 0);
            if empty {
                if let Err(e) = tokio::fs::remove_file(&placeholder).await {
                    tracing::warn!(path = %placeholder.display(), error = %e, "Failed to remove placeholder");
                }
            }
        }
    }
    removed
}
