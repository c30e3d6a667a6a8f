// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::OpenOptions;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::{DownloadOutcome, Job, Shared};
use crate::episode::{
    DownloadRequest, FilenameOptions, artwork_filename, disambiguated_filename, download_episode,
    generate_filename, partial_path,
};
use crate::error::DownloadError;
use crate::model::{DownloadStatus, Episode};
use crate::progress::ProgressEvent;
use crate::retry::with_retry_until;
use crate::store::Transition;

/// Worker loop: take jobs until the channel closes or shutdown is requested
pub(super) async fn run(
    worker_id: usize,
    shared: Arc<Shared>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    shutdown: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };

        tracing::debug!(worker_id, episode_id = %job.episode_id, "Worker picked up job");
        let outcome = if job.cancel.is_cancelled() {
            DownloadOutcome::Cancelled
        } else {
            execute(&shared, &job).await
        };

        if outcome == DownloadOutcome::Cancelled {
            shared.reporter.report(ProgressEvent::DownloadCancelled {
                episode_id: job.episode_id,
            });
        }

        shared.finish(job.episode_id, job.seq);
        // The caller may have dropped its handle
        let _ = job.done.send(outcome);
    }
    tracing::debug!(worker_id, "Worker stopped");
}

/// Run one job from `Queued` to a final state
///
/// Store writes only happen while the episode is still in the status this
/// job put it in; anything else means the job was cancelled by a deletion.
async fn execute(shared: &Shared, job: &Job) -> DownloadOutcome {
    let store = &shared.store;

    let episode = match store
        .transition(
            job.episode_id,
            &[DownloadStatus::Queued],
            DownloadStatus::Downloading,
        )
        .await
    {
        Ok(Transition::Applied(episode)) => episode,
        Ok(_) => {
            tracing::debug!(episode_id = %job.episode_id, "Episode no longer queued, skipping");
            return DownloadOutcome::Cancelled;
        }
        Err(e) => {
            tracing::error!(episode_id = %job.episode_id, error = %e, "Failed to start download");
            return DownloadOutcome::Failed {
                reason: e.to_string(),
            };
        }
    };

    let subscription = match store.subscription(episode.subscription_id).await {
        Ok(Some(subscription)) => subscription,
        Ok(None) => return DownloadOutcome::Cancelled,
        Err(e) => return fail(shared, &episode, &[], e.to_string()).await,
    };

    let settings = shared.settings.snapshot().with_override(&subscription.policy);
    let options = settings.filename_options();
    let dir = shared.config.library_dir.join(&subscription.storage_dir);

    // A deletion may have landed since the job started
    if job.cancel.is_cancelled() {
        return DownloadOutcome::Cancelled;
    }
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        let reason = format!("Failed to create directory {}: {e}", dir.display());
        return fail(shared, &episode, &[], reason).await;
    }

    let final_path = match reserve_final_path(&dir, &episode, &options).await {
        Ok(path) => path,
        Err(e) => {
            let reason = format!("Failed to create a file in {}: {e}", dir.display());
            return fail(shared, &episode, &[], reason).await;
        }
    };
    let partial = partial_path(&final_path, episode.id);
    let leftovers = [partial.as_path(), final_path.as_path()];

    let request = DownloadRequest {
        episode_id: episode.id,
        episode_title: &episode.title,
        url: &episode.enclosure_url,
        output_path: &partial,
        chunk_timeout: shared.config.chunk_timeout,
        cancel: &job.cancel,
    };

    let client = shared.client.as_ref();
    let reporter = &shared.reporter;
    let request = &request;
    let result = with_retry_until(&shared.config.retry, &job.cancel, move || {
        download_episode(client, request, reporter)
    })
    .await;

    let file = match result {
        Ok(file) => file,
        Err(e) if job.cancel.is_cancelled() || matches!(e, DownloadError::Cancelled { .. }) => {
            return abandon(shared, &episode, &dir, &leftovers).await;
        }
        Err(e) => return fail(shared, &episode, &leftovers, e.to_string()).await,
    };

    // Last check before the file becomes visible
    let still_downloading = matches!(
        store.episode(episode.id).await,
        Ok(Some(ref current)) if current.status == DownloadStatus::Downloading
    );
    if job.cancel.is_cancelled() || !still_downloading {
        return abandon(shared, &episode, &dir, &leftovers).await;
    }

    // Replaces the placeholder that reserved the name
    if let Err(e) = tokio::fs::rename(&partial, &final_path).await {
        let error = DownloadError::RenameFailed {
            from: partial.clone(),
            source: e,
        };
        return fail(shared, &episode, &leftovers, error.to_string()).await;
    }

    match store
        .complete_download(episode.id, final_path.clone(), file.content_hash.clone())
        .await
    {
        Ok(Transition::Applied(_)) => {}
        Ok(_) => {
            // Deleted while the file was being moved into place
            return abandon(shared, &episode, &dir, &[final_path.as_path()]).await;
        }
        Err(e) => {
            remove_quietly(&final_path).await;
            return fail(shared, &episode, &[], e.to_string()).await;
        }
    }

    if settings.download_episode_images {
        fetch_artwork(shared, &episode, &final_path).await;
    }

    tracing::info!(
        episode_id = %episode.id,
        path = %final_path.display(),
        bytes = file.bytes,
        "Episode downloaded"
    );
    shared.reporter.report(ProgressEvent::DownloadCompleted {
        episode_id: episode.id,
        episode_title: episode.title.clone(),
        bytes_downloaded: file.bytes,
        hash: file.content_hash,
    });

    DownloadOutcome::Downloaded { path: final_path }
}

/// Claim a file name for the episode by creating an empty placeholder
///
/// An existing file keeps its name and this episode gets `-<episode id>`,
/// then `-<episode id>-2` and so on. Creation fails on a taken name, so no
/// two jobs ever own the same path.
async fn reserve_final_path(
    dir: &Path,
    episode: &Episode,
    options: &FilenameOptions,
) -> std::io::Result<PathBuf> {
    let mut candidate = dir.join(generate_filename(episode, options));
    for attempt in 1..=MAX_NAME_ATTEMPTS {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                candidate = dir.join(disambiguated_filename(episode, options, attempt));
            }
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free file name for episode {}", episode.id),
    ))
}

const MAX_NAME_ATTEMPTS: u32 = 100;

/// Record a failure, unless the episode was deleted meanwhile
async fn fail(
    shared: &Shared,
    episode: &Episode,
    leftovers: &[&Path],
    reason: String,
) -> DownloadOutcome {
    for path in leftovers {
        remove_quietly(path).await;
    }

    match shared
        .store
        .transition(
            episode.id,
            &[DownloadStatus::Downloading],
            DownloadStatus::Failed,
        )
        .await
    {
        Ok(Transition::Applied(_)) => {}
        Ok(_) => return DownloadOutcome::Cancelled,
        Err(e) => {
            tracing::error!(episode_id = %episode.id, error = %e, "Failed to record download failure");
        }
    }

    tracing::warn!(episode_id = %episode.id, url = %episode.enclosure_url, error = %reason, "Download failed");
    shared.reporter.report(ProgressEvent::DownloadFailed {
        episode_id: episode.id,
        episode_title: episode.title.clone(),
        error: reason.clone(),
    });
    DownloadOutcome::Failed { reason }
}

/// Remove the files a cancelled job created
///
/// The subscription directory goes too when the subscription was deleted
/// meanwhile and nothing else is left in it.
async fn abandon(
    shared: &Shared,
    episode: &Episode,
    dir: &Path,
    leftovers: &[&Path],
) -> DownloadOutcome {
    for path in leftovers {
        remove_quietly(path).await;
    }
    if matches!(shared.store.subscription(episode.subscription_id).await, Ok(None)) {
        // Fails harmlessly while other files remain
        let _ = tokio::fs::remove_dir(dir).await;
    }
    DownloadOutcome::Cancelled
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}

/// Best-effort artwork download next to the media file
async fn fetch_artwork(shared: &Shared, episode: &Episode, media_path: &Path) {
    let Some(url) = episode.artwork_url.as_deref() else {
        return;
    };
    let Some(media_name) = media_path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let artwork_path = media_path.with_file_name(artwork_filename(media_name, url));

    let response = match shared.client.get_bytes(url).await {
        Ok(response) if (200..300).contains(&response.status) => response,
        Ok(response) => {
            tracing::warn!(url, status = response.status, "Artwork download failed");
            return;
        }
        Err(e) => {
            tracing::warn!(url, error = %e, "Artwork download failed");
            return;
        }
    };

    if let Err(e) = tokio::fs::write(&artwork_path, &response.body).await {
        tracing::warn!(path = %artwork_path.display(), error = %e, "Failed to write artwork");
        return;
    }

    match shared
        .store
        .set_local_artwork(episode.id, Some(artwork_path.clone()))
        .await
    {
        Ok(Some(updated)) if updated.status == DownloadStatus::Downloaded => {}
        Ok(_) => remove_quietly(&artwork_path).await,
        Err(e) => {
            tracing::warn!(episode_id = %episode.id, error = %e, "Failed to record artwork");
            remove_quietly(&artwork_path).await;
        }
    }
}
