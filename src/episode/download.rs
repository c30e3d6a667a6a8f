// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;
use crate::http::HttpClient;
use crate::model::EpisodeId;
use crate::progress::{ProgressEvent, SharedProgressReporter};

/// One attempt at streaming an episode's enclosure to disk
#[derive(Debug, Clone)]
pub struct DownloadRequest<'a> {
    pub episode_id: EpisodeId,
    pub episode_title: &'a str,
    pub url: &'a str,
    /// Where the bytes go; truncated at the start of every attempt
    pub output_path: &'a Path,
    /// Maximum wait for the next chunk
    pub chunk_timeout: Duration,
    pub cancel: &'a CancellationToken,
}

/// A fully written file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub bytes: u64,
    /// `sha256:<hex>` digest of the content
    pub content_hash: String,
}

/// Stream an enclosure to `request.output_path`
///
/// The body is hashed while it is written. A body shorter than the announced
/// Content-Length is an error, as is a chunk taking longer than the chunk
/// timeout. Cancellation is observed between chunks.
pub async fn download_episode<C: HttpClient + ?Sized>(
    client: &C,
    request: &DownloadRequest<'_>,
    reporter: &SharedProgressReporter,
) -> Result<DownloadedFile, DownloadError> {
    let url = request.url;
    let cancelled = || DownloadError::Cancelled {
        url: url.to_string(),
    };

    let response = tokio::select! {
        _ = request.cancel.cancelled() => return Err(cancelled()),
        response = client.get_stream(url) => response.map_err(|e| DownloadError::HttpFailed {
            url: url.to_string(),
            source: e,
        })?,
    };

    if !(200..300).contains(&response.status) {
        return Err(DownloadError::HttpStatus {
            url: url.to_string(),
            status: response.status,
        });
    }

    reporter.report(ProgressEvent::DownloadStarting {
        episode_id: request.episode_id,
        episode_title: request.episode_title.to_string(),
        content_length: response.content_length,
    });

    let output_path = request.output_path;
    let mut file =
        File::create(output_path)
            .await
            .map_err(|e| DownloadError::FileCreateFailed {
                path: output_path.to_path_buf(),
                source: e,
            })?;

    let mut hasher = Sha256::new();
    let mut bytes_downloaded: u64 = 0;
    let mut stream = response.body;

    loop {
        let next = tokio::select! {
            _ = request.cancel.cancelled() => return Err(cancelled()),
            next = tokio::time::timeout(request.chunk_timeout, stream.next()) => next,
        };

        let chunk = match next {
            Err(_) => {
                return Err(DownloadError::ChunkTimeout {
                    url: url.to_string(),
                    after: request.chunk_timeout,
                });
            }
            Ok(None) => break,
            Ok(Some(chunk)) => chunk.map_err(|e| DownloadError::StreamFailed {
                url: url.to_string(),
                source: e,
            })?,
        };

        file.write_all(&chunk)
            .await
            .map_err(|e| DownloadError::FileWriteFailed {
                path: output_path.to_path_buf(),
                source: e,
            })?;
        hasher.update(&chunk);
        bytes_downloaded += chunk.len() as u64;

        reporter.report(ProgressEvent::DownloadProgress {
            episode_id: request.episode_id,
            bytes_downloaded,
            total_bytes: response.content_length,
        });
    }

    file.flush()
        .await
        .map_err(|e| DownloadError::FileWriteFailed {
            path: output_path.to_path_buf(),
            source: e,
        })?;

    if let Some(expected) = response.content_length
        && bytes_downloaded < expected
    {
        return Err(DownloadError::Incomplete {
            url: url.to_string(),
            expected,
            received: bytes_downloaded,
        });
    }

    Ok(DownloadedFile {
        bytes: bytes_downloaded,
        content_hash: format!("sha256:{:x}", hasher.finalize()),
    })
}

/// Path of the in-progress file for `final_path`, private to one episode
pub fn partial_path(final_path: &Path, episode_id: EpisodeId) -> std::path::PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{episode_id}{PARTIAL_SUFFIX}"));
    final_path.with_file_name(name)
}

/// Suffix of files still being written
pub const PARTIAL_SUFFIX: &str = ".partial";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopReporter;
    use crate::testing::MockHttpClient;
    use tempfile::tempdir;

    const URL: &str = "https://example.com/episode.mp3";

    fn request<'a>(path: &'a Path, cancel: &'a CancellationToken) -> DownloadRequest<'a> {
        DownloadRequest {
            episode_id: EpisodeId(1),
            episode_title: "Test Episode",
            url: URL,
            output_path: path,
            chunk_timeout: Duration::from_secs(5),
            cancel,
        }
    }

    #[tokio::test]
    async fn download_writes_file_and_hash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("episode.mp3.partial");
        let client = MockHttpClient::new();
        client.add_media(URL, b"test audio content".to_vec());
        let cancel = CancellationToken::new();

        let file = download_episode(&client, &request(&path, &cancel), &NoopReporter::shared())
            .await
            .unwrap();

        assert_eq!(file.bytes, 18);
        assert_eq!(std::fs::read(&path).unwrap(), b"test audio content");
        assert_eq!(
            file.content_hash,
            format!("sha256:{:x}", Sha256::digest(b"test audio content"))
        );
    }

    #[tokio::test]
    async fn download_fails_on_http_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("episode.mp3.partial");
        let client = MockHttpClient::new();
        client.add_status(URL, 404);
        let cancel = CancellationToken::new();

        let result =
            download_episode(&client, &request(&path, &cancel), &NoopReporter::shared()).await;

        assert!(matches!(
            result,
            Err(DownloadError::HttpStatus { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn short_body_is_incomplete() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("episode.mp3.partial");
        let client = MockHttpClient::new();
        client.add_truncated_media(URL, b"half".to_vec(), 100);
        let cancel = CancellationToken::new();

        let result =
            download_episode(&client, &request(&path, &cancel), &NoopReporter::shared()).await;

        assert!(matches!(
            result,
            Err(DownloadError::Incomplete {
                expected: 100,
                received: 4,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn stalled_stream_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("episode.mp3.partial");
        let client = MockHttpClient::new();
        client.add_slow_media(URL, vec![1; 64], 8, Duration::from_millis(200));
        let cancel = CancellationToken::new();

        let mut req = request(&path, &cancel);
        req.chunk_timeout = Duration::from_millis(20);
        let result = download_episode(&client, &req, &NoopReporter::shared()).await;

        assert!(matches!(result, Err(DownloadError::ChunkTimeout { .. })));
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("episode.mp3.partial");
        let client = MockHttpClient::new();
        client.add_slow_media(URL, vec![1; 64], 8, Duration::from_millis(50));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let result =
            download_episode(&client, &request(&path, &cancel), &NoopReporter::shared()).await;
        assert!(matches!(result, Err(DownloadError::Cancelled { .. })));
    }

    #[test]
    fn partial_path_is_keyed_on_episode() {
        let final_path = Path::new("/lib/show/ep.mp3");
        assert_eq!(
            partial_path(final_path, EpisodeId(7)),
            Path::new("/lib/show/ep.mp3.7.partial")
        );
        assert_ne!(
            partial_path(final_path, EpisodeId(7)),
            partial_path(final_path, EpisodeId(8))
        );
    }
}
