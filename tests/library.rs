// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests through the real HTTP client against a local mock server.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use podkeep::{
    Config, DownloadStatus, EpisodeFilter, FileStore, Library, NoopReporter, PipelineError,
    RefreshOutcome, ReqwestClient, RetryConfig, Settings,
};

const MEDIA: &[u8] = b"ID3 pretend this is an mp3";

fn feed_xml(server: &MockServer, title: &str, count: usize) -> String {
    let items: String = (1..=count)
        .rev()
        .map(|n| {
            format!(
                r#"<item>
  <title>{title} #{n}</title>
  <guid>{title}-{n}</guid>
  <pubDate>{n:02} Jan 2024 10:00:00 +0000</pubDate>
  <enclosure url="{uri}/media/ep{n}.mp3" length="{len}" type="audio/mpeg"/>
</item>
"#,
                uri = server.uri(),
                len = MEDIA.len(),
            )
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel>
<title>{title}</title>
<link>https://example.com</link>
<description>Integration feed</description>
{items}</channel></rss>"#
    )
}

async fn serve_feed(server: &MockServer, title: &str, count: usize, delay: Option<Duration>) {
    let mut response = ResponseTemplate::new(200)
        .insert_header("content-type", "application/rss+xml")
        .set_body_string(feed_xml(server, title, count));
    if let Some(delay) = delay {
        response = response.set_delay(delay);
    }
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn serve_media(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/media/ep\d+\.mp3$"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "audio/mpeg")
                .set_body_bytes(MEDIA),
        )
        .mount(server)
        .await;
}

async fn feed_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/feed.xml")
        .count()
}

fn config(dir: &Path, settings: Settings) -> Config {
    Config {
        library_dir: dir.to_path_buf(),
        retry: RetryConfig {
            max_attempts: 1,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
            jitter: false,
        },
        settings,
        ..Default::default()
    }
}

async fn open_library(config: &Config) -> Library {
    let store = FileStore::open(config.state_file()).await.unwrap();
    let client = ReqwestClient::from_config(&config.http).unwrap();
    Library::open(config, Arc::new(store), client.shared(), NoopReporter::shared())
        .await
        .unwrap()
}

fn feed_url(server: &MockServer) -> String {
    format!("{}/feed.xml", server.uri())
}

#[tokio::test]
async fn subscribing_downloads_the_newest_episodes() {
    let server = MockServer::start().await;
    serve_feed(&server, "Integration", 10, None).await;
    serve_media(&server).await;

    let dir = TempDir::new().unwrap();
    let config = config(
        dir.path(),
        Settings {
            initial_download_count: 3,
            ..Default::default()
        },
    );
    let library = open_library(&config).await;

    let added = library.add_subscription(&feed_url(&server)).await.unwrap();
    let refresh = added.refresh.wait().await;
    library.wait_idle().await;

    let RefreshOutcome::Refreshed(summary) = refresh.outcome else {
        panic!("refresh failed: {refresh:?}");
    };
    assert_eq!(summary.new_episodes, 10);
    assert_eq!(summary.queued, 3);

    let downloaded = library
        .list_episodes(added.subscription.id, &EpisodeFilter::downloaded_only())
        .await
        .unwrap();
    let titles: Vec<_> = downloaded.iter().map(|e| e.title.as_str()).collect();
    assert_eq!(
        titles,
        vec!["Integration #10", "Integration #9", "Integration #8"]
    );

    for episode in &downloaded {
        let path = episode.local_path.as_ref().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), MEDIA);
        assert!(episode.content_hash.as_ref().unwrap().starts_with("sha256:"));
    }

    library.shutdown().await;
}

#[tokio::test]
async fn duplicate_feed_url_creates_no_record() {
    let server = MockServer::start().await;
    serve_feed(&server, "Once", 1, None).await;
    serve_media(&server).await;

    let dir = TempDir::new().unwrap();
    let library = open_library(&config(dir.path(), Settings::default())).await;

    library.add_subscription(&feed_url(&server)).await.unwrap();
    let err = library
        .add_subscription(&format!("  {}  ", feed_url(&server)))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::DuplicateSubscription { .. }));
    let subscriptions = library
        .list_subscriptions(Default::default(), Default::default())
        .await
        .unwrap();
    assert_eq!(subscriptions.len(), 1);

    library.wait_idle().await;
    library.shutdown().await;
}

#[tokio::test]
async fn failing_feed_does_not_affect_others() {
    let broken = MockServer::start().await;
    serve_feed(&broken, "Broken", 1, None).await;
    let healthy = MockServer::start().await;
    serve_feed(&healthy, "Healthy", 2, None).await;
    serve_media(&healthy).await;

    let dir = TempDir::new().unwrap();
    let library = open_library(&config(
        dir.path(),
        Settings {
            download_on_add: false,
            auto_download: true,
            ..Default::default()
        },
    ))
    .await;

    let broken_sub = library.add_subscription(&feed_url(&broken)).await.unwrap();
    broken_sub.refresh.wait().await;
    let healthy_sub = library.add_subscription(&feed_url(&healthy)).await.unwrap();
    healthy_sub.refresh.wait().await;
    library.wait_idle().await;

    // The broken feed starts failing, the healthy one publishes more
    broken.reset().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&broken)
        .await;
    healthy.reset().await;
    serve_feed(&healthy, "Healthy", 4, None).await;
    serve_media(&healthy).await;

    let results = library.refresh_all().await.unwrap();
    library.wait_idle().await;

    let outcome = |id: podkeep::SubscriptionId| {
        results
            .iter()
            .find(|r| r.subscription_id == id)
            .map(|r| r.outcome.clone())
            .unwrap()
    };
    assert!(matches!(
        outcome(broken_sub.subscription.id),
        RefreshOutcome::Failed(_)
    ));
    let RefreshOutcome::Refreshed(summary) = outcome(healthy_sub.subscription.id) else {
        panic!("healthy feed failed");
    };
    assert_eq!(summary.new_episodes, 2);
    assert_eq!(summary.queued, 2);

    let downloaded = library
        .list_episodes(healthy_sub.subscription.id, &EpisodeFilter::downloaded_only())
        .await
        .unwrap();
    assert_eq!(downloaded.len(), 4);

    // Episodes of the failed subscription are untouched
    let broken_episodes = library
        .list_episodes(broken_sub.subscription.id, &EpisodeFilter::default())
        .await
        .unwrap();
    assert_eq!(broken_episodes.len(), 1);

    library.shutdown().await;
}

#[tokio::test]
async fn concurrent_refresh_requests_fetch_once() {
    let server = MockServer::start().await;
    serve_feed(&server, "Slow", 2, Some(Duration::from_millis(200))).await;

    let dir = TempDir::new().unwrap();
    let library = open_library(&config(
        dir.path(),
        Settings {
            download_on_add: false,
            ..Default::default()
        },
    ))
    .await;

    let added = library.add_subscription(&feed_url(&server)).await.unwrap();
    added.refresh.wait().await;
    let before = feed_requests(&server).await;

    let first = library.refresh_one(added.subscription.id);
    let second = library.refresh_one(added.subscription.id);
    let (a, b) = tokio::join!(first.wait(), second.wait());

    assert!(a.is_success());
    assert_eq!(a, b);
    assert_eq!(feed_requests(&server).await, before + 1);

    library.shutdown().await;
}

#[tokio::test]
async fn deleted_file_state_survives_restart() {
    let server = MockServer::start().await;
    serve_feed(&server, "Persisted", 2, None).await;
    serve_media(&server).await;

    let dir = TempDir::new().unwrap();
    let config = config(
        dir.path(),
        Settings {
            initial_download_count: 1,
            ..Default::default()
        },
    );

    let library = open_library(&config).await;
    let added = library.add_subscription(&feed_url(&server)).await.unwrap();
    added.refresh.wait().await;
    library.wait_idle().await;

    let episode = library
        .list_episodes(added.subscription.id, &EpisodeFilter::downloaded_only())
        .await
        .unwrap()
        .remove(0);
    let file = episode.local_path.clone().unwrap();
    assert!(file.exists());

    library.delete_downloaded_file(episode.id).await.unwrap();
    library.shutdown().await;
    drop(library);
    assert!(!file.exists());

    let reopened = open_library(&config).await;
    let restored = reopened.episode(episode.id).await.unwrap();
    assert_eq!(restored.status, DownloadStatus::NotDownloaded);
    assert!(restored.local_path.is_none());
    assert_eq!(restored.title, episode.title);
    assert_eq!(restored.published_at, episode.published_at);

    reopened.shutdown().await;
}
