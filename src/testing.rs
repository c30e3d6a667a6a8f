// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};

use crate::http::{ByteStream, HttpBody, HttpClient, HttpResponse};

#[derive(Clone)]
enum Body {
    Full(Bytes),
    /// Announces `declared` bytes but ends after the body
    Truncated { body: Bytes, declared: u64 },
    /// Yields `chunk` sized pieces, sleeping `delay` before each
    Slow {
        body: Bytes,
        chunk: usize,
        delay: Duration,
    },
}

#[derive(Clone)]
struct Route {
    status: u16,
    content_type: Option<String>,
    body: Body,
    /// Sleep before answering
    delay: Option<Duration>,
    /// Answer 503 this many times before serving the route
    failures_left: usize,
}

/// In-memory HTTP client with per-URL canned responses
///
/// Unknown URLs answer 404. Every request is counted per URL.
#[derive(Default)]
pub struct MockHttpClient {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, url: &str, route: Route) {
        self.routes.lock().unwrap().insert(url.to_string(), route);
    }

    pub fn add_response(&self, url: &str, status: u16, content_type: Option<&str>, body: &str) {
        self.insert(
            url,
            Route {
                status,
                content_type: content_type.map(String::from),
                body: Body::Full(Bytes::from(body.to_string())),
                delay: None,
                failures_left: 0,
            },
        );
    }

    pub fn add_feed(&self, url: &str, xml: String) {
        self.add_response(url, 200, Some("application/rss+xml"), &xml);
    }

    /// Serve a feed only after `delay`
    pub fn add_delayed_feed(&self, url: &str, xml: String, delay: Duration) {
        self.add_feed(url, xml);
        if let Some(route) = self.routes.lock().unwrap().get_mut(url) {
            route.delay = Some(delay);
        }
    }

    pub fn add_status(&self, url: &str, status: u16) {
        self.add_response(url, status, None, "");
    }

    pub fn add_media(&self, url: &str, body: Vec<u8>) {
        self.insert(
            url,
            Route {
                status: 200,
                content_type: Some("audio/mpeg".to_string()),
                body: Body::Full(Bytes::from(body)),
                delay: None,
                failures_left: 0,
            },
        );
    }

    pub fn add_truncated_media(&self, url: &str, body: Vec<u8>, declared: u64) {
        self.insert(
            url,
            Route {
                status: 200,
                content_type: Some("audio/mpeg".to_string()),
                body: Body::Truncated {
                    body: Bytes::from(body),
                    declared,
                },
                delay: None,
                failures_left: 0,
            },
        );
    }

    pub fn add_slow_media(&self, url: &str, body: Vec<u8>, chunk: usize, delay: Duration) {
        self.insert(
            url,
            Route {
                status: 200,
                content_type: Some("audio/mpeg".to_string()),
                body: Body::Slow {
                    body: Bytes::from(body),
                    chunk: chunk.max(1),
                    delay,
                },
                delay: None,
                failures_left: 0,
            },
        );
    }

    /// Make an existing route answer 503 `failures` times first
    pub fn fail_first(&self, url: &str, failures: usize) {
        if let Some(route) = self.routes.lock().unwrap().get_mut(url) {
            route.failures_left = failures;
        }
    }

    /// Register media for every episode produced by [`rss_feed`]
    pub fn serve_episodes(&self, show: &str, count: usize) {
        for number in 1..=count {
            self.add_media(
                &episode_url(show, number),
                format!("audio for {show} episode {number}").into_bytes(),
            );
        }
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    /// Record the call and resolve the route, consuming one scripted failure
    async fn route(&self, url: &str) -> Option<Route> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default() += 1;

        let route = {
            let mut routes = self.routes.lock().unwrap();
            let route = routes.get_mut(url)?;
            if route.failures_left > 0 {
                route.failures_left -= 1;
                let mut failing = route.clone();
                failing.status = 503;
                failing.body = Body::Full(Bytes::new());
                failing
            } else {
                route.clone()
            }
        };

        if let Some(delay) = route.delay {
            tokio::time::sleep(delay).await;
        }
        Some(route)
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn get_bytes(&self, url: &str) -> Result<HttpBody, reqwest::Error> {
        let Some(route) = self.route(url).await else {
            return Ok(HttpBody {
                status: 404,
                content_type: None,
                body: Bytes::new(),
            });
        };

        let body = match route.body {
            Body::Full(body) | Body::Truncated { body, .. } | Body::Slow { body, .. } => body,
        };
        Ok(HttpBody {
            status: route.status,
            content_type: route.content_type,
            body,
        })
    }

    async fn get_stream(&self, url: &str) -> Result<HttpResponse, reqwest::Error> {
        let Some(route) = self.route(url).await else {
            return Ok(HttpResponse {
                status: 404,
                content_length: Some(0),
                body: Box::pin(futures::stream::empty::<Result<Bytes, reqwest::Error>>()),
            });
        };

        let (content_length, body): (u64, ByteStream) = match route.body {
            Body::Full(body) => {
                let len = body.len() as u64;
                let stream: ByteStream =
                    Box::pin(futures::stream::once(async move { Ok::<_, reqwest::Error>(body) }));
                (len, stream)
            }
            Body::Truncated { body, declared } => {
                let stream: ByteStream =
                    Box::pin(futures::stream::once(async move { Ok::<_, reqwest::Error>(body) }));
                (declared, stream)
            }
            Body::Slow { body, chunk, delay } => {
                let len = body.len() as u64;
                let pieces: Vec<Bytes> = body.chunks(chunk).map(Bytes::copy_from_slice).collect();
                let stream: ByteStream = Box::pin(futures::stream::unfold(
                    pieces.into_iter(),
                    move |mut rest| async move {
                        let piece = rest.next()?;
                        tokio::time::sleep(delay).await;
                        Some((Ok::<_, reqwest::Error>(piece), rest))
                    },
                ));
                (len, stream)
            }
        };

        Ok(HttpResponse {
            status: route.status,
            content_length: Some(content_length),
            body,
        })
    }
}

/// Enclosure URL of episode `number` of `show` in [`rss_feed`]
pub fn episode_url(show: &str, number: usize) -> String {
    format!(
        "https://cdn.example.com/{}/ep{number}.mp3",
        show.to_lowercase().replace(' ', "-")
    )
}

/// RSS document with `count` episodes, newest first, published one day apart
pub fn rss_feed(show: &str, count: usize) -> String {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    let items: String = (1..=count)
        .rev()
        .map(|number| {
            let published = base + chrono::Duration::days(number as i64);
            format!(
                r#"    <item>
      <title>{show} Episode {number}</title>
      <guid>{show}-guid-{number}</guid>
      <pubDate>{date}</pubDate>
      <enclosure url="{url}" length="1000" type="audio/mpeg"/>
    </item>
"#,
                date = published.to_rfc2822(),
                url = episode_url(show, number),
            )
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>{show}</title>
    <description>All about {show}</description>
    <link>https://example.com</link>
{items}  </channel>
</rss>"#
    )
}
