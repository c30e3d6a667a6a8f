// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use url::Url;

use crate::error::FeedError;
use crate::http::HttpClient;

use super::parse::{FeedDocument, parse_feed};

/// Fetch and parse a feed from a URL
///
/// A single attempt; callers wrap this in [`crate::retry::with_retry`].
pub async fn fetch_feed<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
) -> Result<FeedDocument, FeedError> {
    let feed_url = Url::parse(url)?;

    tracing::debug!(url, "Fetching feed");
    let response = client
        .get_bytes(url)
        .await
        .map_err(|e| FeedError::FetchFailed {
            url: url.to_string(),
            source: e,
        })?;

    if !(200..300).contains(&response.status) {
        return Err(FeedError::HttpStatus {
            url: url.to_string(),
            status: response.status,
        });
    }

    if let Some(content_type) = response
        .content_type
        .as_deref()
        .filter(|ct| is_unsupported_content_type(ct))
    {
        return Err(FeedError::UnsupportedContentType {
            url: url.to_string(),
            content_type: content_type.to_string(),
        });
    }

    let document = parse_feed(&response.body, feed_url)?;
    tracing::debug!(
        url,
        title = %document.title,
        entries = document.entries.len(),
        "Parsed feed"
    );
    Ok(document)
}

/// Media types that can never hold a feed document
fn is_unsupported_content_type(content_type: &str) -> bool {
    matches!(content_type, "text/html" | "application/json")
        || content_type.starts_with("image/")
        || content_type.starts_with("audio/")
        || content_type.starts_with("video/")
}

/// Canonical form of a feed URL used as the subscription's natural key
///
/// Scheme and host are lowercased by the URL parser and the fragment is dropped.
pub fn normalize_feed_url(raw: &str) -> Result<String, FeedError> {
    let mut url = Url::parse(raw.trim())?;
    url.set_fragment(None);
    Ok(url.to_string())
}

/// Determine if a string is an HTTP(S) URL
pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}
