// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use url::Url;

use crate::error::FeedError;

const UNTITLED_EPISODE: &str = "Untitled Episode";

/// A parsed feed, normalized across RSS and Atom
#[derive(Debug, Clone)]
pub struct FeedDocument {
    pub title: String,
    pub description: Option<String>,
    pub artwork_url: Option<Url>,
    pub feed_url: Url,
    /// Entries in document order (usually newest first)
    pub entries: Vec<RawEntry>,
}

/// A single feed entry before reconciliation
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub guid: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub enclosure: Option<Enclosure>,
    pub published_at: Option<DateTime<FixedOffset>>,
    pub artwork_url: Option<Url>,
    pub episode_number: Option<u32>,
    pub duration: Option<String>,
}

/// Represents the media file attached to an entry
#[derive(Debug, Clone)]
pub struct Enclosure {
    pub url: Url,
    pub length: Option<u64>,
    pub mime_type: Option<String>,
}

/// Parse feed bytes as RSS 2.0, falling back to Atom
pub fn parse_feed(bytes: &[u8], feed_url: Url) -> Result<FeedDocument, FeedError> {
    let rss_error = match rss::Channel::read_from(bytes) {
        Ok(channel) => return Ok(from_channel(&channel, feed_url)),
        Err(e) => e,
    };

    match atom_syndication::Feed::read_from(bytes) {
        Ok(feed) => Ok(from_atom(&feed, feed_url)),
        Err(atom_error) => Err(FeedError::Malformed {
            rss: rss_error,
            atom: atom_error,
        }),
    }
}

/// Resolve a possibly relative link against the feed's own URL
fn resolve(feed_url: &Url, raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    feed_url.join(raw).ok()
}

fn from_channel(channel: &rss::Channel, feed_url: Url) -> FeedDocument {
    let artwork_url = channel
        .image()
        .and_then(|img| resolve(&feed_url, img.url()))
        .or_else(|| {
            channel
                .itunes_ext()
                .and_then(|ext| ext.image())
                .and_then(|url| resolve(&feed_url, url))
        });
    let entries = channel
        .items()
        .iter()
        .map(|item| entry_from_item(item, &feed_url))
        .collect();

    FeedDocument {
        title: decode_title(channel.title()),
        description: non_empty(channel.description()),
        artwork_url,
        feed_url,
        entries,
    }
}

fn entry_from_item(item: &rss::Item, feed_url: &Url) -> RawEntry {
    let title = item
        .title()
        .map(decode_title)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNTITLED_EPISODE.to_string());

    let enclosure = item.enclosure().and_then(|enclosure| {
        let url = resolve(feed_url, enclosure.url())?;
        Some(Enclosure {
            url,
            length: enclosure.length().trim().parse().ok().filter(|len| *len > 0),
            mime_type: non_empty(enclosure.mime_type()),
        })
    });

    let itunes = item.itunes_ext();

    RawEntry {
        guid: item.guid().and_then(|g| non_empty(g.value())),
        title,
        description: item.description().and_then(non_empty),
        enclosure,
        published_at: item.pub_date().and_then(parse_date),
        artwork_url: itunes
            .and_then(|ext| ext.image())
            .and_then(|url| resolve(feed_url, url)),
        episode_number: itunes.and_then(|ext| ext.episode().and_then(|e| e.trim().parse().ok())),
        duration: itunes.and_then(|ext| ext.duration().and_then(non_empty)),
    }
}

fn from_atom(feed: &atom_syndication::Feed, feed_url: Url) -> FeedDocument {
    let artwork_url = feed
        .logo()
        .or_else(|| feed.icon())
        .and_then(|url| resolve(&feed_url, url));

    let entries = feed
        .entries()
        .iter()
        .map(|entry| {
            let enclosure = entry
                .links()
                .iter()
                .find(|link| link.rel() == "enclosure")
                .and_then(|link| {
                    let url = resolve(&feed_url, link.href())?;
                    Some(Enclosure {
                        url,
                        length: link.length().and_then(|l| l.parse().ok()),
                        mime_type: link.mime_type().and_then(non_empty),
                    })
                });

            let description = entry
                .summary()
                .map(|s| s.as_str().to_string())
                .or_else(|| entry.content().and_then(|c| c.value().map(String::from)))
                .filter(|s| !s.trim().is_empty());

            let title = decode_title(entry.title().as_str());

            RawEntry {
                guid: non_empty(entry.id()),
                title: if title.is_empty() {
                    UNTITLED_EPISODE.to_string()
                } else {
                    title
                },
                description,
                enclosure,
                published_at: Some(entry.published().copied().unwrap_or(*entry.updated())),
                artwork_url: None,
                episode_number: None,
                duration: None,
            }
        })
        .collect();

    FeedDocument {
        title: decode_title(feed.title().as_str()),
        description: feed.subtitle().map(|s| s.as_str()).and_then(non_empty),
        artwork_url,
        feed_url,
        entries,
    }
}

fn decode_title(raw: &str) -> String {
    html_escape::decode_html_entities(raw.trim()).into_owned()
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Parse an RSS date: RFC 2822 first, then common deviations seen in the wild
fn parse_date(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt);
    }

    let with_offset = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%a, %d %b %Y %H:%M %z",
        "%d %b %Y %H:%M:%S %z",
        "%Y-%m-%d %H:%M:%S %z",
    ];
    for format in with_offset {
        if let Ok(dt) = DateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }

    // Offset-less timestamps are taken as UTC
    let naive = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
    naive.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(raw, format)
            .ok()
            .map(|dt| dt.and_utc().fixed_offset())
    })
}
