// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use url::Url;

use crate::model::Episode;

/// Maximum length for the title portion of a filename
const MAX_TITLE_LENGTH: usize = 100;

const DEFAULT_MEDIA_EXTENSION: &str = "mp3";
const DEFAULT_ARTWORK_EXTENSION: &str = "jpg";

/// Filename decoration switches, taken from the effective settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilenameOptions {
    /// Prefix the publish date (`YYYY-MM-DD`, or `undated`)
    pub append_date: bool,
    /// Prefix the zero-padded episode number
    pub append_episode_number: bool,
}

/// Check if a character is allowed in filenames (whitelist approach)
fn is_valid_filename_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ')
}

/// Generate a filename stem (without extension) for an episode
///
/// Format: `[YYYY-MM-DD-][NNN-]sanitized-title`. A title that sanitizes to
/// nothing becomes `episode-<id>`.
pub fn generate_filename_stem(episode: &Episode, options: &FilenameOptions) -> String {
    let mut parts = Vec::with_capacity(3);

    if options.append_date {
        parts.push(
            episode
                .published_at
                .map(|dt| dt.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "undated".to_string()),
        );
    }

    if options.append_episode_number
        && let Some(number) = episode.episode_number
    {
        parts.push(format!("{number:03}"));
    }

    let title = sanitize_title(&episode.title);
    parts.push(if title.is_empty() {
        format!("episode-{}", episode.id)
    } else {
        title
    });

    parts.join("-")
}

/// Get the media file extension from an episode's enclosure
///
/// Attempts to extract from URL path or MIME type, defaults to "mp3"
pub fn get_media_extension(episode: &Episode) -> String {
    if let Some(ext) = url_extension(&episode.enclosure_url).filter(|ext| is_media_extension(ext)) {
        return ext;
    }

    if let Some(ext) = episode
        .enclosure_type
        .as_deref()
        .and_then(mime_to_extension)
    {
        return ext.to_string();
    }

    DEFAULT_MEDIA_EXTENSION.to_string()
}

/// Generate a complete filename for an episode (with extension)
pub fn generate_filename(episode: &Episode, options: &FilenameOptions) -> String {
    format!(
        "{}.{}",
        generate_filename_stem(episode, options),
        get_media_extension(episode)
    )
}

/// Filename used when [`generate_filename`] is already taken by another file
///
/// The first alternative appends the episode id; later ones add a counter.
pub fn disambiguated_filename(
    episode: &Episode,
    options: &FilenameOptions,
    attempt: u32,
) -> String {
    let stem = generate_filename_stem(episode, options);
    let ext = get_media_extension(episode);
    if attempt <= 1 {
        format!("{stem}-{}.{ext}", episode.id)
    } else {
        format!("{stem}-{}-{attempt}.{ext}", episode.id)
    }
}

/// Artwork file stored next to a media file, sharing its stem
pub fn artwork_filename(media_filename: &str, artwork_url: &str) -> String {
    let stem = media_filename
        .rsplit_once('.')
        .map_or(media_filename, |(stem, _)| stem);
    let ext = url_extension(artwork_url)
        .filter(|ext| matches!(ext.as_str(), "jpg" | "jpeg" | "png" | "webp" | "gif"))
        .unwrap_or_else(|| DEFAULT_ARTWORK_EXTENSION.to_string());
    format!("{stem}.{ext}")
}

/// Directory name for a subscription's downloads, derived from its title
pub fn storage_dir_name(title: &str) -> String {
    let name = sanitize_filename::sanitize(title.trim());
    let name = name.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if name.is_empty() {
        "podcast".to_string()
    } else {
        truncate_at_boundary(name, MAX_TITLE_LENGTH)
    }
}

fn url_extension(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let filename = url.path_segments()?.next_back()?;
    let (_, ext) = filename.rsplit_once('.')?;
    Some(ext.to_lowercase())
}

/// Sanitize a title for use in a filename using whitelist approach
fn sanitize_title(title: &str) -> String {
    let sanitized: String = title
        .chars()
        .map(|c| if is_valid_filename_char(c) { c } else { '-' })
        .collect();

    let collapsed = collapse_separators(&sanitized);

    // Leading dots would hide the file
    let trimmed =
        collapsed.trim_matches(|c: char| c == '-' || c == '.' || c.is_whitespace());

    truncate_at_boundary(trimmed, MAX_TITLE_LENGTH)
}

/// Collapse multiple spaces and dashes into single dashes
fn collapse_separators(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut last_was_separator = false;

    for c in s.chars() {
        if c == '-' || c.is_whitespace() {
            if !last_was_separator {
                result.push('-');
                last_was_separator = true;
            }
        } else {
            result.push(c);
            last_was_separator = false;
        }
    }

    result
}

/// Truncate string at a word boundary
fn truncate_at_boundary(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }

    let truncated: String = s.chars().take(max_len).collect();
    if let Some(pos) = truncated.rfind('-')
        && pos > max_len / 2
    {
        return truncated[..pos].to_string();
    }

    truncated.trim_end_matches('-').to_string()
}

fn is_media_extension(ext: &str) -> bool {
    matches!(
        ext,
        "mp3" | "m4a" | "m4b" | "mp4" | "m4v" | "mov" | "aac" | "ogg" | "opus" | "wav" | "flac"
            | "webm"
    )
}

/// Map MIME types to file extensions
fn mime_to_extension(mime: &str) -> Option<&'static str> {
    match mime.to_lowercase().as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "audio/aac" => Some("aac"),
        "audio/ogg" => Some("ogg"),
        "audio/opus" => Some("opus"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        "video/mp4" => Some("mp4"),
        "video/x-m4v" => Some("m4v"),
        "video/quicktime" => Some("mov"),
        "video/webm" => Some("webm"),
        _ => None,
    }
}
