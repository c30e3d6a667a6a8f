// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashSet;

use chrono::Utc;

use crate::error::StoreError;
use crate::feed::{FeedDocument, RawEntry};
use crate::model::{Episode, EpisodeFilter, NewEpisode, SubscriptionId};
use crate::store::Repository;

/// What a reconciliation changed
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// Newly inserted episodes, in feed order
    pub inserted: Vec<Episode>,
    /// Entries already known to the store
    pub existing: usize,
    /// Entries that could not become episodes
    pub rejected: usize,
}

/// Stable identifier of an entry: its GUID, or the enclosure URL without one
pub fn external_id(entry: &RawEntry) -> Option<String> {
    entry
        .guid
        .as_deref()
        .map(str::trim)
        .filter(|guid| !guid.is_empty())
        .map(String::from)
        .or_else(|| entry.enclosure.as_ref().map(|e| e.url.to_string()))
}

/// Insert every entry of `document` not yet stored for `subscription_id`
///
/// Running this twice against the same document inserts nothing the second
/// time. Entries without an enclosure are counted as rejected. New entries
/// without an explicit episode number are numbered after the episodes
/// already stored, oldest first, so feeds that only keep their latest items
/// keep counting up. All new episodes are stored in one batch.
pub async fn reconcile<R: Repository + ?Sized>(
    store: &R,
    subscription_id: SubscriptionId,
    document: &FeedDocument,
) -> Result<ReconcileOutcome, StoreError> {
    let mut outcome = ReconcileOutcome::default();

    let known: HashSet<String> = store
        .episodes(subscription_id, &EpisodeFilter::default())
        .await?
        .into_iter()
        .map(|episode| episode.external_id)
        .collect();
    let mut position = known.len();
    let mut seen = HashSet::new();

    // Feeds list newest first; walk oldest first to hand out positions
    let mut batch = Vec::new();
    for entry in document.entries.iter().rev() {
        let (Some(external_id), Some(enclosure)) = (external_id(entry), entry.enclosure.as_ref())
        else {
            tracing::debug!(
                subscription_id = %subscription_id,
                title = %entry.title,
                "Rejecting feed entry without enclosure"
            );
            outcome.rejected += 1;
            continue;
        };

        if known.contains(&external_id) || !seen.insert(external_id.clone()) {
            outcome.existing += 1;
            continue;
        }
        position += 1;

        batch.push(NewEpisode {
            subscription_id,
            external_id,
            title: entry.title.clone(),
            description: entry.description.clone(),
            published_at: entry.published_at.map(|dt| dt.with_timezone(&Utc)),
            enclosure_url: enclosure.url.to_string(),
            enclosure_type: enclosure.mime_type.clone(),
            enclosure_length: enclosure.length,
            episode_number: entry
                .episode_number
                .or_else(|| u32::try_from(position).ok()),
            duration: entry.duration.clone(),
            artwork_url: entry.artwork_url.as_ref().map(|url| url.to_string()),
        });
    }
    batch.reverse();

    if !batch.is_empty() {
        for inserted in store.insert_episodes(batch).await? {
            match inserted {
                Some(episode) => outcome.inserted.push(episode),
                None => outcome.existing += 1,
            }
        }
    }

    tracing::debug!(
        subscription_id = %subscription_id,
        inserted = outcome.inserted.len(),
        existing = outcome.existing,
        rejected = outcome.rejected,
        "Reconciled feed"
    );
    Ok(outcome)
}
