// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decides which newly discovered episodes get downloaded.

use crate::model::{Episode, EpisodeId, Subscription, newest_first};
use crate::settings::Settings;

/// Select the episodes to enqueue after a refresh
///
/// `settings` is the global snapshot; the subscription's override is applied
/// here. With auto-download on, every new episode is selected. Otherwise the
/// very first refresh of a subscription without downloads selects the
/// `initial_download_count` newest episodes.
pub fn decide(
    subscription: &Subscription,
    previously_downloaded: usize,
    new_episodes: &[Episode],
    settings: &Settings,
) -> Vec<EpisodeId> {
    let effective = settings.with_override(&subscription.policy);

    if effective.auto_download {
        return new_episodes.iter().map(|e| e.id).collect();
    }

    let first_refresh = subscription.last_refreshed_at.is_none() && previously_downloaded == 0;
    if !first_refresh || !effective.download_on_add || effective.initial_download_count == 0 {
        return Vec::new();
    }

    let mut ranked: Vec<&Episode> = new_episodes.iter().collect();
    ranked.sort_by(|a, b| newest_first(a, b));
    ranked
        .into_iter()
        .take(effective.initial_download_count)
        .map(|e| e.id)
        .collect()
}
