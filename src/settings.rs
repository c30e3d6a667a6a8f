// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::episode::FilenameOptions;

/// Process-wide download policy settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Queue every newly discovered episode for download
    pub auto_download: bool,
    /// Download the newest episodes when a subscription is refreshed for the first time
    pub download_on_add: bool,
    /// How many of the newest episodes the first refresh downloads
    pub initial_download_count: usize,
    pub append_date_to_filename: bool,
    pub append_episode_number_to_filename: bool,
    /// Store episode artwork next to the downloaded media file
    pub download_episode_images: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_download: false,
            download_on_add: true,
            initial_download_count: 5,
            append_date_to_filename: false,
            append_episode_number_to_filename: false,
            download_episode_images: false,
        }
    }
}

impl Settings {
    pub fn filename_options(&self) -> FilenameOptions {
        FilenameOptions {
            append_date: self.append_date_to_filename,
            append_episode_number: self.append_episode_number_to_filename,
        }
    }

    /// Apply a subscription's overrides on top of these settings
    pub fn with_override(&self, policy: &PolicyOverride) -> Settings {
        Settings {
            auto_download: policy.auto_download.unwrap_or(self.auto_download),
            initial_download_count: policy
                .initial_download_count
                .unwrap_or(self.initial_download_count),
            append_date_to_filename: policy
                .append_date_to_filename
                .unwrap_or(self.append_date_to_filename),
            append_episode_number_to_filename: policy
                .append_episode_number_to_filename
                .unwrap_or(self.append_episode_number_to_filename),
            ..self.clone()
        }
    }
}

/// Per-subscription overrides of the global [`Settings`]; `None` inherits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_download: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_download_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub append_date_to_filename: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub append_episode_number_to_filename: Option<bool>,
}

/// Shared, mutable handle to the current settings
///
/// Readers take a snapshot at decision time, so updates only affect
/// decisions made afterwards.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    tx: Arc<watch::Sender<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        let (tx, _rx) = watch::channel(settings);
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> Settings {
        self.tx.borrow().clone()
    }

    pub fn update(&self, modify: impl FnOnce(&mut Settings)) {
        self.tx.send_modify(modify);
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}
