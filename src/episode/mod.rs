// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod download;
mod filename;

pub use download::{
    DownloadRequest, DownloadedFile, PARTIAL_SUFFIX, download_episode, partial_path,
};
pub use filename::{
    FilenameOptions, artwork_filename, disambiguated_filename, generate_filename,
    generate_filename_stem, get_media_extension, storage_dir_name,
};
