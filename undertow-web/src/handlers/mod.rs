//! HTTP request handlers organized by functionality

pub mod downloads;
pub mod stream;

// Re-export handler functions
pub use downloads::{
    AddDownloadRequest, DownloadsQuery, RemoveDownloadRequest, UpdateDownloadRequest, add_download,
    get_downloads, remove_download, update_download,
};
pub use stream::stream_file;

use undertow_core::InfoHash;

use crate::error::ApiError;

/// Parses the `{infohash}` path segment.
pub(crate) fn parse_infohash(value: &str) -> Result<InfoHash, ApiError> {
    InfoHash::from_hex(value).map_err(|_| ApiError::bad_request(format!("invalid infohash: {value}")))
}
