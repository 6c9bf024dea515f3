// Core data model shared by every engine component.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque identifier of a single download, unique within an engine.
pub type DownloadId = String;

/// Kind of media resource behind a download URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    M3u8,
    Mp4,
    Mkv,
}

impl MediaType {
    /// Infers the media type from the URL path suffix (case-insensitive).
    /// Anything that is not `.mp4` or `.mkv` is treated as an M3U8 playlist.
    pub fn from_url(url: &str) -> Self {
        let path = url::Url::parse(url)
            .map(|u| u.path().to_ascii_lowercase())
            .unwrap_or_else(|_| url.to_ascii_lowercase());
        if path.ends_with(".mp4") {
            Self::Mp4
        } else if path.ends_with(".mkv") {
            Self::Mkv
        } else {
            Self::M3u8
        }
    }

    /// Extension of the on-disk part files for this media type.
    pub(crate) fn segment_extension(self) -> &'static str {
        match self {
            Self::M3u8 => "ts",
            Self::Mp4 | Self::Mkv => "part",
        }
    }
}

/// Lifecycle state of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Initializing,
    Downloading,
    Paused,
    Merging,
    Completed,
    Failed,
    Canceled,
}

impl DownloadStatus {
    /// Terminal statuses accept no further transitions for the current run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Statuses reported by `get_active_download_ids`.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Initializing | Self::Downloading)
    }
}

/// Public error code taxonomy. Part of the engine contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadErrorCode {
    /// Master-playlist recursion exhausted, empty variant set, or no media
    /// playlist reachable from the given URL.
    NoMediaList,
    /// Any other failure: network, parse, I/O, unexpected status code.
    UnexpectedError,
}

/// Error attached to a `Failed` download and its progress snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadError {
    pub code: DownloadErrorCode,
    pub technical_message: Option<String>,
}

/// One unit of transfer: an HLS media segment or one byte range of a
/// container file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Ordering key, unique within a download. `media_sequence + i` for
    /// playlist segments, `0..N-1` for ranged files.
    pub index: u64,
    /// Absolute URL this segment is fetched from.
    pub url: String,
    /// Inclusive byte range; both ends are set together or not at all.
    pub range_start: Option<u64>,
    pub range_end: Option<u64>,
    /// Expected size when known, -1 otherwise. Replaced by the actual size
    /// once the segment is on disk.
    pub byte_size: i64,
    /// Absolute path of the part file inside the segment cache directory.
    pub temp_file_path: PathBuf,
    pub is_downloaded: bool,
}

/// Immutable snapshot of one download. Mutations publish a new value; a
/// snapshot handed out by the engine never changes underneath the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadState {
    pub download_id: DownloadId,
    pub url: String,
    pub output_path: PathBuf,
    pub segment_cache_dir: PathBuf,
    pub segments: Vec<SegmentInfo>,
    /// `segments.len()` once planning has finished, 0 before.
    pub total_segments: usize,
    pub downloaded_bytes: u64,
    /// Epoch millis of the last status change.
    pub timestamp: u64,
    pub status: DownloadStatus,
    pub media_type: MediaType,
    pub error: Option<DownloadError>,
}

impl DownloadState {
    pub(crate) fn new(
        download_id: &str,
        url: &str,
        output_path: PathBuf,
        segment_cache_dir: PathBuf,
        media_type: MediaType,
    ) -> Self {
        Self {
            download_id: download_id.to_string(),
            url: url.to_string(),
            output_path,
            segment_cache_dir,
            segments: Vec::new(),
            total_segments: 0,
            downloaded_bytes: 0,
            timestamp: epoch_millis(),
            status: DownloadStatus::Initializing,
            media_type,
            error: None,
        }
    }

    /// Returns a copy with the given status and a fresh timestamp.
    pub(crate) fn with_status(mut self, status: DownloadStatus) -> Self {
        self.status = status;
        self.timestamp = epoch_millis();
        self
    }

    pub fn downloaded_segments(&self) -> usize {
        self.segments.iter().filter(|s| s.is_downloaded).count()
    }

    /// Best-known total size: the sum of non-negative segment sizes, but
    /// never less than what has already been written.
    pub fn total_bytes(&self) -> u64 {
        let known: u64 = self
            .segments
            .iter()
            .filter(|s| s.byte_size >= 0)
            .map(|s| s.byte_size as u64)
            .sum();
        known.max(self.downloaded_bytes)
    }

    /// Point-in-time summary shipped to progress subscribers.
    pub fn progress(&self) -> DownloadProgress {
        DownloadProgress {
            download_id: self.download_id.clone(),
            url: self.url.clone(),
            total_segments: self.total_segments,
            downloaded_segments: self.downloaded_segments(),
            downloaded_bytes: self.downloaded_bytes,
            total_bytes: self.total_bytes(),
            status: self.status,
            error: self.error.clone(),
        }
    }
}

/// Read-only progress snapshot delivered on the progress streams.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub download_id: DownloadId,
    pub url: String,
    pub total_segments: usize,
    pub downloaded_segments: usize,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub status: DownloadStatus,
    pub error: Option<DownloadError>,
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
