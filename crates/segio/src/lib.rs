//! Segmented HTTP media download engine.
//!
//! Fetches a single media resource, either an HLS (M3U8) playlist of
//! segments or an MP4/MKV file split by HTTP byte ranges, into one output
//! file, with pause/resume/cancel, bounded per-download concurrency, and
//! progress streams.
//!
//! ```no_run
//! use segio::{DownloadEngine, DownloadOptions, EngineConfig};
//!
//! # async fn demo() -> Result<(), segio::EngineError> {
//! let engine = DownloadEngine::new(EngineConfig::default())?;
//! let id = engine
//!     .download("https://host/master.m3u8", "movie.ts", DownloadOptions::default())
//!     .await;
//! engine.join_download(&id).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
mod fetcher;
mod merger;
mod planner;
mod progress;
mod store;
pub mod types;

pub use config::{DEFAULT_SEGMENT_CONCURRENCY, DownloadOptions, EngineConfig};
pub use engine::DownloadEngine;
pub use error::EngineError;
pub use planner::RANGE_CHUNK_SIZE;
pub use types::{
    DownloadError, DownloadErrorCode, DownloadId, DownloadProgress, DownloadState, DownloadStatus,
    MediaType, SegmentInfo,
};
