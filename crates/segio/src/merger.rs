// Concatenation of downloaded segments into the final artifact.

use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

use crate::error::Result;
use crate::types::DownloadState;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Streams every part file into `output_path` in ascending index order, then
/// deletes the part files and the cache directory. Returns the bytes
/// written. Runs to the end once started; a cancel issued mid-merge may
/// leave a partial output and the cache directory behind.
pub(crate) async fn merge_segments(state: &DownloadState) -> Result<u64> {
    let mut ordered: Vec<_> = state.segments.iter().collect();
    ordered.sort_by_key(|s| s.index);

    let output = File::create(&state.output_path).await?;
    let mut writer = BufWriter::with_capacity(COPY_BUFFER_SIZE, output);
    let mut total: u64 = 0;
    for segment in &ordered {
        let part = File::open(&segment.temp_file_path).await?;
        let mut reader = BufReader::with_capacity(COPY_BUFFER_SIZE, part);
        total += tokio::io::copy_buf(&mut reader, &mut writer).await?;
    }
    writer.flush().await?;

    for segment in &ordered {
        fs::remove_file(&segment.temp_file_path).await?;
    }
    fs::remove_dir_all(&state.segment_cache_dir).await?;

    debug!(
        download_id = %state.download_id,
        bytes = total,
        output = %state.output_path.display(),
        "segments merged"
    );
    Ok(total)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::types::{DownloadStatus, MediaType, SegmentInfo};

    fn segment(cache: &std::path::Path, index: u64, body: &[u8]) -> SegmentInfo {
        let path = cache.join(format!("{index}.ts"));
        std::fs::write(&path, body).unwrap();
        SegmentInfo {
            index,
            url: format!("https://host/{index}.ts"),
            range_start: None,
            range_end: None,
            byte_size: body.len() as i64,
            temp_file_path: path,
            is_downloaded: true,
        }
    }

    #[tokio::test]
    async fn merges_in_index_order_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("out.ts_segments_id");
        std::fs::create_dir_all(&cache).unwrap();
        let output = dir.path().join("out.ts");

        let mut state = crate::types::DownloadState::new(
            "id",
            "https://host/idx.m3u8",
            output.clone(),
            cache.clone(),
            MediaType::M3u8,
        );
        // Insertion order deliberately scrambled; merge goes by index.
        state.segments = vec![
            segment(&cache, 12, b"CC"),
            segment(&cache, 10, b"AA"),
            segment(&cache, 11, b"BB"),
        ];
        state.total_segments = 3;
        state.downloaded_bytes = 6;
        state = state.with_status(DownloadStatus::Merging);

        let written = merge_segments(&state).await.unwrap();
        assert_eq!(written, 6);
        assert_eq!(std::fs::read(&output).unwrap(), b"AABBCC");
        assert!(!cache.exists());
    }

    #[tokio::test]
    async fn missing_part_file_fails_the_merge() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("out.ts_segments_id");
        std::fs::create_dir_all(&cache).unwrap();

        let mut state = crate::types::DownloadState::new(
            "id",
            "https://host/idx.m3u8",
            dir.path().join("out.ts"),
            cache.clone(),
            MediaType::M3u8,
        );
        state.segments = vec![SegmentInfo {
            index: 0,
            url: "https://host/0.ts".to_string(),
            range_start: None,
            range_end: None,
            byte_size: 2,
            temp_file_path: cache.join("0.ts"),
            is_downloaded: true,
        }];
        state.total_segments = 1;

        assert!(merge_segments(&state).await.is_err());
        // The cache directory survives a failed merge.
        assert!(cache.exists());
    }
}
