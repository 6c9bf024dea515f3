// Bounded-concurrency segment fetching.

use std::sync::Arc;

use futures::StreamExt;
use reqwest::Client;
use reqwest::header::{HeaderMap, RANGE};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{EngineError, Result};
use crate::progress::ProgressBus;
use crate::store::StateStore;
use crate::types::SegmentInfo;

/// Streaming write buffer; segment bodies never materialize in memory.
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Downloads every not-yet-downloaded segment, at most `max_concurrent` in
/// flight. The first real failure cancels the remaining segment tasks and
/// wins; external cancellation through `token` surfaces as
/// [`EngineError::Cancelled`].
#[allow(clippy::too_many_arguments)]
pub(crate) async fn download_segments(
    client: &Client,
    download_id: &str,
    segments: &[SegmentInfo],
    headers: HeaderMap,
    max_concurrent: usize,
    store: &Arc<StateStore>,
    progress: &ProgressBus,
    token: &CancellationToken,
) -> Result<()> {
    // Child token so an internal segment failure can unwind its peers
    // without looking like an external pause/cancel on `token`.
    let fetch_token = token.child_token();
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    for segment in segments.iter().filter(|s| !s.is_downloaded) {
        let client = client.clone();
        let headers = headers.clone();
        let segment = segment.clone();
        let semaphore = Arc::clone(&semaphore);
        let store = Arc::clone(store);
        let progress = progress.clone();
        let fetch_token = fetch_token.clone();
        let download_id = download_id.to_string();

        tasks.spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = fetch_token.cancelled() => return Err(EngineError::Cancelled),
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|_| EngineError::internal("segment semaphore closed"))?
                }
            };

            let written = fetch_segment(&client, &segment, &headers, &fetch_token).await?;
            if let Some(state) = store.mark_segment_downloaded(&download_id, segment.index, written)
            {
                progress.emit(state.progress());
            }
            trace!(download_id = %download_id, index = segment.index, bytes = written, "segment downloaded");
            Ok(())
        });
    }

    let mut first_error: Option<EngineError> = None;
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(EngineError::internal(format!("segment task failed: {e}"))),
        };
        if let Err(err) = result {
            if !err.is_cancelled() && first_error.is_none() {
                fetch_token.cancel();
                first_error = Some(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None if token.is_cancelled() => Err(EngineError::Cancelled),
        None => Ok(()),
    }
}

/// One segment: GET (with a range header when the plan carries one) and a
/// streaming copy into the part file. Returns the bytes written.
async fn fetch_segment(
    client: &Client,
    segment: &SegmentInfo,
    headers: &HeaderMap,
    token: &CancellationToken,
) -> Result<u64> {
    let mut request = client.get(segment.url.as_str()).headers(headers.clone());
    if let (Some(start), Some(end)) = (segment.range_start, segment.range_end) {
        request = request.header(RANGE, format!("bytes={start}-{end}"));
    }

    let response = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(EngineError::Cancelled),
        response = request.send() => response?,
    };
    if !response.status().is_success() {
        return Err(EngineError::http_status(
            response.status(),
            segment.url.as_str(),
        ));
    }

    if let Some(parent) = segment.temp_file_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Create truncates: a partial file left by a cancelled attempt is
    // re-fetched from scratch.
    let file = tokio::fs::File::create(&segment.temp_file_path).await?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(EngineError::Cancelled),
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                writer.write_all(&bytes).await?;
                written += bytes.len() as u64;
            }
            Some(Err(e)) => return Err(EngineError::from(e)),
            None => break,
        }
    }
    writer.flush().await?;
    Ok(written)
}
