// Download planning: playlist resolution, range probing, segment layout.

use std::path::{Path, PathBuf};

use m3u8_rs::{MasterPlaylist, MediaPlaylist, Playlist, VariantStream};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, RANGE};
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::error::{EngineError, Result};
use crate::types::{MediaType, SegmentInfo};

/// Fixed slice size for ranged container downloads.
pub const RANGE_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Master playlists may point at further master playlists; resolution gives
/// up after this many hops.
const MAX_PLAYLIST_DEPTH: usize = 5;

/// Per-download directory holding the part files, created next to the output
/// file during initialization. Falls back to the working directory when the
/// output path has no parent.
pub(crate) fn segment_cache_dir(output_path: &Path, download_id: &str) -> PathBuf {
    let file_name = output_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let dir_name = format!("{file_name}_segments_{download_id}");
    match output_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(dir_name),
        _ => PathBuf::from(dir_name),
    }
}

/// Produces the segment plan for one download.
pub(crate) async fn plan(
    client: &Client,
    url: &str,
    media_type: MediaType,
    headers: &HeaderMap,
    cache_dir: &Path,
) -> Result<Vec<SegmentInfo>> {
    match media_type {
        MediaType::M3u8 => plan_playlist(client, url, headers, cache_dir).await,
        MediaType::Mp4 | MediaType::Mkv => {
            plan_ranged(client, url, headers, cache_dir, media_type).await
        }
    }
}

/// Resolves master playlists down to a media playlist and lays out its
/// segments. Variant selection always takes the highest bandwidth; on ties
/// the first listed variant wins.
async fn plan_playlist(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    cache_dir: &Path,
) -> Result<Vec<SegmentInfo>> {
    let mut current = Url::parse(url).map_err(|e| EngineError::invalid_url(url, e.to_string()))?;

    for _ in 0..MAX_PLAYLIST_DEPTH {
        let body = fetch_playlist(client, &current, headers).await?;
        match m3u8_rs::parse_playlist_res(body.as_bytes()) {
            Ok(Playlist::MasterPlaylist(master)) => {
                let variant = select_variant(&master).ok_or_else(|| {
                    EngineError::no_media_list(format!("master playlist {current} has no variants"))
                })?;
                let next = current
                    .join(&variant.uri)
                    .map_err(|e| EngineError::invalid_url(&variant.uri, e.to_string()))?;
                debug!(variant = %next, bandwidth = variant.bandwidth, "following master playlist variant");
                current = next;
            }
            Ok(Playlist::MediaPlaylist(media)) => {
                return media_segments(&media, &current, cache_dir);
            }
            Err(e) => {
                return Err(EngineError::playlist(format!(
                    "failed to parse playlist {current}: {e}"
                )));
            }
        }
    }

    Err(EngineError::no_media_list(format!(
        "no media playlist within {MAX_PLAYLIST_DEPTH} levels of {url}"
    )))
}

async fn fetch_playlist(client: &Client, url: &Url, headers: &HeaderMap) -> Result<String> {
    let response = client
        .get(url.clone())
        .headers(headers.clone())
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(EngineError::http_status(response.status(), url.as_str()));
    }
    response.text().await.map_err(EngineError::from)
}

fn select_variant(master: &MasterPlaylist) -> Option<&VariantStream> {
    let mut best: Option<&VariantStream> = None;
    for variant in &master.variants {
        if best.is_none_or(|b| variant.bandwidth > b.bandwidth) {
            best = Some(variant);
        }
    }
    best
}

/// One segment per playlist entry, indexed from the playlist's media
/// sequence. Segments are always fetched as whole URIs: an EXT-X-BYTERANGE
/// tag only seeds the expected size, it does not become an HTTP range.
fn media_segments(
    media: &MediaPlaylist,
    playlist_url: &Url,
    cache_dir: &Path,
) -> Result<Vec<SegmentInfo>> {
    let mut segments = Vec::with_capacity(media.segments.len());
    for (i, segment) in media.segments.iter().enumerate() {
        let index = media.media_sequence + i as u64;
        let absolute = playlist_url
            .join(&segment.uri)
            .map_err(|e| EngineError::invalid_url(&segment.uri, e.to_string()))?;
        let byte_size = segment
            .byte_range
            .as_ref()
            .map(|r| r.length as i64)
            .unwrap_or(-1);
        segments.push(SegmentInfo {
            index,
            url: absolute.into(),
            range_start: None,
            range_end: None,
            byte_size,
            temp_file_path: cache_dir.join(format!("{index}.ts")),
            is_downloaded: false,
        });
    }
    Ok(segments)
}

/// Server capabilities learned from the range probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RangeProbe {
    /// Total resource size, -1 when the server did not say.
    content_length: i64,
    range_supported: bool,
}

/// Probes range support with a one-byte request. `None` means the probe
/// failed (network error, unexpected status, malformed Content-Range); the
/// plan then degrades to a single unsized segment.
async fn probe_range_support(
    client: &Client,
    url: &Url,
    headers: &HeaderMap,
) -> Option<RangeProbe> {
    let response = match client
        .get(url.clone())
        .headers(headers.clone())
        .header(RANGE, "bytes=0-0")
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            debug!(url = %url, error = %e, "range probe request failed");
            return None;
        }
    };

    let status = response.status();
    if status == StatusCode::PARTIAL_CONTENT {
        let total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)?;
        Some(RangeProbe {
            content_length: total as i64,
            range_supported: true,
        })
    } else if status == StatusCode::OK {
        let length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(-1);
        Some(RangeProbe {
            content_length: length,
            range_supported: false,
        })
    } else {
        debug!(url = %url, %status, "range probe got unexpected status");
        None
    }
}

/// Total size out of a `Content-Range: bytes 0-0/<total>` header. An unknown
/// total (`*`) counts as malformed.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (unit, rest) = value.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (_range, total) = rest.split_once('/')?;
    total.trim().parse::<u64>().ok()
}

async fn plan_ranged(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    cache_dir: &Path,
    media_type: MediaType,
) -> Result<Vec<SegmentInfo>> {
    let parsed = Url::parse(url).map_err(|e| EngineError::invalid_url(url, e.to_string()))?;
    let probe = probe_range_support(client, &parsed, headers).await;
    debug!(url = %url, probe = ?probe, "range probe finished");
    Ok(ranged_segments(url, probe, cache_dir, media_type))
}

fn ranged_segments(
    url: &str,
    probe: Option<RangeProbe>,
    cache_dir: &Path,
    media_type: MediaType,
) -> Vec<SegmentInfo> {
    let ext = media_type.segment_extension();
    let single = |byte_size: i64, range: Option<(u64, u64)>| {
        vec![SegmentInfo {
            index: 0,
            url: url.to_string(),
            range_start: range.map(|(start, _)| start),
            range_end: range.map(|(_, end)| end),
            byte_size,
            temp_file_path: cache_dir.join(format!("0.{ext}")),
            is_downloaded: false,
        }]
    };

    match probe {
        None => single(-1, None),
        Some(p) if !p.range_supported || p.content_length <= 0 => single(p.content_length, None),
        Some(p) if (p.content_length as u64) <= RANGE_CHUNK_SIZE => {
            single(p.content_length, Some((0, p.content_length as u64 - 1)))
        }
        Some(p) => {
            let total = p.content_length as u64;
            let mut segments = Vec::with_capacity(total.div_ceil(RANGE_CHUNK_SIZE) as usize);
            let mut start = 0u64;
            let mut index = 0u64;
            while start < total {
                let end = (start + RANGE_CHUNK_SIZE).min(total) - 1;
                segments.push(SegmentInfo {
                    index,
                    url: url.to_string(),
                    range_start: Some(start),
                    range_end: Some(end),
                    byte_size: (end - start + 1) as i64,
                    temp_file_path: cache_dir.join(format!("{index}.{ext}")),
                    is_downloaded: false,
                });
                start = end + 1;
                index += 1;
            }
            segments
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_dir_sits_next_to_the_output() {
        let dir = segment_cache_dir(Path::new("/media/out/movie.mp4"), "id-1");
        assert_eq!(dir, PathBuf::from("/media/out/movie.mp4_segments_id-1"));

        // No parent: the working directory is used.
        let dir = segment_cache_dir(Path::new("movie.mp4"), "id-2");
        assert_eq!(dir, PathBuf::from("movie.mp4_segments_id-2"));
    }

    #[test]
    fn content_range_total_parsing() {
        assert_eq!(parse_content_range_total("bytes 0-0/12582912"), Some(12582912));
        assert_eq!(parse_content_range_total("BYTES 0-0/10"), Some(10));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("bytes 0-0"), None);
        assert_eq!(parse_content_range_total("items 0-0/10"), None);
        assert_eq!(parse_content_range_total(""), None);
    }

    #[test]
    fn highest_bandwidth_wins_first_on_ties() {
        let master = "#EXTM3U\n\
                      #EXT-X-STREAM-INF:BANDWIDTH=1500000\n\
                      first.m3u8\n\
                      #EXT-X-STREAM-INF:BANDWIDTH=500000\n\
                      low.m3u8\n\
                      #EXT-X-STREAM-INF:BANDWIDTH=1500000\n\
                      second.m3u8\n";
        let Ok(Playlist::MasterPlaylist(master)) = m3u8_rs::parse_playlist_res(master.as_bytes())
        else {
            panic!("expected master playlist");
        };
        assert_eq!(select_variant(&master).unwrap().uri, "first.m3u8");
    }

    #[test]
    fn media_segments_index_from_media_sequence() {
        let playlist = "#EXTM3U\n\
                        #EXT-X-VERSION:3\n\
                        #EXT-X-TARGETDURATION:4\n\
                        #EXT-X-MEDIA-SEQUENCE:10\n\
                        #EXTINF:4.0,\n\
                        a.ts\n\
                        #EXTINF:4.0,\n\
                        b.ts\n\
                        #EXT-X-ENDLIST\n";
        let Ok(Playlist::MediaPlaylist(media)) = m3u8_rs::parse_playlist_res(playlist.as_bytes())
        else {
            panic!("expected media playlist");
        };
        let url = Url::parse("https://host/hls/idx.m3u8").unwrap();
        let segments = media_segments(&media, &url, Path::new("/cache")).unwrap();

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].index, 10);
        assert_eq!(segments[0].url, "https://host/hls/a.ts");
        assert_eq!(segments[0].temp_file_path, PathBuf::from("/cache/10.ts"));
        assert_eq!(segments[0].byte_size, -1);
        assert_eq!(segments[1].index, 11);
        assert!(segments[1].range_start.is_none() && segments[1].range_end.is_none());
    }

    #[test]
    fn byterange_tag_seeds_size_but_no_range() {
        let playlist = "#EXTM3U\n\
                        #EXT-X-VERSION:4\n\
                        #EXT-X-TARGETDURATION:4\n\
                        #EXT-X-MEDIA-SEQUENCE:0\n\
                        #EXTINF:4.0,\n\
                        #EXT-X-BYTERANGE:1024@0\n\
                        media.bin\n\
                        #EXT-X-ENDLIST\n";
        let Ok(Playlist::MediaPlaylist(media)) = m3u8_rs::parse_playlist_res(playlist.as_bytes())
        else {
            panic!("expected media playlist");
        };
        let url = Url::parse("https://host/idx.m3u8").unwrap();
        let segments = media_segments(&media, &url, Path::new("/cache")).unwrap();
        assert_eq!(segments[0].byte_size, 1024);
        assert!(segments[0].range_start.is_none());
    }

    #[test]
    fn probe_failure_degrades_to_one_unsized_segment() {
        let segments = ranged_segments("https://host/f.mp4", None, Path::new("/c"), MediaType::Mp4);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].byte_size, -1);
        assert!(segments[0].range_start.is_none());
        assert_eq!(segments[0].temp_file_path, PathBuf::from("/c/0.part"));
    }

    #[test]
    fn no_range_support_keeps_one_segment() {
        let probe = Some(RangeProbe {
            content_length: 1000,
            range_supported: false,
        });
        let segments = ranged_segments("https://host/f.mp4", probe, Path::new("/c"), MediaType::Mp4);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].byte_size, 1000);
        assert!(segments[0].range_start.is_none());
    }

    #[test]
    fn small_ranged_file_gets_one_full_range() {
        let probe = Some(RangeProbe {
            content_length: 4096,
            range_supported: true,
        });
        let segments = ranged_segments("https://host/f.mkv", probe, Path::new("/c"), MediaType::Mkv);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].range_start, Some(0));
        assert_eq!(segments[0].range_end, Some(4095));
    }

    #[test]
    fn large_ranged_file_is_sliced_in_five_mib_chunks() {
        // 12 MiB: two full chunks plus a 2 MiB remainder.
        let probe = Some(RangeProbe {
            content_length: 12 * 1024 * 1024,
            range_supported: true,
        });
        let segments =
            ranged_segments("https://host/big.mp4", probe, Path::new("/c"), MediaType::Mp4);
        assert_eq!(segments.len(), 3);
        assert_eq!(
            (segments[0].range_start, segments[0].range_end),
            (Some(0), Some(5_242_879))
        );
        assert_eq!(
            (segments[1].range_start, segments[1].range_end),
            (Some(5_242_880), Some(10_485_759))
        );
        assert_eq!(
            (segments[2].range_start, segments[2].range_end),
            (Some(10_485_760), Some(12_582_911))
        );
        assert_eq!(segments.iter().map(|s| s.byte_size).sum::<i64>(), 12 * 1024 * 1024);
        assert_eq!(segments[2].index, 2);
    }
}
