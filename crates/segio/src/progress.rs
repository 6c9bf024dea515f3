// Progress broadcasting with last-value replay.

use std::sync::{Arc, Mutex};

use futures::Stream;
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::types::DownloadProgress;

/// Buffering beyond the replayed value. A lagging subscriber loses the
/// oldest emissions and keeps receiving from the newest.
const PROGRESS_BUFFER: usize = 64;

/// Many-to-many progress fan-out. All components publish through a clone of
/// the bus; subscribers get every emission plus a replay of the most recent
/// one.
#[derive(Clone)]
pub(crate) struct ProgressBus {
    tx: broadcast::Sender<DownloadProgress>,
    last: Arc<Mutex<Option<DownloadProgress>>>,
}

impl ProgressBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(PROGRESS_BUFFER);
        Self {
            tx,
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Publishes a snapshot. Never blocks; without subscribers the value is
    /// still retained for replay.
    pub(crate) fn emit(&self, progress: DownloadProgress) {
        *self.last.lock().unwrap() = Some(progress.clone());
        let _ = self.tx.send(progress);
    }

    /// Every future emission, preceded by the most recent one if any.
    pub(crate) fn subscribe(&self) -> impl Stream<Item = DownloadProgress> + Send + 'static {
        let replay = self.last.lock().unwrap().clone();
        let live = BroadcastStream::new(self.tx.subscribe())
            .filter_map(|item| std::future::ready(item.ok()));
        stream::iter(replay).chain(live)
    }

    /// Emissions of a single download. `head` goes out first; the caller
    /// computes it from the current state so late subscribers see a value
    /// without waiting for the next mutation.
    pub(crate) fn subscribe_for(
        &self,
        download_id: &str,
        head: Option<DownloadProgress>,
    ) -> impl Stream<Item = DownloadProgress> + Send + 'static {
        let id = download_id.to_string();
        let live = BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| {
            std::future::ready(match item {
                Ok(progress) if progress.download_id == id => Some(progress),
                _ => None,
            })
        });
        stream::iter(head).chain(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DownloadStatus;

    fn progress(id: &str, downloaded: usize) -> DownloadProgress {
        DownloadProgress {
            download_id: id.to_string(),
            url: format!("https://host/{id}.m3u8"),
            total_segments: 4,
            downloaded_segments: downloaded,
            downloaded_bytes: downloaded as u64 * 100,
            total_bytes: 400,
            status: DownloadStatus::Downloading,
            error: None,
        }
    }

    #[tokio::test]
    async fn replays_the_last_emission_to_late_subscribers() {
        let bus = ProgressBus::new();
        bus.emit(progress("a", 1));
        bus.emit(progress("a", 2));

        let mut stream = Box::pin(bus.subscribe());
        let first = stream.next().await.unwrap();
        assert_eq!(first.downloaded_segments, 2);
    }

    #[tokio::test]
    async fn filters_by_download_id() {
        let bus = ProgressBus::new();
        let mut stream = Box::pin(bus.subscribe_for("a", None));

        bus.emit(progress("b", 1));
        bus.emit(progress("a", 3));

        let got = stream.next().await.unwrap();
        assert_eq!(got.download_id, "a");
        assert_eq!(got.downloaded_segments, 3);
    }

    #[tokio::test]
    async fn head_snapshot_arrives_before_live_values() {
        let bus = ProgressBus::new();
        let mut stream = Box::pin(bus.subscribe_for("a", Some(progress("a", 0))));

        bus.emit(progress("a", 1));

        assert_eq!(stream.next().await.unwrap().downloaded_segments, 0);
        assert_eq!(stream.next().await.unwrap().downloaded_segments, 1);
    }

    #[tokio::test]
    async fn lagging_subscriber_drops_oldest_and_recovers() {
        let bus = ProgressBus::new();
        let mut stream = Box::pin(bus.subscribe());
        for i in 0..(PROGRESS_BUFFER + 10) {
            bus.emit(progress("a", i));
        }
        // The earliest emissions are gone, but the stream keeps yielding.
        let first = stream.next().await.unwrap();
        assert!(first.downloaded_segments > 0);
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = ProgressBus::new();
        bus.emit(progress("a", 1));
    }
}
