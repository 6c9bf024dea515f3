// The download engine: lifecycle orchestration and the public API surface.

use std::path::PathBuf;
use std::sync::Arc;

use futures::Stream;
use reqwest::Client;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{self, DownloadOptions, EngineConfig};
use crate::error::{EngineError, Result};
use crate::progress::ProgressBus;
use crate::store::{ResumeDisposition, StateStore, TaskHandle};
use crate::types::{
    DownloadId, DownloadProgress, DownloadState, DownloadStatus, MediaType, SegmentInfo,
};
use crate::{fetcher, merger, planner};

/// Concurrent, pausable downloader for HLS playlists and ranged container
/// files. One engine instance manages any number of downloads; each download
/// runs on its own task spawned from the engine's scope.
pub struct DownloadEngine {
    client: Client,
    store: Arc<StateStore>,
    progress: ProgressBus,
    root_token: CancellationToken,
}

impl DownloadEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Ok(Self::with_client(config::build_client(&config)?))
    }

    /// Builds an engine around a caller-provided HTTP client. Timeouts,
    /// proxies and TLS settings belong to that client.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            store: Arc::new(StateStore::new()),
            progress: ProgressBus::new(),
            root_token: CancellationToken::new(),
        }
    }

    /// Idempotent warm-up hook.
    pub async fn init(&self) {
        debug!("download engine ready");
    }

    /// Starts a download under a fresh id and returns it.
    pub async fn download(
        &self,
        url: &str,
        output_path: impl Into<PathBuf>,
        options: DownloadOptions,
    ) -> DownloadId {
        let id = Uuid::new_v4().to_string();
        self.download_with_id(&id, url, output_path, options).await;
        id
    }

    /// Starts a download under a caller-chosen id. A no-op when the id is
    /// already registered, whatever state that entry is in.
    ///
    /// Planning runs inline: by the time this returns, the download has left
    /// `Initializing`. It is either `Downloading` on its own task or
    /// `Failed` with a planner error.
    pub async fn download_with_id(
        &self,
        id: &str,
        url: &str,
        output_path: impl Into<PathBuf>,
        options: DownloadOptions,
    ) {
        let output_path = output_path.into();
        let media_type = MediaType::from_url(url);
        let cache_dir = planner::segment_cache_dir(&output_path, id);
        let state = DownloadState::new(id, url, output_path, cache_dir, media_type);

        if !self.store.insert_or_reject(state.clone()) {
            debug!(download_id = %id, "download already registered, ignoring");
            return;
        }
        info!(download_id = %id, url = %url, media_type = ?media_type, "download registered");
        self.progress.emit(state.progress());

        let segments = match self.plan_segments(&state, &options).await {
            Ok(segments) => segments,
            Err(err) => {
                fail_download(&self.store, &self.progress, id, &err);
                return;
            }
        };

        let Some(planned) = self.store.update(id, |s| {
            let mut next = s.clone().with_status(DownloadStatus::Downloading);
            next.total_segments = segments.len();
            next.segments = segments;
            Some(next)
        }) else {
            return;
        };
        debug!(download_id = %id, segments = planned.total_segments, "segments planned");
        self.progress.emit(planned.progress());

        self.launch_task(id, options);
    }

    async fn plan_segments(
        &self,
        state: &DownloadState,
        options: &DownloadOptions,
    ) -> Result<Vec<SegmentInfo>> {
        let headers = config::header_map(&options.headers)?;
        tokio::fs::create_dir_all(&state.segment_cache_dir).await?;
        planner::plan(
            &self.client,
            &state.url,
            state.media_type,
            &headers,
            &state.segment_cache_dir,
        )
        .await
    }

    /// Spawns the fetch-then-merge task for `id` and attaches its handle.
    fn launch_task(&self, id: &str, options: DownloadOptions) {
        let token = self.root_token.child_token();
        let (done_tx, done_rx) = watch::channel(false);

        let client = self.client.clone();
        let store = Arc::clone(&self.store);
        let progress = self.progress.clone();
        let task_id = id.to_string();
        let task_token = token.clone();

        let join = tokio::spawn(async move {
            run_download(client, store, progress, task_id, options, task_token).await;
            done_tx.send_replace(true);
        });

        self.store.attach_task(
            id,
            TaskHandle {
                token,
                join,
                done: done_rx,
            },
        );
    }

    /// Pauses a running download: cancels its task cooperatively and leaves
    /// the part files in place for a later `resume`. Returns `false` when
    /// the id is unknown or no task is active.
    pub async fn pause(&self, id: &str) -> bool {
        let Some((state, handle)) = self.store.pause_active(id) else {
            return false;
        };
        handle.token.cancel();
        info!(download_id = %id, "download paused");
        self.progress.emit(state.progress());
        true
    }

    /// Resumes a paused or failed download on a fresh task, skipping
    /// segments already on disk. Already-running downloads report `true`
    /// without relaunching. The original call's options are not persisted;
    /// the relaunch uses `DownloadOptions::default()`.
    pub async fn resume(&self, id: &str) -> bool {
        match self.store.prepare_resume(id) {
            ResumeDisposition::AlreadyActive => true,
            ResumeDisposition::Rejected => false,
            ResumeDisposition::Relaunch(state) => {
                info!(download_id = %id, "download resumed");
                self.progress.emit(state.progress());
                self.launch_task(id, DownloadOptions::default());
                true
            }
        }
    }

    /// Cancels a download: any active task unwinds and the status is forced
    /// to `Canceled`. Part files are left on disk; cleaning them up is the
    /// caller's business. Returns `false` only for unknown ids.
    pub async fn cancel(&self, id: &str) -> bool {
        let Some((state, handle)) = self
            .store
            .set_status_and_detach(id, DownloadStatus::Canceled)
        else {
            return false;
        };
        if let Some(handle) = handle {
            handle.token.cancel();
        }
        info!(download_id = %id, "download canceled");
        self.progress.emit(state.progress());
        true
    }

    /// Pauses every download with an active task; returns their ids.
    pub async fn pause_all(&self) -> Vec<DownloadId> {
        let paused = self.store.pause_all_active();
        let mut ids = Vec::with_capacity(paused.len());
        for (state, handle) in paused {
            handle.token.cancel();
            info!(download_id = %state.download_id, "download paused");
            ids.push(state.download_id.clone());
            self.progress.emit(state.progress());
        }
        ids
    }

    /// Cancels every non-terminal download. Terminal entries keep their
    /// status.
    pub async fn cancel_all(&self) {
        let (handles, changed) = self.store.cancel_all_entries();
        for handle in handles {
            handle.token.cancel();
        }
        for state in changed {
            info!(download_id = %state.download_id, "download canceled");
            self.progress.emit(state.progress());
        }
    }

    pub async fn get_state(&self, id: &str) -> Option<DownloadState> {
        self.store.get(id)
    }

    pub async fn get_all_states(&self) -> Vec<DownloadState> {
        self.store.all()
    }

    pub async fn get_active_download_ids(&self) -> Vec<DownloadId> {
        self.store
            .all()
            .into_iter()
            .filter(|s| s.status.is_active())
            .map(|s| s.download_id)
            .collect()
    }

    /// Progress stream for every download, replaying the last emission to
    /// late subscribers.
    pub fn progress_flow(&self) -> impl Stream<Item = DownloadProgress> + Send + 'static {
        self.progress.subscribe()
    }

    /// Progress stream for one download. The first element is a snapshot of
    /// the current state when the id is known.
    pub fn get_progress_flow(&self, id: &str) -> impl Stream<Item = DownloadProgress> + Send + 'static {
        let head = self.store.get(id).map(|s| s.progress());
        self.progress.subscribe_for(id, head)
    }

    /// Stream of the full state list, re-emitted on every mutation.
    pub fn download_states_flow(&self) -> impl Stream<Item = Vec<DownloadState>> + Send + 'static {
        WatchStream::new(self.store.states_rx())
    }

    /// Waits for the active task of `id` to finish, if there is one.
    pub async fn join_download(&self, id: &str) {
        let Some(mut done) = self.store.done_rx(id) else {
            return;
        };
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Cancels and joins every task and empties the store. The engine is
    /// done afterwards; further calls operate on an empty registry.
    pub async fn close(&self) {
        self.root_token.cancel();
        for handle in self.store.drain() {
            handle.token.cancel();
            let _ = handle.join.await;
        }
        info!("download engine closed");
    }
}

/// Per-download task body: fetch, merge, and the terminal transition.
///
/// Cancellation discipline: when `token` fires, the pause/cancel/close call
/// that fired it owns the final status; this task just unwinds.
async fn run_download(
    client: Client,
    store: Arc<StateStore>,
    progress: ProgressBus,
    id: String,
    options: DownloadOptions,
    token: CancellationToken,
) {
    let result = run_pipeline(&client, &store, &progress, &id, &options, &token).await;

    if token.is_cancelled() {
        debug!(download_id = %id, "download task unwound after cancellation");
        return;
    }

    match result {
        Ok(()) => {}
        Err(err) if err.is_cancelled() => {}
        Err(err) => fail_download(&store, &progress, &id, &err),
    }
}

async fn run_pipeline(
    client: &Client,
    store: &Arc<StateStore>,
    progress: &ProgressBus,
    id: &str,
    options: &DownloadOptions,
    token: &CancellationToken,
) -> Result<()> {
    let state = store
        .get(id)
        .ok_or_else(|| EngineError::internal("download state disappeared"))?;
    // A cancel between launch and the first poll leaves the status off
    // Downloading; back off before touching the network.
    if state.status != DownloadStatus::Downloading {
        return Err(EngineError::Cancelled);
    }
    let headers = config::header_map(&options.headers)?;

    fetcher::download_segments(
        client,
        id,
        &state.segments,
        headers,
        options.max_concurrent_segments,
        store,
        progress,
        token,
    )
    .await?;

    if token.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    // A status that moved away from Downloading means pause/cancel won the
    // race; back off without merging.
    let Some(merging) = store.update(id, |s| {
        (s.status == DownloadStatus::Downloading)
            .then(|| s.clone().with_status(DownloadStatus::Merging))
    }) else {
        return Err(EngineError::Cancelled);
    };
    progress.emit(merging.progress());
    info!(download_id = %id, segments = merging.total_segments, "all segments downloaded, merging");

    let merged = merger::merge_segments(&merging).await?;

    let completed = store.update(id, |s| {
        (s.status == DownloadStatus::Merging)
            .then(|| s.clone().with_status(DownloadStatus::Completed))
    });
    if let Some(completed) = completed {
        progress.emit(completed.progress());
        info!(
            download_id = %id,
            bytes = merged,
            output = %completed.output_path.display(),
            "download completed"
        );
    }
    Ok(())
}

/// Terminal failure transition, shared by the planner path and the task
/// body. Terminal and paused entries are left untouched so a racing
/// pause/cancel always wins.
fn fail_download(store: &Arc<StateStore>, progress: &ProgressBus, id: &str, err: &EngineError) {
    warn!(download_id = %id, error = %err, "download failed");
    let failed = store.update(id, |s| {
        if s.status.is_terminal() || s.status == DownloadStatus::Paused {
            return None;
        }
        let mut next = s.clone().with_status(DownloadStatus::Failed);
        next.error = Some(err.to_download_error());
        Some(next)
    });
    if let Some(state) = failed {
        progress.emit(state.progress());
    }
}
