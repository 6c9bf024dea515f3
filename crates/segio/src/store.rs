// State store: the single mutation point for download state.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::{DownloadId, DownloadState, DownloadStatus};

/// Handle of the task currently driving a download.
#[derive(Debug)]
pub(crate) struct TaskHandle {
    pub(crate) token: CancellationToken,
    pub(crate) join: JoinHandle<()>,
    /// Flips to `true` once the task body has run to completion.
    pub(crate) done: watch::Receiver<bool>,
}

impl TaskHandle {
    /// An attached handle whose task already finished counts as "no active
    /// task" for the pause/resume guards.
    pub(crate) fn is_active(&self) -> bool {
        !self.join.is_finished()
    }
}

#[derive(Debug)]
struct Entry {
    state: DownloadState,
    task: Option<TaskHandle>,
}

/// Outcome of a resume request, decided under the store lock.
pub(crate) enum ResumeDisposition {
    /// A task is already running; nothing to relaunch.
    AlreadyActive,
    /// Status moved back to `Downloading`; the caller launches a fresh task.
    Relaunch(DownloadState),
    /// Unknown id or a status resume does not apply to.
    Rejected,
}

/// Owns every `DownloadId -> (state, task)` pair. All reads and writes go
/// through one mutex; the stored state is an immutable snapshot replaced on
/// each mutation. The full state list is re-published on a watch channel
/// after every mutation, outside the lock, so subscriber work never runs
/// under it.
pub(crate) struct StateStore {
    entries: Mutex<HashMap<DownloadId, Entry>>,
    states_tx: watch::Sender<Vec<DownloadState>>,
}

impl StateStore {
    pub(crate) fn new() -> Self {
        let (states_tx, _) = watch::channel(Vec::new());
        Self {
            entries: Mutex::new(HashMap::new()),
            states_tx,
        }
    }

    pub(crate) fn states_rx(&self) -> watch::Receiver<Vec<DownloadState>> {
        self.states_tx.subscribe()
    }

    pub(crate) fn get(&self, id: &str) -> Option<DownloadState> {
        self.entries.lock().unwrap().get(id).map(|e| e.state.clone())
    }

    pub(crate) fn all(&self) -> Vec<DownloadState> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|e| e.state.clone())
            .collect()
    }

    /// Registers a new download. Returns `false` without touching anything
    /// when the id is already present.
    pub(crate) fn insert_or_reject(&self, state: DownloadState) -> bool {
        {
            let mut entries = self.entries.lock().unwrap();
            if entries.contains_key(&state.download_id) {
                return false;
            }
            entries.insert(state.download_id.clone(), Entry { state, task: None });
        }
        self.publish();
        true
    }

    /// Replaces the state of `id` with the transform result. The transform
    /// returning `None` leaves the entry untouched; an absent id is a no-op.
    pub(crate) fn update(
        &self,
        id: &str,
        transform: impl FnOnce(&DownloadState) -> Option<DownloadState>,
    ) -> Option<DownloadState> {
        let updated = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.get_mut(id)?;
            let next = transform(&entry.state)?;
            entry.state = next.clone();
            next
        };
        self.publish();
        Some(updated)
    }

    /// Records a finished segment: flips `is_downloaded` (exactly once),
    /// stores the actual size, and advances `downloaded_bytes`.
    pub(crate) fn mark_segment_downloaded(
        &self,
        id: &str,
        index: u64,
        bytes: u64,
    ) -> Option<DownloadState> {
        let updated = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.get_mut(id)?;
            let segment = entry.state.segments.iter_mut().find(|s| s.index == index)?;
            if segment.is_downloaded {
                return Some(entry.state.clone());
            }
            segment.is_downloaded = true;
            segment.byte_size = bytes as i64;
            entry.state.downloaded_bytes += bytes;
            entry.state.clone()
        };
        self.publish();
        Some(updated)
    }

    pub(crate) fn attach_task(&self, id: &str, handle: TaskHandle) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(id) {
            entry.task = Some(handle);
        }
    }

    /// Pause, atomically: only succeeds while a live task is attached. The
    /// detached handle is returned so its token can be cancelled outside the
    /// lock.
    pub(crate) fn pause_active(&self, id: &str) -> Option<(DownloadState, TaskHandle)> {
        let result = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.get_mut(id)?;
            if entry.state.status.is_terminal()
                || !entry.task.as_ref().is_some_and(|t| t.is_active())
            {
                return None;
            }
            let handle = entry.task.take()?;
            entry.state = entry.state.clone().with_status(DownloadStatus::Paused);
            (entry.state.clone(), handle)
        };
        self.publish();
        Some(result)
    }

    /// Pauses every download with a live task. One lock pass.
    pub(crate) fn pause_all_active(&self) -> Vec<(DownloadState, TaskHandle)> {
        let paused = {
            let mut entries = self.entries.lock().unwrap();
            let mut paused = Vec::new();
            for entry in entries.values_mut() {
                if entry.state.status.is_terminal()
                    || !entry.task.as_ref().is_some_and(|t| t.is_active())
                {
                    continue;
                }
                if let Some(handle) = entry.task.take() {
                    entry.state = entry.state.clone().with_status(DownloadStatus::Paused);
                    paused.push((entry.state.clone(), handle));
                }
            }
            paused
        };
        if !paused.is_empty() {
            self.publish();
        }
        paused
    }

    /// Combined transition for cancel: detach any task and force the status.
    /// `None` only when the id is unknown.
    pub(crate) fn set_status_and_detach(
        &self,
        id: &str,
        status: DownloadStatus,
    ) -> Option<(DownloadState, Option<TaskHandle>)> {
        let result = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.get_mut(id)?;
            let handle = entry.task.take();
            entry.state = entry.state.clone().with_status(status);
            (entry.state.clone(), handle)
        };
        self.publish();
        Some(result)
    }

    pub(crate) fn prepare_resume(&self, id: &str) -> ResumeDisposition {
        let relaunched = {
            let mut entries = self.entries.lock().unwrap();
            let Some(entry) = entries.get_mut(id) else {
                return ResumeDisposition::Rejected;
            };
            if entry.task.as_ref().is_some_and(|t| t.is_active()) {
                return ResumeDisposition::AlreadyActive;
            }
            if !matches!(
                entry.state.status,
                DownloadStatus::Paused | DownloadStatus::Failed
            ) {
                return ResumeDisposition::Rejected;
            }
            let mut next = entry.state.clone().with_status(DownloadStatus::Downloading);
            next.error = None;
            entry.state = next.clone();
            next
        };
        self.publish();
        ResumeDisposition::Relaunch(relaunched)
    }

    /// Detaches every task and cancels the state of everything still
    /// in flight. Terminal entries keep their status.
    pub(crate) fn cancel_all_entries(&self) -> (Vec<TaskHandle>, Vec<DownloadState>) {
        let (handles, changed) = {
            let mut entries = self.entries.lock().unwrap();
            let mut handles = Vec::new();
            let mut changed = Vec::new();
            for entry in entries.values_mut() {
                if let Some(handle) = entry.task.take() {
                    handles.push(handle);
                }
                if matches!(
                    entry.state.status,
                    DownloadStatus::Initializing
                        | DownloadStatus::Downloading
                        | DownloadStatus::Paused
                        | DownloadStatus::Merging
                ) {
                    entry.state = entry.state.clone().with_status(DownloadStatus::Canceled);
                    changed.push(entry.state.clone());
                }
            }
            (handles, changed)
        };
        if !changed.is_empty() {
            self.publish();
        }
        (handles, changed)
    }

    /// Completion receiver of the attached task, if any.
    pub(crate) fn done_rx(&self, id: &str) -> Option<watch::Receiver<bool>> {
        self.entries
            .lock()
            .unwrap()
            .get(id)
            .and_then(|e| e.task.as_ref())
            .map(|t| t.done.clone())
    }

    /// Empties the store for shutdown, handing back every task handle.
    pub(crate) fn drain(&self) -> Vec<TaskHandle> {
        let handles = {
            let mut entries = self.entries.lock().unwrap();
            let handles = entries.values_mut().filter_map(|e| e.task.take()).collect();
            entries.clear();
            handles
        };
        self.publish();
        handles
    }

    fn publish(&self) {
        let snapshot = self.all();
        self.states_tx.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::types::{MediaType, SegmentInfo};

    fn state(id: &str) -> DownloadState {
        DownloadState::new(
            id,
            "https://host/x.m3u8",
            PathBuf::from("/out/x.ts"),
            PathBuf::from(format!("/out/x.ts_segments_{id}")),
            MediaType::M3u8,
        )
    }

    fn segment(index: u64) -> SegmentInfo {
        SegmentInfo {
            index,
            url: format!("https://host/{index}.ts"),
            range_start: None,
            range_end: None,
            byte_size: -1,
            temp_file_path: PathBuf::from(format!("/cache/{index}.ts")),
            is_downloaded: false,
        }
    }

    fn live_task() -> (TaskHandle, watch::Sender<bool>) {
        let (done_tx, done_rx) = watch::channel(false);
        let join = tokio::spawn(std::future::pending::<()>());
        (
            TaskHandle {
                token: CancellationToken::new(),
                join,
                done: done_rx,
            },
            done_tx,
        )
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let store = StateStore::new();
        assert!(store.insert_or_reject(state("a")));
        assert!(!store.insert_or_reject(state("a")));
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn update_is_a_noop_for_unknown_ids() {
        let store = StateStore::new();
        let updated = store.update("missing", |s| Some(s.clone()));
        assert!(updated.is_none());
    }

    #[test]
    fn mark_segment_downloaded_counts_once() {
        let store = StateStore::new();
        let mut initial = state("a");
        initial.segments = vec![segment(0), segment(1)];
        initial.total_segments = 2;
        store.insert_or_reject(initial);

        let first = store.mark_segment_downloaded("a", 0, 100).unwrap();
        assert_eq!(first.downloaded_bytes, 100);
        assert_eq!(first.segments[0].byte_size, 100);

        // A second completion report for the same segment changes nothing.
        let second = store.mark_segment_downloaded("a", 0, 100).unwrap();
        assert_eq!(second.downloaded_bytes, 100);
    }

    #[tokio::test]
    async fn pause_requires_a_live_task() {
        let store = StateStore::new();
        store.insert_or_reject(state("a"));
        assert!(store.pause_active("a").is_none());

        let (handle, _done_tx) = live_task();
        store.attach_task("a", handle);
        let (paused, detached) = store.pause_active("a").unwrap();
        assert_eq!(paused.status, DownloadStatus::Paused);
        assert!(store.pause_active("a").is_none());
        detached.join.abort();
    }

    #[tokio::test]
    async fn resume_gates_on_status() {
        let store = StateStore::new();
        store.insert_or_reject(state("a"));

        // Initializing is not resumable.
        assert!(matches!(
            store.prepare_resume("a"),
            ResumeDisposition::Rejected
        ));

        store.update("a", |s| Some(s.clone().with_status(DownloadStatus::Failed)));
        match store.prepare_resume("a") {
            ResumeDisposition::Relaunch(state) => {
                assert_eq!(state.status, DownloadStatus::Downloading);
                assert!(state.error.is_none());
            }
            _ => panic!("expected relaunch"),
        }
        assert!(matches!(
            store.prepare_resume("missing"),
            ResumeDisposition::Rejected
        ));
    }

    #[tokio::test]
    async fn cancel_all_leaves_terminal_entries_alone() {
        let store = StateStore::new();
        store.insert_or_reject(state("running"));
        store.update("running", |s| {
            Some(s.clone().with_status(DownloadStatus::Downloading))
        });
        store.insert_or_reject(state("done"));
        store.update("done", |s| {
            Some(s.clone().with_status(DownloadStatus::Completed))
        });

        let (handle, _done_tx) = live_task();
        store.attach_task("running", handle);

        let (handles, changed) = store.cancel_all_entries();
        assert_eq!(handles.len(), 1);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].download_id, "running");
        assert_eq!(store.get("running").unwrap().status, DownloadStatus::Canceled);
        assert_eq!(store.get("done").unwrap().status, DownloadStatus::Completed);
        for handle in handles {
            handle.join.abort();
        }
    }

    #[test]
    fn states_watch_publishes_every_mutation() {
        let store = StateStore::new();
        let rx = store.states_rx();
        assert!(rx.borrow().is_empty());

        store.insert_or_reject(state("a"));
        assert_eq!(rx.borrow().len(), 1);

        store.update("a", |s| {
            Some(s.clone().with_status(DownloadStatus::Downloading))
        });
        assert_eq!(rx.borrow()[0].status, DownloadStatus::Downloading);
    }
}
