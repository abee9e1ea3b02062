//! Local artifact store
//!
//! Persists the upload queue and the file → booking map across restarts.
//! Both live in memory behind one lock; every mutation is applied to a copy,
//! written to disk, and only then swapped in. A crash at any point leaves
//! the on-disk documents describing either the old or the new state.
//!
//! Documents (in `root_path`):
//! - `file_bookings.json`: recording path → booking id
//! - `upload_queue.json`: FIFO of [`UploadTask`]s
//!
//! The map is always written before the queue. Adding a task therefore never
//! leaves a queued task without its booking, and removing one leaves at
//! worst a queued task whose booking was already released, which is
//! idempotent to finish.

mod disk;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

pub use disk::{available_bytes, load_json_or_default, write_json_atomic};

use crate::core::StoreError;

pub const QUEUE_FILE: &str = "upload_queue.json";
pub const FILE_BOOKINGS_FILE: &str = "file_bookings.json";

/// Configuration for the artifact store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the state documents
    pub root_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("/var/lib/smartcam"),
        }
    }
}

/// How far an upload got before it last stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    /// Nothing sent yet
    #[default]
    Pending,
    /// Object stored remotely
    Uploaded,
    /// Metadata record inserted
    Registered,
}

/// A finished recording waiting to be shipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTask {
    pub file_path: PathBuf,
    /// Object name under the user's prefix
    pub destination_name: String,
    #[serde(default)]
    pub booking_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub stage: UploadStage,
    #[serde(default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,
}

impl UploadTask {
    pub fn new(file_path: impl Into<PathBuf>, booking_id: Option<String>) -> Self {
        let file_path = file_path.into();
        let destination_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            file_path,
            destination_name,
            booking_id,
            retry_count: 0,
            stage: UploadStage::Pending,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    queue: VecDeque<UploadTask>,
    file_bookings: BTreeMap<PathBuf, String>,
    /// The documents on disk may not match this state; rewrite both
    stale: bool,
}

/// Durable upload queue and file → booking map
pub struct ArtifactStore {
    config: StoreConfig,
    state: Mutex<StoreState>,
    work: Notify,
}

impl ArtifactStore {
    /// Open the store, reloading any state left by a previous run
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.root_path).map_err(|source| StoreError::Io {
            path: config.root_path.clone(),
            source,
        })?;

        let queue: VecDeque<UploadTask> =
            load_json_or_default(&config.root_path.join(QUEUE_FILE))?;
        let file_bookings: BTreeMap<PathBuf, String> =
            load_json_or_default(&config.root_path.join(FILE_BOOKINGS_FILE))?;

        info!(
            "Artifact store at {:?}: {} queued uploads, {} tracked recordings",
            config.root_path,
            queue.len(),
            file_bookings.len()
        );

        Ok(Self {
            config,
            state: Mutex::new(StoreState {
                queue,
                file_bookings,
                stale: false,
            }),
            work: Notify::new(),
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.config.root_path
    }

    /// Apply `f` to a copy of the state, persist it, then publish it.
    ///
    /// If persisting fails the in-memory state is left untouched and the map
    /// document is rolled back to match it.
    async fn mutate<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> Result<R, StoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let result = f(&mut next);

        let map_path = self.config.root_path.join(FILE_BOOKINGS_FILE);
        let map_changed = state.stale || next.file_bookings != state.file_bookings;
        let queue_changed = state.stale || next.queue != state.queue;

        if map_changed {
            write_json_atomic(&map_path, &next.file_bookings)?;
        }
        if queue_changed {
            if let Err(e) = write_json_atomic(&self.config.root_path.join(QUEUE_FILE), &next.queue) {
                if map_changed {
                    if let Err(rollback) = write_json_atomic(&map_path, &state.file_bookings) {
                        error!("Failed to roll back {:?}: {}", map_path, rollback);
                        state.stale = true;
                    }
                }
                return Err(e);
            }
        }

        next.stale = false;
        *state = next;
        Ok(result)
    }

    // ========== Queue ==========

    /// Append a task. Returns `false` if the file is already queued.
    pub async fn enqueue(&self, task: UploadTask) -> Result<bool, StoreError> {
        self.enqueue_replacing(task, None).await
    }

    /// Append a task produced from another recording (e.g. an enriched
    /// copy), moving the original's booking entry to the new file in the
    /// same write.
    pub async fn enqueue_replacing(&self, task: UploadTask, original: Option<&Path>) -> Result<bool, StoreError> {
        let file = task.file_path.clone();
        let added = self
            .mutate(|state| {
                if state.queue.iter().any(|t| t.file_path == task.file_path) {
                    return false;
                }
                if let Some(original) = original {
                    state.file_bookings.remove(original);
                }
                if let Some(booking) = &task.booking_id {
                    state
                        .file_bookings
                        .insert(task.file_path.clone(), booking.clone());
                }
                state.queue.push_back(task);
                true
            })
            .await?;

        if added {
            debug!("Queued upload: {:?}", file);
            self.work.notify_one();
        } else {
            warn!("Upload for {:?} already queued, ignoring duplicate", file);
        }
        Ok(added)
    }

    /// Oldest task, if any
    pub async fn front(&self) -> Option<UploadTask> {
        self.state.lock().await.queue.front().cloned()
    }

    /// Persist progress made on a queued task
    pub async fn update(&self, task: &UploadTask) -> Result<(), StoreError> {
        self.mutate(|state| {
            if let Some(slot) = state
                .queue
                .iter_mut()
                .find(|t| t.file_path == task.file_path)
            {
                *slot = task.clone();
            }
        })
        .await
    }

    /// Count a failed attempt and move the task to the back of the queue.
    ///
    /// Returns the new retry count, or `None` if the task is no longer queued.
    pub async fn defer(&self, file_path: &Path) -> Result<Option<u32>, StoreError> {
        self.mutate(|state| {
            let index = state.queue.iter().position(|t| t.file_path == file_path)?;
            let mut task = state.queue.remove(index)?;
            task.retry_count += 1;
            let retries = task.retry_count;
            state.queue.push_back(task);
            Some(retries)
        })
        .await
    }

    /// Remove a finished task together with its booking entry
    pub async fn complete(&self, file_path: &Path) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.file_bookings.remove(file_path);
            state.queue.retain(|t| t.file_path != file_path);
        })
        .await
    }

    /// Drop a task that can never succeed. Its booking is left untouched.
    pub async fn discard(&self, file_path: &Path) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.file_bookings.remove(file_path);
            state.queue.retain(|t| t.file_path != file_path);
        })
        .await
    }

    /// Snapshot of the queue, front first
    pub async fn pending(&self) -> Vec<UploadTask> {
        self.state.lock().await.queue.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.queue.is_empty()
    }

    /// Wait until a task is enqueued or `idle` elapses
    pub async fn wait_for_work(&self, idle: Duration) {
        let _ = tokio::time::timeout(idle, self.work.notified()).await;
    }

    // ========== File → booking map ==========

    /// Remember which booking a recording belongs to
    pub async fn record_booking(&self, file_path: &Path, booking_id: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            state
                .file_bookings
                .insert(file_path.to_path_buf(), booking_id.to_string());
        })
        .await
    }

    pub async fn booking_for(&self, file_path: &Path) -> Option<String> {
        self.state.lock().await.file_bookings.get(file_path).cloned()
    }

    pub async fn forget_booking(&self, file_path: &Path) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.file_bookings.remove(file_path);
        })
        .await
    }

    pub async fn file_bookings(&self) -> BTreeMap<PathBuf, String> {
        self.state.lock().await.file_bookings.clone()
    }

    /// Map entries with no queued task: live or interrupted recordings
    pub async fn unqueued_recordings(&self) -> Vec<(PathBuf, String)> {
        let state = self.state.lock().await;
        state
            .file_bookings
            .iter()
            .filter(|(path, _)| !state.queue.iter().any(|t| &t.file_path == *path))
            .map(|(path, booking)| (path.clone(), booking.clone()))
            .collect()
    }

    /// Whether a booking still has a recording or upload in flight
    pub async fn references_booking(&self, booking_id: &str) -> bool {
        self.references_booking_except(booking_id, None).await
    }

    /// Like [`references_booking`](Self::references_booking), ignoring
    /// everything recorded for `except`
    pub async fn references_booking_except(&self, booking_id: &str, except: Option<&Path>) -> bool {
        let state = self.state.lock().await;
        let other = |path: &Path| except != Some(path);
        state
            .file_bookings
            .iter()
            .any(|(path, b)| b == booking_id && other(path))
            || state
                .queue
                .iter()
                .any(|t| t.booking_id.as_deref() == Some(booking_id) && other(&t.file_path))
    }

    // ========== Disk usage ==========

    /// Total size of queued files still on disk
    pub async fn pending_bytes(&self) -> u64 {
        let paths: Vec<PathBuf> = self.pending().await.into_iter().map(|t| t.file_path).collect();
        let mut total = 0;
        for path in paths {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                total += meta.len();
            }
        }
        total
    }

    /// Free space on the filesystem holding the state documents
    pub async fn available_bytes(&self) -> Option<u64> {
        let path = self.config.root_path.clone();
        tokio::task::spawn_blocking(move || available_bytes(&path))
            .await
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> ArtifactStore {
        ArtifactStore::open(StoreConfig {
            root_path: dir.to_path_buf(),
        })
        .unwrap()
    }

    // ========== Queue ==========

    #[tokio::test(flavor = "multi_thread")]
    async fn queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store
                .enqueue(UploadTask::new("/rec/a.mp4", Some("b1".into())))
                .await
                .unwrap();
            store.enqueue(UploadTask::new("/rec/b.mp4", None)).await.unwrap();
        }

        let store = open(dir.path());
        let pending = store.pending().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].destination_name, "a.mp4");
        assert_eq!(pending[0].booking_id.as_deref(), Some("b1"));
        assert_eq!(
            store.booking_for(Path::new("/rec/a.mp4")).await.as_deref(),
            Some("b1")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_enqueue_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        assert!(store.enqueue(UploadTask::new("/rec/a.mp4", None)).await.unwrap());
        assert!(!store.enqueue(UploadTask::new("/rec/a.mp4", None)).await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replacing_moves_booking_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.record_booking(Path::new("/rec/raw.mp4"), "b1").await.unwrap();

        let task = UploadTask::new("/rec/raw_enriched.mp4", Some("b1".into()));
        store
            .enqueue_replacing(task, Some(Path::new("/rec/raw.mp4")))
            .await
            .unwrap();

        let map = store.file_bookings().await;
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(Path::new("/rec/raw_enriched.mp4")).map(String::as_str), Some("b1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn defer_moves_task_to_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.enqueue(UploadTask::new("/rec/a.mp4", None)).await.unwrap();
        store.enqueue(UploadTask::new("/rec/b.mp4", None)).await.unwrap();

        assert_eq!(store.defer(Path::new("/rec/a.mp4")).await.unwrap(), Some(1));
        let pending = store.pending().await;
        assert_eq!(pending[0].destination_name, "b.mp4");
        assert_eq!(pending[1].retry_count, 1);

        assert_eq!(store.defer(Path::new("/rec/zzz.mp4")).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn complete_removes_task_and_booking() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store
            .enqueue(UploadTask::new("/rec/a.mp4", Some("b1".into())))
            .await
            .unwrap();

        store.complete(Path::new("/rec/a.mp4")).await.unwrap();
        assert!(store.is_empty().await);
        assert!(!store.references_booking("b1").await);

        let store = open(dir.path());
        assert!(store.is_empty().await);
        assert!(store.file_bookings().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stage_progress_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mut task = UploadTask::new("/rec/a.mp4", None);
        store.enqueue(task.clone()).await.unwrap();

        task.stage = UploadStage::Uploaded;
        store.update(&task).await.unwrap();

        let store = open(dir.path());
        assert_eq!(store.front().await.unwrap().stage, UploadStage::Uploaded);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enqueue_wakes_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(open(dir.path()));

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let started = std::time::Instant::now();
                store.wait_for_work(Duration::from_secs(30)).await;
                started.elapsed()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.enqueue(UploadTask::new("/rec/a.mp4", None)).await.unwrap();

        assert!(waiter.await.unwrap() < Duration::from_secs(5));
    }

    // ========== File → booking map ==========

    #[tokio::test(flavor = "multi_thread")]
    async fn booking_map_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let path = Path::new("/rec/live.mp4");

        store.record_booking(path, "b7").await.unwrap();
        assert!(store.references_booking("b7").await);

        let store = open(dir.path());
        assert_eq!(store.booking_for(path).await.as_deref(), Some("b7"));
        store.forget_booking(path).await.unwrap();
        assert!(!store.references_booking("b7").await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_queue_write_rolls_back_map() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.record_booking(Path::new("/rec/a.mp4"), "b1").await.unwrap();

        // A directory in place of the queue document makes its rename fail
        let blocker = dir.path().join(QUEUE_FILE).join("blocker");
        std::fs::create_dir_all(&blocker).unwrap();

        let task = UploadTask::new("/rec/b.mp4", Some("b2".into()));
        assert!(store.enqueue(task).await.is_err());
        assert!(store.is_empty().await);
        assert!(!store.references_booking("b2").await);
        let on_disk: BTreeMap<PathBuf, String> =
            load_json_or_default(&dir.path().join(FILE_BOOKINGS_FILE)).unwrap();
        assert_eq!(on_disk, store.file_bookings().await);

        std::fs::remove_dir_all(dir.path().join(QUEUE_FILE)).unwrap();
        store.enqueue(UploadTask::new("/rec/c.mp4", None)).await.unwrap();

        let reopened = open(dir.path());
        assert_eq!(reopened.file_bookings().await, store.file_bookings().await);
        assert_eq!(reopened.pending().await, store.pending().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unqueued_recordings_skip_queued_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store
            .enqueue(UploadTask::new("/rec/done.mp4", Some("b1".into())))
            .await
            .unwrap();
        store.record_booking(Path::new("/rec/live.mp4"), "b2").await.unwrap();

        assert_eq!(
            store.unqueued_recordings().await,
            vec![(PathBuf::from("/rec/live.mp4"), "b2".to_string())]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn references_ignore_excluded_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let first = Path::new("/rec/first.mp4");
        let second = Path::new("/rec/second.mp4");

        store
            .enqueue(UploadTask::new(first, Some("b7".into())))
            .await
            .unwrap();
        assert!(!store.references_booking_except("b7", Some(first)).await);

        store.record_booking(second, "b7").await.unwrap();
        assert!(store.references_booking_except("b7", Some(first)).await);
        assert!(store.references_booking_except("b7", Some(second)).await);
        assert!(!store.references_booking_except("b8", None).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn corrupt_queue_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(QUEUE_FILE), b"[{\"file_path\":").unwrap();
        std::fs::write(
            dir.path().join(FILE_BOOKINGS_FILE),
            br#"{"/rec/a.mp4": "b1"}"#,
        )
        .unwrap();

        let store = open(dir.path());
        assert!(store.is_empty().await);
        assert_eq!(store.file_bookings().await.len(), 1);
    }

    // ========== Disk usage ==========

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_bytes_sums_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let file = dir.path().join("a.mp4");
        std::fs::write(&file, vec![0u8; 1000]).unwrap();
        store.enqueue(UploadTask::new(&file, None)).await.unwrap();
        store
            .enqueue(UploadTask::new(dir.path().join("gone.mp4"), None))
            .await
            .unwrap();

        assert_eq!(store.pending_bytes().await, 1000);
        assert!(store.available_bytes().await.is_some());
    }
}
