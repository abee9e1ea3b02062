//! Recording controller
//!
//! Owns the camera and the single recording session. Starting a recording
//! records which booking the file belongs to; stopping one turns the
//! finished file into an [`UploadTask`] and returns only once that task is
//! on disk.
//!
//! The controller is shared as [`SharedController`]; holding its lock is
//! holding the camera.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::remux::recover_artifact;
use crate::capture::{CameraDevice, FinalizeSettings, Frame};
use crate::core::RecorderError;
use crate::storage::{ArtifactStore, UploadTask};

/// Recording controller configuration
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Recordings are force-stopped after this long
    pub max_duration: Duration,
    /// How often the watchdog checks the camera and the duration cap
    pub watchdog_interval: Duration,
    /// How leftovers of interrupted recordings are finalized
    pub recovery: FinalizeSettings,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(2 * 60 * 60), // 2 hours
            watchdog_interval: Duration::from_secs(30),
            recovery: FinalizeSettings::default(),
        }
    }
}

/// The recording in progress
#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub booking_id: Option<String>,
    pub file_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// Read-only view of the controller for status consumers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecorderStatus {
    pub is_recording: bool,
    pub booking_id: Option<String>,
    pub file_path: Option<PathBuf>,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(PathBuf),
    /// Nothing changed; a session for this booking (if known) is running
    AlreadyRecording(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The recording is durably queued for upload
    Queued(UploadTask),
    /// The camera produced nothing worth keeping
    Discarded,
    NotRecording,
}

/// Optional post-processing between stop and enqueue
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Produce an enriched copy of `input`, returning its path
    async fn enrich(&self, input: &Path) -> anyhow::Result<PathBuf>;
}

pub type SharedController = Arc<Mutex<RecordingController>>;

/// Drives the camera on behalf of the scheduler
pub struct RecordingController {
    camera: Box<dyn CameraDevice>,
    store: Arc<ArtifactStore>,
    enricher: Option<Arc<dyn Enricher>>,
    config: RecorderConfig,
    session: Option<RecordingSession>,
    /// Booking force-stopped by the duration cap
    capped: Option<String>,
    status: watch::Sender<RecorderStatus>,
}

impl RecordingController {
    pub fn new(camera: Box<dyn CameraDevice>, store: Arc<ArtifactStore>, config: RecorderConfig) -> Self {
        let (status, _) = watch::channel(RecorderStatus::default());
        Self {
            camera,
            store,
            enricher: None,
            config,
            session: None,
            capped: None,
            status,
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn into_shared(self) -> SharedController {
        Arc::new(Mutex::new(self))
    }

    /// Status updates, readable without taking the controller lock
    pub fn subscribe(&self) -> watch::Receiver<RecorderStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> RecorderStatus {
        self.status.borrow().clone()
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    pub fn current_booking(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.booking_id.as_deref())
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn backend(&self) -> String {
        self.camera.backend()
    }

    pub fn capture_frame(&self) -> Option<Frame> {
        self.camera.capture_frame()
    }

    /// Whether `booking_id` was force-stopped by the duration cap
    pub fn is_capped(&self, booking_id: &str) -> bool {
        self.capped.as_deref() == Some(booking_id)
    }

    /// Forget the capped booking once it is no longer active
    pub fn clear_cap(&mut self) {
        if let Some(id) = self.capped.take() {
            debug!(booking = %id, "Duration cap cleared");
        }
    }

    fn publish(&self) {
        let status = match &self.session {
            Some(s) => RecorderStatus {
                is_recording: true,
                booking_id: s.booking_id.clone(),
                file_path: Some(s.file_path.clone()),
                since: Some(s.started_at),
            },
            None => RecorderStatus::default(),
        };
        self.status.send_replace(status);
    }

    /// Start recording `booking_id`. A no-op while a session is open.
    pub async fn start(&mut self, booking_id: &str) -> Result<StartOutcome, RecorderError> {
        if let Some(session) = &self.session {
            return Ok(StartOutcome::AlreadyRecording(session.booking_id.clone()));
        }

        let started = self.camera.start_recording(None).await?;
        let path = started.path().to_path_buf();

        if let Err(e) = self.store.record_booking(&path, booking_id).await {
            // Without the map entry the file could not be attributed after a crash
            error!(booking = %booking_id, "Failed to record booking for {:?}: {}", path, e);
            if let Err(stop_err) = self.camera.stop_recording().await {
                warn!("Failed to stop camera after store error: {}", stop_err);
            }
            return Err(e.into());
        }

        if self.capped.as_deref().is_some_and(|id| id != booking_id) {
            self.capped = None;
        }

        info!(booking = %booking_id, "Recording started: {:?}", path);
        self.session = Some(RecordingSession {
            booking_id: Some(booking_id.to_string()),
            file_path: path.clone(),
            started_at: Utc::now(),
        });
        self.publish();
        Ok(StartOutcome::Started(path))
    }

    /// Stop the open session and queue its recording for upload.
    ///
    /// Returns only after the task is on disk. A second call is a no-op.
    pub async fn stop(&mut self) -> Result<StopOutcome, RecorderError> {
        let Some(session) = self.session.take() else {
            return Ok(StopOutcome::NotRecording);
        };
        self.publish();

        let output = match self.camera.stop_recording().await {
            Ok(output) => output,
            Err(e) => {
                error!("Camera failed to stop cleanly: {}", e);
                recover_artifact(&session.file_path, &self.config.recovery).await
            }
        };

        let Some(recorded) = output else {
            warn!("Recording {:?} produced no usable file", session.file_path);
            self.store.forget_booking(&session.file_path).await?;
            return Ok(StopOutcome::Discarded);
        };

        let booking_id = match self.store.booking_for(&session.file_path).await {
            Some(id) => Some(id),
            None => session.booking_id.clone(),
        };

        let upload_path = enrich(self.enricher.clone(), &recorded).await;
        let task = UploadTask::new(&upload_path, booking_id);
        self.store
            .enqueue_replacing(task.clone(), Some(&session.file_path))
            .await?;

        if upload_path != recorded {
            if let Err(e) = tokio::fs::remove_file(&recorded).await {
                warn!("Failed to remove unenriched {:?}: {}", recorded, e);
            }
        }

        info!(
            booking = task.booking_id.as_deref().unwrap_or("-"),
            "Recording queued for upload: {:?}", task.file_path
        );
        Ok(StopOutcome::Queued(task))
    }

    /// Check the camera and the duration cap.
    ///
    /// A camera fault stops the session (queueing whatever was written)
    /// before the fault is returned. Exceeding `max_duration` stops the
    /// session and caps its booking.
    pub async fn enforce_limits(&mut self, now: DateTime<Utc>) -> Result<Option<StopOutcome>, RecorderError> {
        if let Err(e) = self.camera.check_health().await {
            if self.session.is_some() {
                error!("Camera fault while recording: {}", e);
                if let Err(stop_err) = self.stop().await {
                    error!("Failed to stop after camera fault: {}", stop_err);
                }
            }
            return Err(e.into());
        }

        let Some(session) = &self.session else {
            return Ok(None);
        };

        let elapsed = (now - session.started_at).to_std().unwrap_or_default();
        if elapsed < self.config.max_duration {
            return Ok(None);
        }

        let booking = session.booking_id.clone();
        warn!(
            booking = booking.as_deref().unwrap_or("-"),
            "Recording exceeded {:?}, stopping", self.config.max_duration
        );
        let outcome = self.stop().await?;
        self.capped = booking;
        Ok(Some(outcome))
    }

    /// Queue recordings left behind by a crash or a failed enqueue.
    ///
    /// Every tracked file without a queued task (other than the open
    /// session's) is finalized and enqueued; entries whose file is gone or
    /// too small are dropped.
    pub async fn recover_orphans(&mut self) -> Result<usize, RecorderError> {
        let current = self.session.as_ref().map(|s| s.file_path.clone());
        let mut recovered = 0;

        for (path, booking_id) in self.store.unqueued_recordings().await {
            if Some(&path) == current.as_ref() {
                continue;
            }

            match recover_artifact(&path, &self.config.recovery).await {
                Some(file) => {
                    info!(booking = %booking_id, "Recovered orphaned recording {:?}", file);
                    let task = UploadTask::new(&file, Some(booking_id));
                    self.store.enqueue_replacing(task, Some(&path)).await?;
                    recovered += 1;
                }
                None => {
                    warn!(booking = %booking_id, "Dropping orphan entry for {:?}", path);
                    self.store.forget_booking(&path).await?;
                }
            }
        }

        if recovered > 0 {
            info!("Recovered {} orphaned recording(s)", recovered);
        }
        Ok(recovered)
    }

    /// Stop any session and hand the camera back
    pub async fn release(&mut self) {
        if let Err(e) = self.stop().await {
            error!("Failed to stop recording during release: {}", e);
        }
        self.camera.release().await;
    }
}

/// Run the enricher, falling back to the original file on any failure
async fn enrich(enricher: Option<Arc<dyn Enricher>>, recorded: &Path) -> PathBuf {
    let Some(enricher) = enricher else {
        return recorded.to_path_buf();
    };
    match enricher.enrich(recorded).await {
        Ok(path) if tokio::fs::try_exists(&path).await.unwrap_or(false) => path,
        Ok(path) => {
            warn!("Enriched file {:?} is missing, uploading original", path);
            recorded.to_path_buf()
        }
        Err(e) => {
            warn!("Enrichment of {:?} failed, uploading original: {:#}", recorded, e);
            recorded.to_path_buf()
        }
    }
}

/// Periodically enforce the camera health check and duration cap, and
/// re-queue recordings whose enqueue failed
pub async fn run_watchdog(controller: SharedController, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut controller = controller.lock().await;
        match controller.enforce_limits(Utc::now()).await {
            Ok(Some(outcome)) => info!("Watchdog stopped recording: {:?}", outcome),
            Ok(None) => {}
            Err(e) => warn!("Watchdog: {} ({:?})", e, e.severity()),
        }

        if let Err(e) = controller.recover_orphans().await {
            warn!("Watchdog: failed to queue stranded recordings: {}", e);
        }
    }

    debug!("Watchdog stopped");
}
