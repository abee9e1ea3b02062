//! Upload worker
//!
//! Drains the artifact store's queue one task at a time:
//! 1. Put the file under `{user_id}/{filename}` in the object store
//! 2. Insert its metadata record
//! 3. Release (delete) the booking it was recorded for, unless another
//!    recording of that booking is still in flight
//! 4. Drop the task and delete the local file
//!
//! Progress through steps 1 and 2 is persisted on the task, so a retry
//! resumes at the step that failed. Failed tasks go to the back of the
//! queue with exponential backoff and are retried forever.

use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::UploadError;
use crate::remote::{storage_key, BookingSource, MetadataStore, ObjectStore, VideoRecord};
use crate::storage::{ArtifactStore, UploadStage, UploadTask};

/// Upload worker configuration
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Owner prefix for object keys
    pub user_id: String,
    /// Delay after the first failure
    pub base_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Queue re-check interval when idle
    pub idle_poll: Duration,
    /// Delay before a crashed worker is restarted
    pub restart_delay: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(5 * 60),
            idle_poll: Duration::from_secs(30),
            restart_delay: Duration::from_secs(5),
        }
    }
}

/// Exponential backoff: base, 2×base, 4×base, ... capped at `max_backoff`.
pub fn backoff_delay(config: &UploadConfig, retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(16);
    config
        .base_backoff
        .saturating_mul(1u32 << exponent)
        .min(config.max_backoff)
}

/// Result of handling one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Uploaded, registered, released and deleted locally
    Completed,
    /// Failed; moved to the back of the queue
    Deferred { retry_count: u32, delay: Duration },
    /// Can never succeed; removed from the queue
    Discarded,
}

/// Ships queued recordings to the remote stores
pub struct UploadWorker {
    config: UploadConfig,
    store: Arc<ArtifactStore>,
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    bookings: Arc<dyn BookingSource>,
}

impl UploadWorker {
    pub fn new(
        config: UploadConfig,
        store: Arc<ArtifactStore>,
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        bookings: Arc<dyn BookingSource>,
    ) -> Self {
        Self {
            config,
            store,
            objects,
            metadata,
            bookings,
        }
    }

    /// Handle the task at the front of the queue, if any
    pub async fn drain_once(&self) -> Option<TaskOutcome> {
        let task = self.store.front().await?;
        Some(self.handle(task).await)
    }

    /// Run one task to completion, deferral or discard
    pub async fn handle(&self, mut task: UploadTask) -> TaskOutcome {
        let path = task.file_path.clone();

        let result = self.process(&mut task).await;
        if let Err(e) = result {
            return self.on_failure(&task, e).await;
        }

        if let Err(e) = self.store.complete(&path).await {
            error!("Failed to drop finished upload {:?}: {}", path, e);
            return self.on_failure(&task, UploadError::Unavailable(e.to_string())).await;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete uploaded file {:?}: {}", path, e),
        }

        info!(
            booking = task.booking_id.as_deref().unwrap_or("-"),
            "Upload complete: {}", task.destination_name
        );
        TaskOutcome::Completed
    }

    async fn process(&self, task: &mut UploadTask) -> Result<(), UploadError> {
        let key = storage_key(&self.config.user_id, &task.destination_name);

        if task.stage == UploadStage::Pending {
            let data = match tokio::fs::read(&task.file_path).await {
                Ok(data) => Bytes::from(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(UploadError::MissingFile(task.file_path.clone()));
                }
                Err(source) => {
                    return Err(UploadError::Io {
                        path: task.file_path.clone(),
                        source,
                    });
                }
            };

            debug!("Uploading {} ({} bytes)", key, data.len());
            self.objects.put(&key, data).await?;
            task.stage = UploadStage::Uploaded;
            self.save_progress(task).await;
        }

        if task.stage == UploadStage::Uploaded {
            let record = VideoRecord {
                filename: task.destination_name.clone(),
                storage_key: key,
                booking_id: task.booking_id.clone(),
                created_at: Utc::now(),
            };
            self.metadata.insert_video_record(&record).await?;
            task.stage = UploadStage::Registered;
            self.save_progress(task).await;
        }

        if let Some(booking_id) = &task.booking_id {
            // Another segment of the same booking is still recording or queued;
            // the last one to finish releases it
            if self
                .store
                .references_booking_except(booking_id, Some(&task.file_path))
                .await
            {
                info!(booking = %booking_id, "Booking has other recordings in flight, not releasing yet");
            } else {
                self.bookings.delete_booking(booking_id).await?;
            }
        }
        Ok(())
    }

    /// A lost progress update only costs a repeated (idempotent) step
    async fn save_progress(&self, task: &UploadTask) {
        if let Err(e) = self.store.update(task).await {
            warn!("Failed to persist upload progress for {:?}: {}", task.file_path, e);
        }
    }

    async fn on_failure(&self, task: &UploadTask, err: UploadError) -> TaskOutcome {
        if !err.is_retryable() {
            error!(
                booking = task.booking_id.as_deref().unwrap_or("-"),
                "Dropping upload that can never succeed: {}; booking left in place", err
            );
            if let Err(e) = self.store.discard(&task.file_path).await {
                error!("Failed to drop task {:?}: {}", task.file_path, e);
            }
            return TaskOutcome::Discarded;
        }

        let retry_count = match self.store.defer(&task.file_path).await {
            Ok(Some(n)) => n,
            Ok(None) => task.retry_count + 1,
            Err(e) => {
                error!("Failed to requeue {:?}: {}", task.file_path, e);
                task.retry_count + 1
            }
        };
        let delay = backoff_delay(&self.config, retry_count);
        warn!(
            "Upload of {} failed (attempt {}, stage {:?}): {}; retrying in {:?}",
            task.destination_name, retry_count, task.stage, err, delay
        );
        TaskOutcome::Deferred { retry_count, delay }
    }

    /// Drain the queue until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Upload worker started");

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.drain_once() => outcome,
            };

            let pause = match outcome {
                Some(TaskOutcome::Deferred { delay, .. }) => Some(delay),
                Some(_) => continue,
                None => None,
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = async {
                    match pause {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => self.store.wait_for_work(self.config.idle_poll).await,
                    }
                } => {}
            }
        }

        info!("Upload worker stopped");
    }

    /// Keep a worker running until cancelled, restarting it if it exits or panics
    pub async fn supervise(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let handle = tokio::spawn(self.clone().run(cancel.clone()));

            match handle.await {
                Ok(()) if cancel.is_cancelled() => break,
                Ok(()) => warn!("Upload worker exited unexpectedly, restarting"),
                Err(e) if e.is_panic() => error!("Upload worker panicked, restarting: {}", e),
                Err(e) => warn!("Upload worker task failed, restarting: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.restart_delay) => {}
            }
        }
    }
}
