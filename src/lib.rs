//! Smartcam - booking-driven camera recorder
//!
//! This crate turns a single camera into a recorder that runs only during
//! externally scheduled bookings and ships every finished recording to
//! remote storage exactly once:
//! - Core types: bookings, error taxonomy
//! - Capture: camera backends (libcamera, V4L2) behind one trait
//! - Storage: the crash-safe upload queue and file → booking map
//! - Remote: booking source, object store and metadata store clients
//! - Recorder: the single recording session and its watchdog
//! - Scheduler: booking reconciliation and stale-booking sweep
//! - Upload: the retrying upload worker
//!
//! # Architecture
//!
//! ```text
//! SchedulerLoop ──► RecordingController ──► CameraDevice
//!                          │
//!                          ▼ (stop: enqueue)
//!                    ArtifactStore ◄── UploadWorker ──► ObjectStore
//!                                            │         MetadataStore
//!                                            └───────► BookingSource (release)
//! ```
//!
//! The scheduler and upload worker never talk to each other directly; the
//! artifact store is the only hand-off point.
//!
//! # Example
//!
//! ```ignore
//! use smartcam::{capture, ArtifactStore, RecordingController, SchedulerLoop};
//!
//! let camera = capture::probe(&CameraConfig::default()).await?;
//! let store = Arc::new(ArtifactStore::open(StoreConfig::default())?);
//! let controller = RecordingController::new(camera, store.clone(), RecorderConfig::default())
//!     .into_shared();
//! let scheduler = Arc::new(SchedulerLoop::new(config, source, controller, store));
//! tokio::spawn(scheduler.run(cancel.clone()));
//! ```

// Core types and errors
pub mod core;

// Camera backends
pub mod capture;

// Local persistence
pub mod storage;

// External services
pub mod remote;

// Recording session control
pub mod recorder;

// Booking reconciliation
pub mod scheduler;

// Upload queue draining
pub mod upload;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// Core types
pub use crate::core::{Booking, Severity};
pub use crate::core::{CameraError, RecorderError, RecordingWriteError, SchedulerError, SourceError, StoreError, UploadError};

// Capture
pub use capture::{probe, CameraConfig, CameraDevice, Frame, RecordingStart};
#[cfg(feature = "test-source")]
pub use capture::{TestCamera, TestCameraConfig};

// Storage
pub use storage::{ArtifactStore, StoreConfig, UploadStage, UploadTask};

// Remote
pub use remote::{BookingSource, MetadataStore, ObjectStore, VideoRecord};
pub use remote::{SupabaseClient, SupabaseConfig};

// Recorder
pub use recorder::{Enricher, RecorderConfig, RecorderStatus, RecordingController, SharedController};
pub use recorder::{StartOutcome, StopOutcome};

// Scheduler
pub use scheduler::{SchedulerConfig, SchedulerLoop, Transition};

// Upload
pub use upload::{TaskOutcome, UploadConfig, UploadWorker};
