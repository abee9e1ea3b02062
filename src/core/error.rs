//! Error taxonomy
//!
//! Every fault class maps to a [`Severity`] so long-running loops can decide
//! whether to retry on the next tick, restart the affected subsystem from its
//! persisted state, or give up on the process entirely.

use std::path::PathBuf;
use thiserror::Error;

/// How a fault should be handled by the loop that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Local to one tick or one attempt; try again later
    RetryTick,
    /// Invariants of one subsystem are in doubt; reset it from persisted state
    RestartSubsystem,
    /// The process cannot continue
    Fatal,
}

/// Camera open/read failures
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("no working camera found (tried: {tried})")]
    NoCameraFound { tried: String },

    #[error("failed to open camera {device}: {reason}")]
    Open { device: String, reason: String },

    #[error("camera process failed: {0}")]
    Process(String),

    #[error("camera I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    pub fn severity(&self) -> Severity {
        match self {
            CameraError::NoCameraFound { .. } | CameraError::Open { .. } => Severity::Fatal,
            CameraError::Process(_) | CameraError::Io(_) => Severity::RestartSubsystem,
        }
    }
}

/// Encoder/container failures while finalizing a recording.
///
/// Never fatal for the artifact: the caller falls back to renaming the
/// intermediate file.
#[derive(Debug, Error)]
pub enum RecordingWriteError {
    #[error("remux of {path:?} failed: {reason}")]
    Remux { path: PathBuf, reason: String },

    #[error("remux of {0:?} timed out")]
    Timeout(PathBuf),

    #[error("recording file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Booking source unreachable or returned garbage
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("booking source request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("booking source rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("booking source returned invalid data: {0}")]
    Decode(String),

    #[error("booking source unavailable: {0}")]
    Unavailable(String),
}

impl SourceError {
    pub fn severity(&self) -> Severity {
        Severity::RetryTick
    }
}

/// Network or remote-service failure while shipping a recording
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("local file {0:?} is missing")]
    MissingFile(PathBuf),

    #[error("upload request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("remote service unavailable: {0}")]
    Unavailable(String),

    #[error("failed to release booking: {0}")]
    Release(#[from] SourceError),
}

impl UploadError {
    /// A missing local file can never be uploaded, however often we retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, UploadError::MissingFile(_))
    }

    pub fn severity(&self) -> Severity {
        Severity::RetryTick
    }
}

/// Local persistence failure in the artifact store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode store state: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn severity(&self) -> Severity {
        Severity::RestartSubsystem
    }
}

/// Failure of a recording controller operation
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RecorderError {
    pub fn severity(&self) -> Severity {
        match self {
            RecorderError::Camera(e) => e.severity(),
            RecorderError::Store(e) => e.severity(),
        }
    }
}

/// Failure of a single scheduler tick
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Recorder(#[from] RecorderError),
}

impl SchedulerError {
    pub fn severity(&self) -> Severity {
        match self {
            SchedulerError::Source(e) => e.severity(),
            SchedulerError::Recorder(e) => e.severity(),
        }
    }
}
