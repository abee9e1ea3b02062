//! Core types shared by every component
//!
//! - Booking windows and active-booking selection
//! - The fault taxonomy (camera, recording write, upload, source, store)

mod booking;
mod error;

pub use booking::{parse_clock_time, select_active, Booking};
pub use error::{
    CameraError, RecorderError, RecordingWriteError, SchedulerError, Severity, SourceError,
    StoreError, UploadError,
};
