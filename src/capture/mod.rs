//! Camera capture
//!
//! This module owns the physical camera:
//! - Backend probing (Pi camera via libcamera first, then V4L2 devices)
//! - A low-resolution MJPEG preview kept running while idle
//! - Recording to a container file, with lossless remux on stop
//!
//! Every backend implements [`CameraDevice`]; the rest of the crate never
//! knows which one was chosen.

mod libcamera;
mod preview;
mod process;
pub mod remux;
mod v4l2;

#[cfg(any(test, feature = "test-source"))]
mod test_source;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::CameraError;

pub use libcamera::{Libcamera, LibcameraCamera};
pub use preview::{JpegSplitter, PreviewStream};
pub use process::{Launcher, ProcessCamera};
pub use remux::FinalizeSettings;
pub use v4l2::{V4l2, V4l2Camera};

#[cfg(any(test, feature = "test-source"))]
pub use test_source::{TestCamera, TestCameraConfig};

/// A single preview frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// JPEG-encoded image
    pub jpeg: Bytes,
    pub width: u32,
    pub height: u32,
}

/// Camera configuration
#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// Recording width in pixels
    pub record_width: u32,
    /// Recording height in pixels
    pub record_height: u32,
    /// Recording frames per second
    pub record_fps: u32,
    /// Preview width in pixels
    pub preview_width: u32,
    /// Preview height in pixels
    pub preview_height: u32,
    /// Preview frames per second
    pub preview_fps: u32,
    /// Directory finished recordings are written to
    pub output_dir: PathBuf,
    /// Target container extension
    pub container: String,
    /// Recordings smaller than this are discarded
    pub min_output_bytes: u64,
    /// Upper bound for the lossless remux
    pub remux_timeout: Duration,
    /// Upper bound for opening a backend and reading its first frame
    pub probe_timeout: Duration,
    /// How long a recorder gets to flush after SIGINT before it is killed
    pub stop_timeout: Duration,
    /// Device probed before the generic enumeration
    pub device_override: Option<String>,
    /// Generic video devices, probed in order
    pub video_devices: Vec<String>,
    /// libcamera recorder binaries, probed in order
    pub libcamera_programs: Vec<String>,
    /// ffmpeg binary used for V4L2 capture and remuxing
    pub ffmpeg: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            record_width: 1280,
            record_height: 720,
            record_fps: 30,
            preview_width: 640,
            preview_height: 480,
            preview_fps: 24,
            output_dir: PathBuf::from("/var/lib/smartcam/recordings"),
            container: "mp4".to_string(),
            min_output_bytes: 64 * 1024, // 64 KiB
            remux_timeout: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(10),
            device_override: None,
            video_devices: (0..8).map(|i| format!("/dev/video{}", i)).collect(),
            libcamera_programs: vec!["rpicam-vid".to_string(), "libcamera-vid".to_string()],
            ffmpeg: "ffmpeg".to_string(),
        }
    }
}

impl CameraConfig {
    /// Settings used to turn an intermediate file into the final artifact
    pub fn finalize_settings(&self, input_framerate: Option<u32>) -> FinalizeSettings {
        FinalizeSettings {
            ffmpeg: self.ffmpeg.clone(),
            remux_timeout: self.remux_timeout,
            min_output_bytes: self.min_output_bytes,
            input_framerate,
        }
    }

    /// Where a recording named `name` (or a timestamped default) is written
    pub fn target_path(&self, name: Option<&str>, now: DateTime<Utc>) -> PathBuf {
        match name {
            Some(name) if Path::new(name).extension().is_some() => self.output_dir.join(name),
            Some(name) => self.output_dir.join(format!("{}.{}", name, self.container)),
            None => self.output_dir.join(recording_filename(now, &self.container)),
        }
    }
}

/// `recording_<UTC YYYYMMDD_HHMMSS>.<container>`
pub fn recording_filename(now: DateTime<Utc>, container: &str) -> String {
    format!("recording_{}.{}", now.format("%Y%m%d_%H%M%S"), container)
}

/// Result of asking a camera to start recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingStart {
    /// A new recording was started at this path
    Started(PathBuf),
    /// A recording is already in progress at this path; nothing changed
    Busy(PathBuf),
}

impl RecordingStart {
    pub fn path(&self) -> &Path {
        match self {
            RecordingStart::Started(p) | RecordingStart::Busy(p) => p,
        }
    }
}

/// An exclusive, stateful camera
#[async_trait]
pub trait CameraDevice: Send {
    /// Human-readable backend name (for logs)
    fn backend(&self) -> String;

    /// Whether a recording is in progress
    fn is_recording(&self) -> bool;

    /// Latest preview frame, `None` while the preview is unavailable
    fn capture_frame(&self) -> Option<Frame>;

    /// Start recording, or report `Busy` if already recording
    async fn start_recording(&mut self, name: Option<&str>) -> Result<RecordingStart, CameraError>;

    /// Stop recording and return the finished file, if a usable one exists
    async fn stop_recording(&mut self) -> Result<Option<PathBuf>, CameraError>;

    /// Report a hardware fault observed since the last call
    async fn check_health(&mut self) -> Result<(), CameraError> {
        Ok(())
    }

    /// Stop everything and give the hardware back
    async fn release(&mut self);
}

/// Find a working camera.
///
/// libcamera programs are tried first, then the configured override device,
/// then the generic video devices in order. The first backend that opens and
/// produces a frame within `probe_timeout` wins.
pub async fn probe(config: &CameraConfig) -> Result<Box<dyn CameraDevice>, CameraError> {
    tokio::fs::create_dir_all(&config.output_dir).await?;

    let mut tried = Vec::new();

    for program in &config.libcamera_programs {
        tried.push(program.clone());
        match LibcameraCamera::open(Libcamera::new(program), config.clone()).await {
            Ok(camera) => {
                info!("Using camera backend: {}", camera.backend());
                return Ok(Box::new(camera));
            }
            Err(e) => debug!("Probe of {} failed: {}", program, e),
        }
    }

    let devices = config.device_override.iter().chain(
        config
            .video_devices
            .iter()
            .filter(|d| config.device_override.as_ref() != Some(*d)),
    );

    for device in devices {
        tried.push(device.clone());
        if !Path::new(device).exists() {
            continue;
        }
        match V4l2Camera::open(V4l2::new(device, &config.ffmpeg), config.clone()).await {
            Ok(camera) => {
                info!("Using camera backend: {}", camera.backend());
                return Ok(Box::new(camera));
            }
            Err(e) => warn!("Probe of {} failed: {}", device, e),
        }
    }

    Err(CameraError::NoCameraFound {
        tried: tried.join(", "),
    })
}
