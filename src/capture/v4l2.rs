//! Generic USB/V4L2 cameras via ffmpeg
//!
//! ffmpeg reads the device for both preview and recording. Recording goes
//! to Matroska first because it survives an interrupted encoder.

use std::path::Path;
use tokio::process::Command;

use super::{CameraConfig, Launcher, ProcessCamera};

/// V4L2 backend
pub type V4l2Camera = ProcessCamera<V4l2>;

/// Command lines for ffmpeg reading a `/dev/videoN` device
#[derive(Debug, Clone)]
pub struct V4l2 {
    device: String,
    ffmpeg: String,
}

impl V4l2 {
    pub fn new(device: impl Into<String>, ffmpeg: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ffmpeg: ffmpeg.into(),
        }
    }

    fn input(&self, width: u32, height: u32, fps: u32) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command.args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "v4l2",
            "-framerate",
            fps.to_string().as_str(),
            "-video_size",
            format!("{}x{}", width, height).as_str(),
            "-i",
            self.device.as_str(),
        ]);
        command
    }
}

impl Launcher for V4l2 {
    fn name(&self) -> String {
        format!("v4l2({})", self.device)
    }

    fn preview_command(&self, config: &CameraConfig) -> Command {
        let mut command = self.input(
            config.preview_width,
            config.preview_height,
            config.preview_fps,
        );
        command.args(["-f", "image2pipe", "-vcodec", "mjpeg", "-q:v", "5", "-"]);
        command
    }

    fn record_command(&self, config: &CameraConfig, raw: &Path) -> Command {
        let mut command = self.input(
            config.record_width,
            config.record_height,
            config.record_fps,
        );
        command.args([
            "-y",
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-pix_fmt",
            "yuv420p",
        ]);
        command.arg(raw);
        command
    }

    fn intermediate_extension(&self) -> &'static str {
        "mkv"
    }
}
