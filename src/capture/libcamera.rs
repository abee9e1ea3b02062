//! Pi camera module via libcamera
//!
//! Uses `rpicam-vid` (or the older `libcamera-vid`) for both the MJPEG
//! preview and H.264 recording. The recorder writes a raw Annex B stream
//! that is remuxed into the target container on stop.

use std::path::Path;
use tokio::process::Command;

use super::{CameraConfig, Launcher, ProcessCamera};

/// Pi camera backend
pub type LibcameraCamera = ProcessCamera<Libcamera>;

/// Command lines for `rpicam-vid` / `libcamera-vid`
#[derive(Debug, Clone)]
pub struct Libcamera {
    program: String,
}

impl Libcamera {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, width: u32, height: u32, fps: u32) -> Command {
        let mut command = Command::new(&self.program);
        command.args([
            "-t",
            "0", // Run indefinitely
            "-n", // No preview window
            "--width",
            width.to_string().as_str(),
            "--height",
            height.to_string().as_str(),
            "--framerate",
            fps.to_string().as_str(),
        ]);
        command
    }
}

impl Launcher for Libcamera {
    fn name(&self) -> String {
        format!("libcamera({})", self.program)
    }

    fn preview_command(&self, config: &CameraConfig) -> Command {
        let mut command = self.command(
            config.preview_width,
            config.preview_height,
            config.preview_fps,
        );
        command.args(["--codec", "mjpeg", "-o", "-"]);
        command
    }

    fn record_command(&self, config: &CameraConfig, raw: &Path) -> Command {
        let mut command = self.command(
            config.record_width,
            config.record_height,
            config.record_fps,
        );
        // Repeat SPS/PPS so a truncated stream is still decodable
        command.args(["--codec", "h264", "--inline", "--flush", "-o"]);
        command.arg(raw);
        command
    }

    fn intermediate_extension(&self) -> &'static str {
        "h264"
    }

    fn input_framerate(&self, config: &CameraConfig) -> Option<u32> {
        Some(config.record_fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(command: &Command) -> Vec<String> {
        command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn preview_streams_mjpeg_to_stdout() {
        let launcher = Libcamera::new("rpicam-vid");
        let args = args(&launcher.preview_command(&CameraConfig::default()));
        assert!(args.windows(2).any(|w| w == ["--codec", "mjpeg"]));
        assert!(args.windows(2).any(|w| w == ["--width", "640"]));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn recorder_writes_inline_h264() {
        let launcher = Libcamera::new("libcamera-vid");
        let raw = Path::new("/rec/recording_20261019_100000.h264");
        let args = args(&launcher.record_command(&CameraConfig::default(), raw));
        assert!(args.contains(&"--inline".to_string()));
        assert!(args.windows(2).any(|w| w == ["--width", "1280"]));
        assert_eq!(args.last().map(String::as_str), Some(raw.to_str().unwrap()));
        assert_eq!(launcher.input_framerate(&CameraConfig::default()), Some(30));
    }
}
