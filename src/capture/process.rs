//! Subprocess-backed cameras
//!
//! Both hardware backends drive external programs: one long-running preview
//! process while idle, one recorder process while recording. Only one of the
//! two owns the device at any time. [`Launcher`] supplies the command lines,
//! [`ProcessCamera`] owns the lifecycle.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::remux::finalize_recording;
use super::{CameraConfig, CameraDevice, Frame, PreviewStream, RecordingStart};
use crate::core::CameraError;

/// Command lines for one backend
pub trait Launcher: Send + Sync {
    /// Name used in logs, e.g. `libcamera(rpicam-vid)`
    fn name(&self) -> String;

    /// MJPEG preview written to stdout at preview resolution
    fn preview_command(&self, config: &CameraConfig) -> Command;

    /// Recorder writing to `raw` at recording resolution
    fn record_command(&self, config: &CameraConfig, raw: &Path) -> Command;

    /// Extension of the file the recorder writes
    fn intermediate_extension(&self) -> &'static str;

    /// Framerate to declare when remuxing a container-less stream
    fn input_framerate(&self, _config: &CameraConfig) -> Option<u32> {
        None
    }
}

struct ActiveRecording {
    child: Child,
    raw: PathBuf,
    target: PathBuf,
}

/// Camera implemented by spawning preview and recorder processes
pub struct ProcessCamera<L: Launcher> {
    launcher: L,
    config: CameraConfig,
    preview: Option<PreviewStream>,
    recording: Option<ActiveRecording>,
}

impl<L: Launcher> ProcessCamera<L> {
    /// Start the preview and wait for one frame to prove the device works
    pub async fn open(launcher: L, config: CameraConfig) -> Result<Self, CameraError> {
        let mut camera = Self {
            launcher,
            config,
            preview: None,
            recording: None,
        };

        camera.start_preview()?;

        let ready = match &camera.preview {
            Some(preview) => preview.wait_first_frame(camera.config.probe_timeout).await,
            None => false,
        };

        if !ready {
            camera.stop_preview().await;
            return Err(CameraError::Open {
                device: camera.launcher.name(),
                reason: format!("no frame within {:?}", camera.config.probe_timeout),
            });
        }

        info!(
            "Opened {}: preview {}x{} @ {}fps",
            camera.launcher.name(),
            camera.config.preview_width,
            camera.config.preview_height,
            camera.config.preview_fps
        );
        Ok(camera)
    }

    fn start_preview(&mut self) -> Result<(), CameraError> {
        let command = self.launcher.preview_command(&self.config);
        let preview = PreviewStream::spawn(
            command,
            self.config.preview_width,
            self.config.preview_height,
        )?;
        self.preview = Some(preview);
        Ok(())
    }

    async fn stop_preview(&mut self) {
        if let Some(preview) = self.preview.take() {
            preview.stop().await;
        }
    }

    fn restart_preview(&mut self) {
        if let Err(e) = self.start_preview() {
            warn!("Failed to restart preview on {}: {}", self.launcher.name(), e);
        }
    }
}

#[async_trait]
impl<L: Launcher> CameraDevice for ProcessCamera<L> {
    fn backend(&self) -> String {
        self.launcher.name()
    }

    fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    fn capture_frame(&self) -> Option<Frame> {
        self.preview.as_ref().and_then(|p| p.latest())
    }

    async fn start_recording(&mut self, name: Option<&str>) -> Result<RecordingStart, CameraError> {
        if let Some(active) = &self.recording {
            return Ok(RecordingStart::Busy(active.target.clone()));
        }

        let target = self.config.target_path(name, Utc::now());
        let raw = target.with_extension(self.launcher.intermediate_extension());

        // The recorder needs the device to itself
        self.stop_preview().await;

        let mut command = self.launcher.record_command(&self.config, &raw);
        let spawned = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn recorder for {}: {}", self.launcher.name(), e);
                self.restart_preview();
                return Err(CameraError::Process(format!(
                    "failed to start recorder: {}",
                    e
                )));
            }
        };

        info!(
            "Recording started: {:?} ({}x{} @ {}fps)",
            target, self.config.record_width, self.config.record_height, self.config.record_fps
        );
        self.recording = Some(ActiveRecording {
            child,
            raw,
            target: target.clone(),
        });
        Ok(RecordingStart::Started(target))
    }

    async fn stop_recording(&mut self) -> Result<Option<PathBuf>, CameraError> {
        let Some(mut active) = self.recording.take() else {
            return Ok(None);
        };

        let status = interrupt_and_wait(&mut active.child, self.config.stop_timeout).await;
        debug!("Recorder exited: {:?}", status);

        let settings = self
            .config
            .finalize_settings(self.launcher.input_framerate(&self.config));
        let finished = finalize_recording(&active.raw, &active.target, &settings).await;

        self.restart_preview();

        match &finished {
            Some(path) => info!("Recording stopped: {:?}", path),
            None => warn!("Recording {:?} produced no usable output", active.target),
        }
        Ok(finished)
    }

    async fn check_health(&mut self) -> Result<(), CameraError> {
        if let Some(active) = &mut self.recording {
            if let Ok(Some(status)) = active.child.try_wait() {
                return Err(CameraError::Process(format!(
                    "{} recorder exited while recording: {}",
                    self.launcher.name(),
                    status
                )));
            }
            return Ok(());
        }

        let preview_dead = match &mut self.preview {
            Some(preview) => !preview.is_alive(),
            None => true,
        };
        if preview_dead {
            warn!("Preview on {} is not running, restarting", self.launcher.name());
            self.stop_preview().await;
            self.start_preview()?;
        }
        Ok(())
    }

    async fn release(&mut self) {
        if let Some(mut active) = self.recording.take() {
            warn!("Releasing camera with recording in progress: {:?}", active.target);
            interrupt_and_wait(&mut active.child, self.config.stop_timeout).await;
        }
        self.stop_preview().await;
        info!("Released {}", self.launcher.name());
    }
}

/// Ask a child to finish cleanly (SIGINT), killing it after `timeout`.
///
/// Recorders flush their container on SIGINT; SIGKILL leaves a truncated
/// file, which the remux/rename fallback still handles.
pub(crate) async fn interrupt_and_wait(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned and have not reaped yet
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!("Failed to wait for child: {}", e);
            None
        }
        Err(_) => {
            warn!("Child did not exit within {:?}, killing", timeout);
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits a tiny JPEG every 50ms
    const PREVIEW_SCRIPT: &str = r#"while :; do printf '\377\330x\377\331'; sleep 0.05; done"#;

    /// Writes 4 KiB to the path in $0, then records "forever"
    const RECORD_SCRIPT: &str = r#"head -c 4096 /dev/zero > "$0"; exec sleep 30"#;

    /// Writes 4 KiB and exits right away
    const CRASHING_RECORD_SCRIPT: &str = r#"head -c 4096 /dev/zero > "$0""#;

    struct ShellLauncher {
        /// `None` points the recorder at a missing binary
        record_script: Option<&'static str>,
    }

    impl Launcher for ShellLauncher {
        fn name(&self) -> String {
            "shell".to_string()
        }

        fn preview_command(&self, _config: &CameraConfig) -> Command {
            let mut command = Command::new("sh");
            command.args(["-c", PREVIEW_SCRIPT]);
            command
        }

        fn record_command(&self, _config: &CameraConfig, raw: &Path) -> Command {
            match self.record_script {
                Some(script) => {
                    let mut command = Command::new("sh");
                    command.arg("-c").arg(script).arg(raw);
                    command
                }
                None => Command::new("/nonexistent/recorder"),
            }
        }

        fn intermediate_extension(&self) -> &'static str {
            "h264"
        }
    }

    fn config(dir: &Path) -> CameraConfig {
        CameraConfig {
            preview_width: 320,
            preview_height: 240,
            output_dir: dir.to_path_buf(),
            // Forces the rename fallback when finalizing
            ffmpeg: "/nonexistent/ffmpeg".to_string(),
            min_output_bytes: 1024,
            probe_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    async fn open(dir: &Path, record_script: Option<&'static str>) -> ProcessCamera<ShellLauncher> {
        ProcessCamera::open(ShellLauncher { record_script }, config(dir))
            .await
            .unwrap()
    }

    async fn wait_for_frame(camera: &ProcessCamera<ShellLauncher>) -> Option<Frame> {
        for _ in 0..100 {
            if let Some(frame) = camera.capture_frame() {
                return Some(frame);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    async fn wait_for_size(path: &Path, size: u64) {
        for _ in 0..100 {
            if std::fs::metadata(path).map(|m| m.len() >= size).unwrap_or(false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{:?} never reached {} bytes", path, size);
    }

    // ========== open ==========

    #[tokio::test(flavor = "multi_thread")]
    async fn open_waits_for_preview_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = open(dir.path(), Some(RECORD_SCRIPT)).await;

        let frame = camera.capture_frame().unwrap();
        assert_eq!((frame.width, frame.height), (320, 240));
        assert_eq!(frame.jpeg.as_ref(), &[0xFF, 0xD8, b'x', 0xFF, 0xD9]);
        assert!(!camera.is_recording());

        camera.release().await;
    }

    // ========== recording lifecycle ==========

    #[tokio::test(flavor = "multi_thread")]
    async fn record_stop_and_resume_preview() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = open(dir.path(), Some(RECORD_SCRIPT)).await;

        let target = match camera.start_recording(Some("clip")).await.unwrap() {
            RecordingStart::Started(path) => path,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(target, dir.path().join("clip.mp4"));
        assert!(camera.is_recording());
        // Preview is suspended while the recorder owns the device
        assert!(camera.capture_frame().is_none());

        let raw = dir.path().join("clip.h264");
        wait_for_size(&raw, 4096).await;
        camera.check_health().await.unwrap();

        let finished = camera.stop_recording().await.unwrap();
        assert_eq!(finished.as_deref(), Some(target.as_path()));
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 4096);
        assert!(!raw.exists());
        assert!(!camera.is_recording());

        let frame = wait_for_frame(&camera).await.expect("preview did not resume");
        assert_eq!((frame.width, frame.height), (320, 240));

        camera.release().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_start_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = open(dir.path(), Some(RECORD_SCRIPT)).await;

        let first = camera.start_recording(Some("clip")).await.unwrap();
        let second = camera.start_recording(Some("other")).await.unwrap();

        assert_eq!(second, RecordingStart::Busy(first.path().to_path_buf()));
        assert!(!dir.path().join("other.h264").exists());

        wait_for_size(&dir.path().join("clip.h264"), 4096).await;
        assert!(camera.stop_recording().await.unwrap().is_some());
        assert_eq!(camera.stop_recording().await.unwrap(), None);

        camera.release().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recorder_exit_is_a_health_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = open(dir.path(), Some(CRASHING_RECORD_SCRIPT)).await;

        camera.start_recording(Some("clip")).await.unwrap();

        let mut fault = None;
        for _ in 0..100 {
            if let Err(e) = camera.check_health().await {
                fault = Some(e);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(matches!(fault, Some(CameraError::Process(_))));

        // Whatever was written is still finalized
        let finished = camera.stop_recording().await.unwrap();
        assert_eq!(finished, Some(dir.path().join("clip.mp4")));

        camera.release().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recorder_spawn_failure_restores_preview() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = open(dir.path(), None).await;

        let err = camera.start_recording(Some("clip")).await.unwrap_err();
        assert!(matches!(err, CameraError::Process(_)));
        assert!(!camera.is_recording());

        assert!(wait_for_frame(&camera).await.is_some());
        camera.release().await;
    }

    // ========== interrupt_and_wait ==========

    #[tokio::test]
    async fn interrupt_stops_sleeping_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let started = std::time::Instant::now();
        let status = interrupt_and_wait(&mut child, Duration::from_secs(5)).await;
        assert!(status.is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
