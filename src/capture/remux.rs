//! Finalizing recordings
//!
//! Recorders write an intermediate file (raw H.264 or Matroska). On stop it
//! is remuxed losslessly into the target container. If ffmpeg fails or
//! hangs, the intermediate is renamed to the target name instead, so a
//! recording is never lost to a muxing problem.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::RecordingWriteError;

/// Intermediate extensions a recorder may leave behind
pub const INTERMEDIATE_EXTENSIONS: [&str; 2] = ["h264", "mkv"];

/// How to turn an intermediate file into the final artifact
#[derive(Debug, Clone)]
pub struct FinalizeSettings {
    /// ffmpeg binary
    pub ffmpeg: String,
    /// Upper bound for the remux
    pub remux_timeout: Duration,
    /// Outputs smaller than this are deleted
    pub min_output_bytes: u64,
    /// Declared framerate for container-less input (raw H.264)
    pub input_framerate: Option<u32>,
}

impl Default for FinalizeSettings {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            remux_timeout: Duration::from_secs(120),
            min_output_bytes: 64 * 1024,
            input_framerate: None,
        }
    }
}

/// Produce `target` from `raw`, returning it if it is large enough to keep.
pub async fn finalize_recording(raw: &Path, target: &Path, settings: &FinalizeSettings) -> Option<PathBuf> {
    if raw != target && tokio::fs::try_exists(raw).await.unwrap_or(false) {
        match remux(raw, target, settings).await {
            Ok(()) => {
                debug!("Remuxed {:?} -> {:?}", raw, target);
                if let Err(e) = tokio::fs::remove_file(raw).await {
                    warn!("Failed to remove intermediate {:?}: {}", raw, e);
                }
            }
            Err(e) => {
                warn!("{}; keeping the stream under the target name", e);
                let _ = tokio::fs::remove_file(target).await;
                if let Err(e) = tokio::fs::rename(raw, target).await {
                    warn!("Failed to rename {:?} -> {:?}: {}", raw, target, e);
                    return None;
                }
            }
        }
    }

    check_output(target, settings.min_output_bytes).await
}

async fn remux(raw: &Path, target: &Path, settings: &FinalizeSettings) -> Result<(), RecordingWriteError> {
    let mut command = Command::new(&settings.ffmpeg);
    command.args(["-hide_banner", "-loglevel", "error", "-y"]);
    if let Some(fps) = settings.input_framerate {
        command.args(["-framerate", fps.to_string().as_str()]);
    }
    command
        .arg("-i")
        .arg(raw)
        .args(["-c", "copy"])
        .arg(target)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let status = match tokio::time::timeout(settings.remux_timeout, command.status()).await {
        Ok(result) => result.map_err(|e| RecordingWriteError::Remux {
            path: raw.to_path_buf(),
            reason: format!("failed to run {}: {}", settings.ffmpeg, e),
        })?,
        Err(_) => return Err(RecordingWriteError::Timeout(raw.to_path_buf())),
    };

    if !status.success() {
        return Err(RecordingWriteError::Remux {
            path: raw.to_path_buf(),
            reason: format!("ffmpeg exited with {}", status),
        });
    }

    let written = tokio::fs::metadata(target).await.map(|m| m.len()).unwrap_or(0);
    if written == 0 {
        return Err(RecordingWriteError::Remux {
            path: raw.to_path_buf(),
            reason: "ffmpeg produced no output".to_string(),
        });
    }
    Ok(())
}

/// Keep `path` only if it exists and meets the size floor
pub async fn check_output(path: &Path, min_output_bytes: u64) -> Option<PathBuf> {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(_) => {
            warn!("Recording {:?} is missing", path);
            return None;
        }
    };

    if size < min_output_bytes {
        warn!(
            "Recording {:?} is too small ({} bytes < {}), discarding",
            path, size, min_output_bytes
        );
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Failed to remove {:?}: {}", path, e);
        }
        return None;
    }

    Some(path.to_path_buf())
}

/// Finalize whatever a crashed recorder left behind for `target`.
///
/// Prefers an intermediate file if one exists (the process died before the
/// remux), otherwise checks the target itself.
pub async fn recover_artifact(target: &Path, settings: &FinalizeSettings) -> Option<PathBuf> {
    for ext in INTERMEDIATE_EXTENSIONS {
        let raw = target.with_extension(ext);
        if raw == target || !tokio::fs::try_exists(&raw).await.unwrap_or(false) {
            continue;
        }
        info!("Recovering interrupted recording {:?}", raw);
        let mut settings = settings.clone();
        if ext != "h264" {
            settings.input_framerate = None;
        }
        return finalize_recording(&raw, target, &settings).await;
    }

    check_output(target, settings.min_output_bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> FinalizeSettings {
        FinalizeSettings {
            // Forces the rename fallback
            ffmpeg: "/nonexistent/ffmpeg".to_string(),
            remux_timeout: Duration::from_secs(5),
            min_output_bytes: 1024,
            input_framerate: Some(30),
        }
    }

    // ========== finalize_recording ==========

    #[tokio::test]
    async fn remux_failure_falls_back_to_rename() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("rec.h264");
        let target = dir.path().join("rec.mp4");
        std::fs::write(&raw, vec![7u8; 4096]).unwrap();

        let out = finalize_recording(&raw, &target, &settings()).await;

        assert_eq!(out.as_deref(), Some(target.as_path()));
        assert!(!raw.exists());
        assert_eq!(std::fs::read(&target).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn tiny_output_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("rec.h264");
        let target = dir.path().join("rec.mp4");
        std::fs::write(&raw, b"short").unwrap();

        assert!(finalize_recording(&raw, &target, &settings()).await.is_none());
        assert!(!target.exists());
        assert!(!raw.exists());
    }

    #[tokio::test]
    async fn nothing_written_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("rec.h264");
        let target = dir.path().join("rec.mp4");

        assert!(finalize_recording(&raw, &target, &settings()).await.is_none());
    }

    /// Install an executable shell script standing in for ffmpeg
    fn fake_ffmpeg(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn remux_timeout_falls_back_to_rename() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("rec.h264");
        let target = dir.path().join("rec.mp4");
        std::fs::write(&raw, vec![7u8; 4096]).unwrap();

        let settings = FinalizeSettings {
            ffmpeg: fake_ffmpeg(dir.path(), "exec sleep 30"),
            remux_timeout: Duration::from_millis(300),
            ..settings()
        };

        let started = std::time::Instant::now();
        let out = finalize_recording(&raw, &target, &settings).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(out.as_deref(), Some(target.as_path()));
        assert!(!raw.exists());
        assert_eq!(std::fs::read(&target).unwrap(), vec![7u8; 4096]);
    }

    #[tokio::test]
    async fn successful_remux_removes_intermediate() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("rec.h264");
        let target = dir.path().join("rec.mp4");
        std::fs::write(&raw, vec![3u8; 4096]).unwrap();

        // Copies the -i input to the last argument
        let copy = r#"while [ $# -gt 1 ]; do [ "$1" = "-i" ] && input="$2"; shift; done; cp "$input" "$1""#;
        let settings = FinalizeSettings {
            ffmpeg: fake_ffmpeg(dir.path(), copy),
            ..settings()
        };

        let out = finalize_recording(&raw, &target, &settings).await;

        assert_eq!(out.as_deref(), Some(target.as_path()));
        assert!(!raw.exists());
        assert_eq!(std::fs::read(&target).unwrap(), vec![3u8; 4096]);
    }

    // ========== recover_artifact ==========

    #[tokio::test]
    async fn recovers_intermediate() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("rec.mp4");
        std::fs::write(dir.path().join("rec.mkv"), vec![1u8; 2048]).unwrap();

        let out = recover_artifact(&target, &settings()).await;
        assert_eq!(out.as_deref(), Some(target.as_path()));
        assert!(!dir.path().join("rec.mkv").exists());
    }

    #[tokio::test]
    async fn recovers_finished_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("rec.mp4");
        std::fs::write(&target, vec![1u8; 2048]).unwrap();

        assert_eq!(recover_artifact(&target, &settings()).await, Some(target.clone()));
    }
}
