//! Synthetic camera for development without hardware
//!
//! Recordings are plain files filled with a deterministic byte pattern that
//! grows while "recording"; preview frames are a tiny constant JPEG shell.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::remux::check_output;
use super::{CameraConfig, CameraDevice, Frame, RecordingStart};
use crate::core::CameraError;

/// Configuration for the synthetic camera
#[derive(Debug, Clone)]
pub struct TestCameraConfig {
    /// Bytes written when a recording starts
    pub initial_bytes: usize,
    /// Bytes appended per tick while recording
    pub chunk_bytes: usize,
    /// Append interval
    pub chunk_interval: Duration,
}

impl Default for TestCameraConfig {
    fn default() -> Self {
        Self {
            initial_bytes: 128 * 1024, // Above the default size floor
            chunk_bytes: 16 * 1024,
            chunk_interval: Duration::from_millis(500),
        }
    }
}

struct ActiveRecording {
    path: PathBuf,
    cancel: CancellationToken,
    writer: JoinHandle<()>,
}

/// Camera that writes synthetic recordings
pub struct TestCamera {
    config: CameraConfig,
    source: TestCameraConfig,
    recording: Option<ActiveRecording>,
}

impl TestCamera {
    pub fn new(config: CameraConfig, source: TestCameraConfig) -> Self {
        info!(
            "Test camera: {}B initial, {}B every {:?}",
            source.initial_bytes, source.chunk_bytes, source.chunk_interval
        );
        Self {
            config,
            source,
            recording: None,
        }
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
}

#[async_trait]
impl CameraDevice for TestCamera {
    fn backend(&self) -> String {
        "test-source".to_string()
    }

    fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    fn capture_frame(&self) -> Option<Frame> {
        let mut jpeg = vec![0xFF, 0xD8];
        jpeg.extend_from_slice(b"smartcam-test-frame");
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        Some(Frame {
            jpeg: Bytes::from(jpeg),
            width: self.config.preview_width,
            height: self.config.preview_height,
        })
    }

    async fn start_recording(&mut self, name: Option<&str>) -> Result<RecordingStart, CameraError> {
        if let Some(active) = &self.recording {
            return Ok(RecordingStart::Busy(active.path.clone()));
        }

        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let path = self.config.target_path(name, Utc::now());
        tokio::fs::write(&path, pattern(self.source.initial_bytes, 0)).await?;

        let cancel = CancellationToken::new();
        let writer = {
            let cancel = cancel.clone();
            let path = path.clone();
            let source = self.source.clone();
            tokio::spawn(async move {
                let mut chunks = 0u8;
                let mut interval = tokio::time::interval(source.chunk_interval);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            chunks = chunks.wrapping_add(1);
                            let appended = async {
                                let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await?;
                                file.write_all(&pattern(source.chunk_bytes, chunks)).await?;
                                file.flush().await
                            };
                            if let Err(e) = appended.await {
                                debug!("Test recording append failed: {}", e);
                                break;
                            }
                        }
                    }
                }
            })
        };

        info!("Test recording started: {:?}", path);
        self.recording = Some(ActiveRecording {
            path: path.clone(),
            cancel,
            writer,
        });
        Ok(RecordingStart::Started(path))
    }

    async fn stop_recording(&mut self) -> Result<Option<PathBuf>, CameraError> {
        let Some(active) = self.recording.take() else {
            return Ok(None);
        };
        active.cancel.cancel();
        let _ = active.writer.await;

        let finished = check_output(&active.path, self.config.min_output_bytes).await;
        info!("Test recording stopped: {:?}", finished);
        Ok(finished)
    }

    async fn release(&mut self) {
        if let Some(active) = self.recording.take() {
            active.cancel.cancel();
            let _ = active.writer.await;
        }
    }
}
