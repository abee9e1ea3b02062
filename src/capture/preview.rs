//! MJPEG preview stream
//!
//! Preview processes write concatenated JPEG images to stdout. A reader task
//! splits the byte stream on SOI/EOI markers and keeps only the latest frame.

use bytes::Bytes;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Frame;
use crate::core::CameraError;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Drop buffered bytes if no complete image shows up within this size
const MAX_PENDING_BYTES: usize = 8 * 1024 * 1024;

/// Splits a byte stream into JPEG images
#[derive(Debug, Default)]
pub struct JpegSplitter {
    buf: Vec<u8>,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every image completed by them
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.buf, &SOI) else {
                // Keep a trailing 0xFF, it may be half of the next SOI
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                let len = self.buf.len();
                self.buf.drain(..len - keep);
                break;
            };

            let Some(end) = find(&self.buf[start + 2..], &EOI).map(|i| start + 2 + i + 2) else {
                self.buf.drain(..start);
                break;
            };

            frames.push(Bytes::copy_from_slice(&self.buf[start..end]));
            self.buf.drain(..end);
        }

        if self.buf.len() > MAX_PENDING_BYTES {
            warn!("Preview stream produced {} bytes without a frame, resetting", self.buf.len());
            self.buf.clear();
        }

        frames
    }

    /// Bytes held back waiting for the rest of an image
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A running preview process and its latest frame
pub struct PreviewStream {
    child: Child,
    latest: watch::Receiver<Option<Frame>>,
    reader: JoinHandle<()>,
}

impl PreviewStream {
    /// Spawn `command` and start collecting frames from its stdout
    pub fn spawn(mut command: Command, width: u32, height: u32) -> Result<Self, CameraError> {
        let mut child = command
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CameraError::Process("preview stdout not captured".to_string()))?;

        let (tx, latest) = watch::channel(None);

        let reader = tokio::spawn(async move {
            let mut splitter = JpegSplitter::new();
            let mut buf = vec![0u8; 64 * 1024];
            let mut frame_count = 0u64;

            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => {
                        debug!("Preview stream ended (EOF)");
                        break;
                    }
                    Ok(n) => {
                        for jpeg in splitter.push(&buf[..n]) {
                            frame_count += 1;
                            tx.send_replace(Some(Frame { jpeg, width, height }));
                        }
                    }
                    Err(e) => {
                        warn!("Error reading preview stream: {}", e);
                        break;
                    }
                }
            }

            // Readers must not see a stale frame from a dead process
            tx.send_replace(None);
            debug!("Preview reader finished after {} frames", frame_count);
        });

        Ok(Self {
            child,
            latest,
            reader,
        })
    }

    /// Latest frame, if any has arrived
    pub fn latest(&self) -> Option<Frame> {
        self.latest.borrow().clone()
    }

    /// Wait until the first frame arrives
    pub async fn wait_first_frame(&self, timeout: Duration) -> bool {
        let mut rx = self.latest.clone();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|frame| frame.is_some())).await,
            Ok(Ok(_))
        );
        ready
    }

    /// Whether the preview process is still running
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Stop the preview process
    pub async fn stop(mut self) {
        info!("Stopping preview");
        let _ = self.child.kill().await;
        self.reader.abort();
    }
}
