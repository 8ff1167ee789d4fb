//! Virtual panel. Goes through the same open/write/wait cycle as real
//! hardware, optionally saving every write as a PNG.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::DisplayError;
use crate::processing::{ProcessedImage, Region};

use super::{DeviceMode, DisplayBackend, RefreshMode};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockWrite {
    pub mode: RefreshMode,
    pub region: Region,
    pub content_hash: u64,
}

pub struct MockBackend {
    artifacts_dir: Option<PathBuf>,
    latency: Duration,
    failures_left: u32,
    writes: Arc<Mutex<Vec<MockWrite>>>,
    pending_ready: bool,
    opened: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            artifacts_dir: None,
            latency: Duration::ZERO,
            failures_left: 0,
            writes: Arc::new(Mutex::new(Vec::new())),
            pending_ready: false,
            opened: false,
        }
    }

    /// Save every written image (cropped to the refreshed region) here.
    pub fn with_artifacts(mut self, dir: PathBuf) -> Self {
        self.artifacts_dir = Some(dir);
        self
    }

    /// Simulated time the panel stays busy after each write.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `count` writes with `DeviceWriteFailed`.
    pub fn with_write_failures(mut self, count: u32) -> Self {
        self.failures_left = count;
        self
    }

    /// Shared log of successful writes; stays valid after the backend is boxed.
    pub fn writes(&self) -> Arc<Mutex<Vec<MockWrite>>> {
        Arc::clone(&self.writes)
    }

    fn save_artifact(&self, seq: usize, image: &ProcessedImage, mode: RefreshMode, region: Region) {
        let Some(dir) = &self.artifacts_dir else {
            return;
        };
        let path = dir.join(format!(
            "display_{seq:04}_{}_{mode}.png",
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        if let Err(err) = std::fs::create_dir_all(dir) {
            log_warn!("failed to create artifact directory {}: {err}", dir.display());
            return;
        }
        if let Err(err) = image.crop(&region).save(&path) {
            log_warn!("failed to save display artifact {}: {err}", path.display());
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DisplayBackend for MockBackend {
    fn mode(&self) -> DeviceMode {
        DeviceMode::Mock
    }

    async fn open(&mut self) -> Result<(), DisplayError> {
        self.opened = true;
        Ok(())
    }

    async fn write(
        &mut self,
        image: &ProcessedImage,
        mode: RefreshMode,
        region: Region,
    ) -> Result<(), DisplayError> {
        if !self.opened {
            return Err(DisplayError::Unavailable("mock display not opened".into()));
        }
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(DisplayError::DeviceWriteFailed("simulated write failure".into()));
        }

        log_debug!(
            "mock {mode} refresh of {}x{} at ({}, {})",
            region.width,
            region.height,
            region.x,
            region.y
        );
        let seq = self.writes.lock().map(|writes| writes.len() + 1).unwrap_or(0);
        self.save_artifact(seq, image, mode, region);
        if let Ok(mut writes) = self.writes.lock() {
            writes.push(MockWrite {
                mode,
                region,
                content_hash: image.content_hash(),
            });
        }
        self.pending_ready = true;
        Ok(())
    }

    async fn wait_ready(&mut self) -> Result<(), DisplayError> {
        if self.pending_ready {
            tokio::time::sleep(self.latency).await;
            self.pending_ready = false;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DisplayError> {
        self.opened = false;
        Ok(())
    }
}
