//! One-shot fallback renderer.
//!
//! Each call runs a fresh `chromium --screenshot` with its own throwaway
//! profile. The child is always killed and reaped before returning, whatever
//! the outcome.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{timeout, Instant};
use uuid::Uuid;

use crate::error::RenderError;

use super::cdp::CHROME_ARGS;
use super::{Frame, FrameSource, FrameSourceKind, RenderTarget};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const VIRTUAL_TIME_BUDGET_MS: u32 = 10_000;

#[derive(Debug, Clone)]
pub struct ColdRenderer {
    browser_bin: String,
    width: u32,
    height: u32,
    timeout: Duration,
    scratch_dir: PathBuf,
}

impl ColdRenderer {
    pub fn new(browser_bin: impl Into<String>, width: u32, height: u32, timeout: Duration) -> Self {
        Self {
            browser_bin: browser_bin.into(),
            width,
            height,
            timeout,
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Directory for screenshot files and throwaway profiles.
    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = dir;
        self
    }

    pub async fn render_once(&self, target: &RenderTarget) -> Result<Frame, RenderError> {
        let url = target
            .browser_url()
            .ok_or_else(|| RenderError::Launch("target does not need a browser".into()))?;

        let run_id = Uuid::new_v4();
        let screenshot = self.scratch_dir.join(format!("pi-dashboard-cold-{run_id}.png"));
        let profile = self.scratch_dir.join(format!("pi-dashboard-cold-{run_id}"));

        let started = Instant::now();
        let result = self.capture(&url, &screenshot, &profile).await;

        let _ = tokio::fs::remove_file(&screenshot).await;
        let _ = tokio::fs::remove_dir_all(&profile).await;

        match &result {
            Ok(_) => log_info!(
                "cold render of {url} took {}ms",
                started.elapsed().as_millis()
            ),
            Err(err) => log_warn!("cold render of {url} failed: {err}"),
        }
        result
    }

    async fn capture(&self, url: &str, screenshot: &Path, profile: &Path) -> Result<Frame, RenderError> {
        let mut child = Command::new(&self.browser_bin)
            .args(CHROME_ARGS)
            .arg(format!("--virtual-time-budget={VIRTUAL_TIME_BUDGET_MS}"))
            .arg(format!("--window-size={},{}", self.width, self.height))
            .arg(format!("--user-data-dir={}", profile.display()))
            .arg(format!("--screenshot={}", screenshot.display()))
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| RenderError::Launch(format!("{}: {err}", self.browser_bin)))?;
        log_debug!("cold browser started (pid {:?})", child.id());

        let status = match timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                let _ = child.kill().await;
                return Err(RenderError::ProcessCrashed(err.to_string()));
            }
            Err(_) => {
                // kill() also reaps the child
                let _ = child.kill().await;
                return Err(RenderError::CaptureTimeout(self.timeout));
            }
        };

        if !status.success() {
            return Err(RenderError::ProcessCrashed(format!("browser exited with {status}")));
        }

        let bytes = tokio::fs::read(screenshot)
            .await
            .map_err(|err| RenderError::ProcessCrashed(format!("screenshot not written: {err}")))?;
        Frame::from_png(&bytes, FrameSourceKind::Cold)
    }
}

#[async_trait]
impl FrameSource for ColdRenderer {
    fn kind(&self) -> FrameSourceKind {
        FrameSourceKind::Cold
    }

    async fn render(&self, target: &RenderTarget) -> Result<Frame, RenderError> {
        self.render_once(target).await
    }
}
