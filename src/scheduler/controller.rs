use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::loop_worker::UpdateScheduler;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

/// Start/stop handle for the continuous update loop.
pub struct SchedulerController {
    handle: Option<JoinHandle<UpdateScheduler>>,
    cancel_token: Option<CancellationToken>,
}

impl SchedulerController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(&mut self, mut scheduler: UpdateScheduler) -> Result<()> {
        if self.handle.is_some() {
            bail!("update loop already running");
        }

        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();
        let handle = tokio::spawn(async move {
            scheduler.run(token_clone).await;
            scheduler
        });

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Cancel the loop and release the browser and display. The cycle in
    /// flight is abandoned before it touches the device.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        let Some(handle) = self.handle.take() else {
            log_debug!("stop requested with no update loop running");
            return Ok(());
        };
        let scheduler = handle.await.context("update loop task failed to join")?;
        log_info!("update loop joined, shutting down render sources and display");
        scheduler.shutdown().await;
        Ok(())
    }
}

impl Default for SchedulerController {
    fn default() -> Self {
        Self::new()
    }
}
