//! Hardware backend that delegates to an external panel driver program.
//!
//! Invocations (program and leading arguments come from `DISPLAY_DRIVER_CMD`):
//!
//! ```text
//! <cmd> init
//! <cmd> write --mode full|partial --x X --y Y --width W --height H --depth bw|gray16   (PGM on stdin)
//! <cmd> sleep
//! ```
//!
//! A write is complete once the program exits; a non-zero exit is a failed write.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::error::DisplayError;
use crate::processing::{ProcessedImage, Region};

use super::{encode_pgm, DeviceMode, DisplayBackend, RefreshMode};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

pub struct CommandBackend {
    program: String,
    base_args: Vec<String>,
    pending: Option<Child>,
}

impl CommandBackend {
    pub fn new(command_line: &str) -> Result<Self, DisplayError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| DisplayError::Unavailable("empty display driver command".into()))?;
        Ok(Self {
            program,
            base_args: parts.collect(),
            pending: None,
        })
    }

    fn command(&self, verb: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args).arg(verb).kill_on_drop(true);
        cmd
    }

    async fn run_to_completion(&self, verb: &str) -> Result<(), DisplayError> {
        let status = self
            .command(verb)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|err| DisplayError::Unavailable(format!("{}: {err}", self.program)))?;
        if status.success() {
            Ok(())
        } else {
            Err(DisplayError::Unavailable(format!(
                "display driver '{verb}' exited with {status}"
            )))
        }
    }
}

#[async_trait]
impl DisplayBackend for CommandBackend {
    fn mode(&self) -> DeviceMode {
        DeviceMode::Hardware
    }

    async fn open(&mut self) -> Result<(), DisplayError> {
        self.run_to_completion("init").await?;
        log_info!("display driver {} initialised", self.program);
        Ok(())
    }

    async fn write(
        &mut self,
        image: &ProcessedImage,
        mode: RefreshMode,
        region: Region,
    ) -> Result<(), DisplayError> {
        // a previous write abandoned by a timeout is killed on drop
        self.pending = None;

        let payload = encode_pgm(&image.crop(&region));
        let mut child = self
            .command("write")
            .args(["--mode", mode.as_str()])
            .arg("--x")
            .arg(region.x.to_string())
            .arg("--y")
            .arg(region.y.to_string())
            .arg("--width")
            .arg(region.width.to_string())
            .arg("--height")
            .arg(region.height.to_string())
            .args(["--depth", image.depth().as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|err| DisplayError::DeviceWriteFailed(format!("{}: {err}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DisplayError::DeviceWriteFailed("driver stdin unavailable".into()))?;
        stdin
            .write_all(&payload)
            .await
            .map_err(|err| DisplayError::DeviceWriteFailed(format!("sending image: {err}")))?;
        drop(stdin);

        log_debug!("sent {} bytes to display driver ({mode})", payload.len());
        self.pending = Some(child);
        Ok(())
    }

    async fn wait_ready(&mut self) -> Result<(), DisplayError> {
        let Some(mut child) = self.pending.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .await
            .map_err(|err| DisplayError::DeviceWriteFailed(err.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(DisplayError::DeviceWriteFailed(format!(
                "display driver exited with {status}"
            )))
        }
    }

    async fn close(&mut self) -> Result<(), DisplayError> {
        self.pending = None;
        self.run_to_completion("sleep").await
    }
}
