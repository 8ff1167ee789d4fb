//! E-ink panel access: the backend capability interface, its mock and
//! hardware implementations, and the controller that owns the device.

pub mod command;
pub mod controller;
pub mod mock;
pub mod state;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DisplayError;
use crate::processing::{ProcessedImage, Region};

pub use command::CommandBackend;
pub use controller::{Ack, ControllerState, DisplayController, DisplayPolicy};
pub use mock::MockBackend;
pub use state::{DisplayDeviceState, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    Partial,
    Full,
}

impl RefreshMode {
    /// Label used by the metrics exposition (`refresh_type`).
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshMode::Partial => "partial",
            RefreshMode::Full => "full",
        }
    }
}

impl fmt::Display for RefreshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    Mock,
    Hardware,
}

/// What the controller needs from a panel driver.
///
/// `write` hands over the whole image plus the region to refresh; a full
/// refresh always passes the whole surface. Readiness is signalled
/// separately so the controller can bound the wait.
#[async_trait]
pub trait DisplayBackend: Send {
    fn mode(&self) -> DeviceMode;

    async fn open(&mut self) -> Result<(), DisplayError>;

    async fn write(
        &mut self,
        image: &ProcessedImage,
        mode: RefreshMode,
        region: Region,
    ) -> Result<(), DisplayError>;

    async fn wait_ready(&mut self) -> Result<(), DisplayError>;

    async fn close(&mut self) -> Result<(), DisplayError>;
}

/// Binary PGM (P5) encoding of a grayscale image or region.
pub fn encode_pgm(pixels: &image::GrayImage) -> Vec<u8> {
    let (w, h) = pixels.dimensions();
    let mut out = format!("P5\n{w} {h}\n255\n").into_bytes();
    out.extend_from_slice(pixels.as_raw());
    out
}
