//! Frame acquisition: the persistent browser session, the cold fallback and
//! the built-in test pattern all produce [`Frame`]s through [`FrameSource`].

pub mod cdp;
pub mod cold;
pub mod pattern;
pub mod session;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::RenderError;

pub use cdp::ChromiumLauncher;
pub use cold::ColdRenderer;
pub use pattern::PatternSource;
pub use session::{RenderSession, SessionStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FrameSourceKind {
    Persistent,
    Cold,
    Pattern,
}

impl FrameSourceKind {
    /// Label used by the metrics exposition (`render_type`).
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameSourceKind::Persistent => "persistent_browser",
            FrameSourceKind::Cold => "standard",
            FrameSourceKind::Pattern => "pattern",
        }
    }
}

/// What to render. Content itself is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderTarget {
    Url(String),
    File(PathBuf),
    Pattern,
}

impl RenderTarget {
    /// URL handed to the browser; `None` for targets that need no browser.
    pub fn browser_url(&self) -> Option<String> {
        match self {
            RenderTarget::Url(url) => Some(url.clone()),
            RenderTarget::File(path) => Some(file_url(path)),
            RenderTarget::Pattern => None,
        }
    }
}

fn file_url(path: &Path) -> String {
    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    format!("file://{}", absolute.display())
}

/// Visible text a browser reported alongside a capture, used to check the
/// dashboard's clock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PageText {
    /// The source has no page to read (cold render, test pattern).
    #[default]
    NotCaptured,
    Unreadable(String),
    /// Clock element texts first, then the whole body text.
    Captured(Vec<String>),
}

/// A captured raster. Immutable once produced.
#[derive(Debug, Clone)]
pub struct Frame {
    image: DynamicImage,
    captured_at: DateTime<Utc>,
    source: FrameSourceKind,
    page_text: PageText,
}

impl Frame {
    pub fn new(image: DynamicImage, source: FrameSourceKind) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
            source,
            page_text: PageText::NotCaptured,
        }
    }

    pub fn with_page_text(mut self, page_text: PageText) -> Self {
        self.page_text = page_text;
        self
    }

    pub fn from_png(bytes: &[u8], source: FrameSourceKind) -> Result<Self, RenderError> {
        let image = image::load_from_memory_with_format(bytes, ImageFormat::Png)
            .map_err(|err| RenderError::Decode(err.to_string()))?;
        Ok(Self::new(image, source))
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn source(&self) -> FrameSourceKind {
        self.source
    }

    pub fn page_text(&self) -> &PageText {
        &self.page_text
    }
}

/// Anything the scheduler can ask for a frame.
#[async_trait]
pub trait FrameSource: Send + Sync {
    fn kind(&self) -> FrameSourceKind;

    /// Lifecycle checks evaluated at the top of every cycle.
    async fn maintain(&self, _now: Instant) -> Result<(), RenderError> {
        Ok(())
    }

    async fn render(&self, target: &RenderTarget) -> Result<Frame, RenderError>;

    async fn shutdown(&self) {}

    fn browser_pid(&self) -> Option<u32> {
        None
    }
}

/// Starts a browser showing `url` and returns once the page has loaded.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, url: &str) -> Result<Box<dyn BrowserProcess>, RenderError>;
}

/// A running browser owned by exactly one [`RenderSession`].
#[async_trait]
pub trait BrowserProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// PNG bytes of the current page.
    async fn screenshot(&mut self) -> Result<Vec<u8>, RenderError>;

    /// Texts of the page's `.time` and `.clock` elements, then its body text.
    async fn clock_text(&mut self) -> Result<Vec<String>, RenderError> {
        Ok(Vec::new())
    }

    /// Kill the process and wait until it has exited.
    async fn terminate(&mut self);
}
