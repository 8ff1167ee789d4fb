use std::time::Duration;

use thiserror::Error;

/// Failures on the render side of a cycle.
///
/// Every variant is recoverable: the scheduler either falls back to a cold
/// render within the same cycle or tries again on the next tick.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("browser did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("screenshot not produced within {0:?}")]
    CaptureTimeout(Duration),

    #[error("browser process crashed: {0}")]
    ProcessCrashed(String),

    #[error("a capture is already in flight")]
    SessionBusy,

    #[error("render session is not ready")]
    NotReady,

    #[error("failed to launch browser: {0}")]
    Launch(String),

    #[error("screenshot could not be decoded: {0}")]
    Decode(String),

    #[error("devtools protocol error: {0}")]
    Protocol(String),
}

impl RenderError {
    /// Short stable label used in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::StartupTimeout(_) => "startup_timeout",
            RenderError::CaptureTimeout(_) => "capture_timeout",
            RenderError::ProcessCrashed(_) => "process_crashed",
            RenderError::SessionBusy => "session_busy",
            RenderError::NotReady => "not_ready",
            RenderError::Launch(_) => "launch",
            RenderError::Decode(_) => "decode",
            RenderError::Protocol(_) => "protocol",
        }
    }
}

/// Failures on the display side of a cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DisplayError {
    #[error("device did not report ready within {0:?}")]
    DeviceBusyTimeout(Duration),

    #[error("device write failed: {0}")]
    DeviceWriteFailed(String),

    #[error("image is {actual_width}x{actual_height}, display expects {width}x{height}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("display unavailable: {0}")]
    Unavailable(String),
}

impl DisplayError {
    pub fn kind(&self) -> &'static str {
        match self {
            DisplayError::DeviceBusyTimeout(_) => "device_busy_timeout",
            DisplayError::DeviceWriteFailed(_) => "device_write_failed",
            DisplayError::DimensionMismatch { .. } => "dimension_mismatch",
            DisplayError::Unavailable(_) => "unavailable",
        }
    }
}

/// Cycle-level failures. These end a single cycle, never the service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CycleError {
    #[error("render exhausted (primary: {primary}; fallback: {fallback:?})")]
    RenderExhausted {
        primary: RenderError,
        fallback: Option<RenderError>,
    },

    #[error("display exhausted after {attempts} attempts: {last}")]
    DisplayExhausted { attempts: u32, last: DisplayError },

    #[error("cycle abandoned by shutdown")]
    Cancelled,
}

impl CycleError {
    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::RenderExhausted { .. } => "render_exhausted",
            CycleError::DisplayExhausted { .. } => "display_exhausted",
            CycleError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable_labels() {
        assert_eq!(RenderError::SessionBusy.kind(), "session_busy");
        assert_eq!(
            DisplayError::DeviceBusyTimeout(Duration::from_secs(1)).kind(),
            "device_busy_timeout"
        );
        let err = CycleError::RenderExhausted {
            primary: RenderError::NotReady,
            fallback: Some(RenderError::Launch("no chromium".into())),
        };
        assert_eq!(err.kind(), "render_exhausted");
        assert!(err.to_string().contains("no chromium"));
    }
}
