//! Logger setup plus per-module gated logging macros.
//!
//! Modules that use the macros define a module-level flag:
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//! use crate::{log_info, log_warn};
//! log_info!("display updated in {}ms", 420);
//! ```
//! Flipping the flag to `false` silences a chatty module without touching
//! the global `RUST_LOG` filter.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// Errors are never gated; an unattended display has no other way to report.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        log::error!($($arg)*);
    };
}

/// Initialise `env_logger` once for the process.
///
/// `RUST_LOG` still wins for per-module filters. When `log_file` is set the
/// output goes to that file instead of stderr (appending).
pub fn init_logging(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).parse_default_env();

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    // A second init (tests, integration mode) is harmless.
    let _ = builder.try_init();
    Ok(())
}
