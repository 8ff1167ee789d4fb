//! Wiring from [`Settings`] to a ready-to-run [`UpdateScheduler`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::display::{CommandBackend, DisplayBackend, DisplayController, MockBackend, StateStore};
use crate::metrics::MetricsCollector;
use crate::processing::FrameProcessor;
use crate::render::{ChromiumLauncher, ColdRenderer, FrameSource, PatternSource, RenderSession, RenderTarget};
use crate::scheduler::{UpdatePolicy, UpdateScheduler};
use crate::settings::Settings;

const ENABLE_LOGS: bool = true;

use crate::log_info;

/// Primary and fallback frame sources for the configured target.
pub fn frame_sources(
    settings: &Settings,
    policy: &UpdatePolicy,
) -> (Arc<dyn FrameSource>, Option<Arc<dyn FrameSource>>) {
    let (width, height) = settings.browser_size();
    match settings.render_target() {
        RenderTarget::Pattern => (Arc::new(PatternSource::new(width, height)), None),
        RenderTarget::Url(_) | RenderTarget::File(_) => {
            let launcher = ChromiumLauncher::new(&settings.browser_bin, width, height)
                .with_profile_dir(settings.state_dir.join("chromium-profile"))
                .with_startup_timeout(policy.render_timeout);
            let session = RenderSession::new(Arc::new(launcher), policy.session_config());
            let cold = ColdRenderer::new(&settings.browser_bin, width, height, policy.render_timeout);
            (Arc::new(session), Some(Arc::new(cold)))
        }
    }
}

/// `artifacts` is only honoured by the mock display.
pub fn display_backend(settings: &Settings, artifacts: Option<PathBuf>) -> Result<Box<dyn DisplayBackend>> {
    if settings.is_mock_display() {
        let mut backend = MockBackend::new();
        if let Some(dir) = artifacts {
            backend = backend.with_artifacts(dir);
        }
        return Ok(Box::new(backend));
    }

    let command = settings
        .display_driver_cmd
        .as_deref()
        .with_context(|| {
            format!(
                "display type '{}' needs DISPLAY_DRIVER_CMD (or use --display mock)",
                settings.display_type
            )
        })?;
    Ok(Box::new(CommandBackend::new(command)?))
}

pub async fn open_display(
    settings: &Settings,
    policy: &UpdatePolicy,
    artifacts: Option<PathBuf>,
) -> Result<Arc<DisplayController>> {
    let backend = display_backend(settings, artifacts)?;
    let display_policy =
        policy.display_policy(settings.display_width, settings.display_height, settings.epd_mode);
    let controller = DisplayController::open(
        backend,
        display_policy,
        Some(StateStore::new(settings.state_file())),
    )
    .await
    .with_context(|| format!("failed to open {} display", settings.display_type))?;
    Ok(Arc::new(controller))
}

pub async fn build_scheduler(
    settings: &Settings,
    metrics: MetricsCollector,
    artifacts: Option<PathBuf>,
) -> Result<UpdateScheduler> {
    let policy = settings.update_policy();
    let display = open_display(settings, &policy, artifacts).await?;
    let (primary, fallback) = frame_sources(settings, &policy);
    log_info!(
        "rendering {:?} with {:?} source onto {}x{} {} display",
        settings.render_target(),
        primary.kind(),
        settings.display_width,
        settings.display_height,
        settings.display_type
    );

    Ok(UpdateScheduler::new(
        primary,
        fallback,
        settings.render_target(),
        FrameProcessor::new(
            settings.display_width,
            settings.display_height,
            settings.display_rotation,
            settings.epd_mode,
        ),
        display,
        metrics,
        policy,
    ))
}
