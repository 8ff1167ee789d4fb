use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::app;
use crate::cli::{Cli, Commands};
use crate::display::Ack;
use crate::integration;
use crate::metrics::{exporter, CycleOutcome, CycleResult, MetricsCollector};
use crate::scheduler::SchedulerController;
use crate::settings::{DashboardType, Settings};
use crate::utils::logging::init_logging;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

pub async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut settings);

    let mut checked = settings.clone();
    if !cli.needs_content() {
        checked.dashboard_type = DashboardType::Pattern;
    }
    checked.validate()?;

    init_logging(settings.debug, settings.log_file.as_deref())?;
    log_info!(
        "pi-dashboard {} starting ({:?}, {} display)",
        env!("CARGO_PKG_VERSION"),
        cli.command(),
        settings.display_type
    );

    match cli.command() {
        Commands::Test | Commands::Update => one_shot(&settings).await,
        Commands::Run => {
            run_continuous(&settings).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::IntegrationTest { .. } => run_integration(&settings).await,
        Commands::Clear => {
            clear(&settings).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// One forced-full cycle; the exit status carries the outcome.
async fn one_shot(settings: &Settings) -> Result<ExitCode> {
    let metrics = MetricsCollector::new(Duration::from_secs(settings.update_interval_secs));
    let mut scheduler = app::build_scheduler(settings, metrics, None).await?;
    let result = scheduler.run_once(true).await;
    scheduler.shutdown().await;
    Ok(exit_code(&result))
}

fn exit_code(result: &CycleResult) -> ExitCode {
    if result.outcome.is_success() {
        log_info!("update completed in {}ms", result.durations.total_ms);
        return ExitCode::SUCCESS;
    }
    let detail = result.error.as_deref().unwrap_or("no detail");
    eprintln!("update failed ({}): {detail}", result.outcome.as_str());
    log_error!("update failed ({}): {detail}", result.outcome.as_str());
    ExitCode::from(match result.outcome {
        CycleOutcome::RenderFailed => 2,
        CycleOutcome::DisplayFailed => 3,
        CycleOutcome::Success | CycleOutcome::Skipped => 1,
    })
}

async fn run_continuous(settings: &Settings) -> Result<()> {
    let metrics = MetricsCollector::new(Duration::from_secs(settings.update_interval_secs));
    let scheduler = app::build_scheduler(settings, metrics.clone(), None).await?;

    let exporter_cancel = CancellationToken::new();
    let exporter = if settings.prometheus_enabled {
        match exporter::spawn_exporter(settings.prometheus_port, metrics, exporter_cancel.clone()).await {
            Ok(handle) => Some(handle),
            Err(err) => {
                log_warn!("metrics endpoint disabled: {err:#}");
                None
            }
        }
    } else {
        None
    };

    let mut controller = SchedulerController::new();
    controller.start(scheduler)?;

    shutdown_signal().await;
    log_info!("stop requested, finishing up");

    controller.stop().await?;
    exporter_cancel.cancel();
    if let Some(handle) = exporter {
        handle.await.context("metrics endpoint task failed to join")?;
    }
    Ok(())
}

async fn run_integration(settings: &Settings) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            log_warn!("integration run interrupted");
            cancel.cancel();
        })
    };

    let report = integration::run_integration(settings, &cancel).await;
    watcher.abort();
    let report = report?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.validation.overall_pass {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn clear(settings: &Settings) -> Result<()> {
    let display = app::open_display(settings, &settings.update_policy(), None).await?;
    let ack = display.clear().await.context("failed to clear display")?;
    if let Ack::Refreshed { refresh_counter, .. } = ack {
        log_info!("display cleared (refresh #{refresh_counter})");
    }
    display.close().await.context("failed to close display")?;
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log_warn!("failed to listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log_warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
