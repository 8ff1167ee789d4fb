//! Timed end-to-end run against a generated local page and the mock display,
//! producing a JSON performance report and a pass/fail verdict.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::app;
use crate::display::RefreshMode;
use crate::metrics::{CycleResult, MetricsCollector};
use crate::settings::{DashboardType, Settings};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const TARGET_SUCCESS_RATE: f64 = 95.0;
const TARGET_AVG_TOTAL_MS: f64 = 2_000.0;
const TARGET_SCREENSHOT_RATIO: f64 = 0.9;

const TEST_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>pi-dashboard integration test</title>
<style>
  html, body { margin: 0; width: __WIDTH__px; height: __HEIGHT__px; background: #fff; color: #000; }
  body { font-family: sans-serif; display: flex; flex-direction: column; align-items: center; justify-content: center; }
  #clock { font-size: 64px; font-weight: bold; }
  #counter { font-size: 32px; margin-top: 16px; }
  #bar { width: 80%; height: 24px; border: 2px solid #000; margin-top: 16px; }
  #fill { height: 100%; background: #000; width: 0; }
</style>
</head>
<body>
<div id="clock">--:--:--</div>
<div id="counter">updates: 0</div>
<div id="bar"><div id="fill"></div></div>
<script>
  var count = 0;
  function tick() {
    var now = new Date();
    document.getElementById('clock').textContent = now.toTimeString().slice(0, 8);
    document.getElementById('counter').textContent = 'updates: ' + count;
    document.getElementById('fill').style.width = (now.getSeconds() / 59 * 100) + '%';
    count += 1;
  }
  tick();
  setInterval(tick, 1000);
</script>
</body>
</html>
"#;

/// Directory layout of one run: `<results>/<run-id>/{screenshots,logs,reports}`.
#[derive(Debug, Clone)]
pub struct IntegrationRun {
    pub id: Uuid,
    pub root: PathBuf,
    pub screenshots: PathBuf,
    pub logs: PathBuf,
    pub reports: PathBuf,
}

impl IntegrationRun {
    pub fn create(results_dir: &Path) -> Result<Self> {
        let id = Uuid::new_v4();
        let root = results_dir.join(id.to_string());
        let run = Self {
            id,
            screenshots: root.join("screenshots"),
            logs: root.join("logs"),
            reports: root.join("reports"),
            root,
        };
        for dir in [&run.screenshots, &run.logs, &run.reports] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(run)
    }

    pub fn write_test_page(&self, width: u32, height: u32) -> Result<PathBuf> {
        let path = self.root.join("test_dashboard.html");
        let html = TEST_PAGE
            .replace("__WIDTH__", &width.to_string())
            .replace("__HEIGHT__", &height.to_string());
        fs::write(&path, html).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn screenshot_count(&self) -> usize {
        fs::read_dir(&self.screenshots)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "png"))
                    .count()
            })
            .unwrap_or(0)
    }

    /// `reports/summary.json`, `reports/cycles.json` and `logs/cycles.log`.
    pub fn write_reports(&self, report: &IntegrationReport, cycles: &[CycleResult]) -> Result<()> {
        let summary = self.reports.join("summary.json");
        fs::write(&summary, serde_json::to_string_pretty(report)?)
            .with_context(|| format!("failed to write {}", summary.display()))?;

        let detail = self.reports.join("cycles.json");
        fs::write(&detail, serde_json::to_string_pretty(cycles)?)
            .with_context(|| format!("failed to write {}", detail.display()))?;

        let log = self.logs.join("cycles.log");
        fs::write(&log, cycle_log(cycles)).with_context(|| format!("failed to write {}", log.display()))?;
        Ok(())
    }
}

fn cycle_log(cycles: &[CycleResult]) -> String {
    let mut out = String::new();
    for (index, cycle) in cycles.iter().enumerate() {
        let _ = write!(
            out,
            "#{:04} {} {} render={}ms process={}ms display={}ms total={}ms",
            index + 1,
            cycle.timestamp.to_rfc3339(),
            cycle.outcome.as_str(),
            cycle.durations.render_ms,
            cycle.durations.process_ms,
            cycle.durations.display_ms,
            cycle.durations.total_ms,
        );
        if let Some(mode) = cycle.refresh_mode {
            let _ = write!(out, " refresh={mode}");
        }
        if let Some(err) = &cycle.error {
            let _ = write!(out, " error=\"{err}\"");
        }
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub duration_secs: u64,
    pub interval_secs: u64,
    pub display_width: u32,
    pub display_height: u32,
    pub collect_artifacts: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResults {
    pub total_cycles: usize,
    pub successful_cycles: usize,
    pub failed_cycles: usize,
    /// Percent, 0..=100.
    pub success_rate: f64,
    pub total_duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl StageStats {
    fn from_samples(samples: &[u64]) -> Option<Self> {
        let min_ms = *samples.iter().min()?;
        let max_ms = *samples.iter().max()?;
        let avg_ms = samples.iter().sum::<u64>() as f64 / samples.len() as f64;
        Some(Self { avg_ms, min_ms, max_ms })
    }
}

/// Stage timings over successful cycles only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub render: StageStats,
    pub display: StageStats,
    pub total: StageStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshCounts {
    pub full: usize,
    pub partial: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    pub screenshots: Option<usize>,
    pub logs_dir: PathBuf,
    pub reports_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    pub value: f64,
    pub target: f64,
    pub pass: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub overall_pass: bool,
    pub criteria: Vec<Criterion>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub config: RunConfig,
    pub results: RunResults,
    pub performance: Option<Performance>,
    pub refreshes: RefreshCounts,
    pub artifacts: Artifacts,
    pub validation: Validation,
}

/// Summarise a finished run. `screenshots` is `None` when artifacts were not
/// collected, which also skips the screenshot criterion.
pub fn build_report(
    run: &IntegrationRun,
    config: RunConfig,
    cycles: &[CycleResult],
    screenshots: Option<usize>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> IntegrationReport {
    let total = cycles.len();
    let successful: Vec<&CycleResult> = cycles.iter().filter(|c| c.outcome.is_success()).collect();
    let success_rate = if total == 0 {
        0.0
    } else {
        successful.len() as f64 * 100.0 / total as f64
    };

    let samples = |stage: fn(&CycleResult) -> u64| successful.iter().map(|c| stage(c)).collect::<Vec<_>>();
    let performance = StageStats::from_samples(&samples(|c| c.durations.render_ms)).and_then(|render| {
        Some(Performance {
            render,
            display: StageStats::from_samples(&samples(|c| c.durations.display_ms))?,
            total: StageStats::from_samples(&samples(|c| c.durations.total_ms))?,
        })
    });

    let mut refreshes = RefreshCounts::default();
    for cycle in &successful {
        match cycle.refresh_mode {
            Some(RefreshMode::Full) => refreshes.full += 1,
            Some(RefreshMode::Partial) => refreshes.partial += 1,
            None => refreshes.unchanged += 1,
        }
    }

    let mut validation = Validation {
        overall_pass: true,
        criteria: Vec::new(),
        recommendations: Vec::new(),
    };
    validation.check(
        "success_rate",
        success_rate,
        TARGET_SUCCESS_RATE,
        success_rate >= TARGET_SUCCESS_RATE,
        format!("Success rate ({success_rate:.1}%) below target ({TARGET_SUCCESS_RATE}%). Check for rendering or display issues."),
    );
    if let Some(perf) = &performance {
        let avg = perf.total.avg_ms;
        validation.check(
            "avg_total_ms",
            avg,
            TARGET_AVG_TOTAL_MS,
            avg < TARGET_AVG_TOTAL_MS,
            format!("Average update time ({:.2}s) exceeds target (2.0s).", avg / 1000.0),
        );
    }
    if let Some(saved) = screenshots {
        // unchanged cycles never reach the panel, so they save nothing
        let expected = refreshes.full + refreshes.partial;
        let ratio = if expected == 0 { 0.0 } else { saved as f64 / expected as f64 };
        validation.check(
            "screenshot_ratio",
            ratio,
            TARGET_SCREENSHOT_RATIO,
            ratio >= TARGET_SCREENSHOT_RATIO,
            format!("Screenshot capture rate ({:.1}%) below 90%. Check artifact saving.", ratio * 100.0),
        );
    }

    IntegrationReport {
        run_id: run.id,
        started_at,
        finished_at,
        config,
        results: RunResults {
            total_cycles: total,
            successful_cycles: successful.len(),
            failed_cycles: total - successful.len(),
            success_rate,
            total_duration_secs: (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
        },
        performance,
        refreshes,
        artifacts: Artifacts {
            screenshots,
            logs_dir: run.logs.clone(),
            reports_dir: run.reports.clone(),
        },
        validation,
    }
}

impl Validation {
    fn check(&mut self, name: &str, value: f64, target: f64, pass: bool, advice: String) {
        self.criteria.push(Criterion {
            name: name.to_string(),
            value,
            target,
            pass,
        });
        if !pass {
            self.overall_pass = false;
            self.recommendations.push(advice);
        }
    }
}

/// Drive the real pipeline (browser included) against a generated page on the
/// mock display for `settings.integration_duration_secs`.
pub async fn run_integration(settings: &Settings, cancel: &CancellationToken) -> Result<IntegrationReport> {
    let run = IntegrationRun::create(&settings.results_dir)?;
    let page = run.write_test_page(settings.display_width, settings.display_height)?;

    let mut settings = settings.clone();
    settings.dashboard_type = DashboardType::File;
    settings.content_file = Some(page);
    settings.display_type = "mock".into();
    settings.state_dir = run.root.join("state");
    settings.update_interval_secs = settings.integration_interval_secs;
    settings.validate()?;

    let config = RunConfig {
        duration_secs: settings.integration_duration_secs,
        interval_secs: settings.integration_interval_secs,
        display_width: settings.display_width,
        display_height: settings.display_height,
        collect_artifacts: settings.collect_artifacts,
    };
    log_info!(
        "integration run {} for {}s every {}s, results in {}",
        run.id,
        config.duration_secs,
        config.interval_secs,
        run.root.display()
    );

    let artifacts = settings.collect_artifacts.then(|| run.screenshots.clone());
    let metrics = MetricsCollector::new(Duration::from_secs(config.interval_secs));
    let mut scheduler = app::build_scheduler(&settings, metrics, artifacts).await?;

    let started_at = Utc::now();
    let cycles = scheduler
        .run_for(Duration::from_secs(config.duration_secs), cancel)
        .await;
    scheduler.shutdown().await;
    let finished_at = Utc::now();

    let screenshots = settings.collect_artifacts.then(|| run.screenshot_count());
    let report = build_report(&run, config, &cycles, screenshots, started_at, finished_at);
    run.write_reports(&report, &cycles)?;

    log_info!(
        "integration run finished: {}/{} cycles ok ({:.1}%)",
        report.results.successful_cycles,
        report.results.total_cycles,
        report.results.success_rate
    );
    for criterion in &report.validation.criteria {
        log_info!(
            "  {}: {:.2} (target {}) {}",
            criterion.name,
            criterion.value,
            criterion.target,
            if criterion.pass { "PASS" } else { "FAIL" }
        );
    }
    for advice in &report.validation.recommendations {
        log_warn!("  {advice}");
    }
    if !report.validation.overall_pass {
        log_error!("integration run {} failed validation", run.id);
    }
    Ok(report)
}
