use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::processing::ColorDepth;
use crate::render::RenderTarget;
use crate::scheduler::{BackoffPolicy, UpdatePolicy};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DashboardType {
    /// Remote page such as a DAKboard screen.
    Dakboard,
    /// Local HTML file rendered through the browser.
    File,
    /// Built-in test pattern, no browser involved.
    Pattern,
}

impl FromStr for DashboardType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dakboard" | "url" => Ok(DashboardType::Dakboard),
            "file" | "integration_test" => Ok(DashboardType::File),
            "pattern" | "mock" => Ok(DashboardType::Pattern),
            other => bail!("unknown dashboard type '{other}'"),
        }
    }
}

/// Service configuration.
///
/// Layering: built-in defaults, then an optional JSON file, then environment
/// variables, then CLI flags (applied by the caller).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub dashboard_type: DashboardType,
    pub dakboard_url: String,
    pub content_file: Option<PathBuf>,

    pub display_width: u32,
    pub display_height: u32,
    /// Degrees clockwise: 0, 90, 180 or 270.
    pub display_rotation: u16,
    pub epd_mode: ColorDepth,
    /// `mock` or the name of a hardware driver (e.g. `it8951`).
    pub display_type: String,
    /// Program invoked by the hardware backend for every write.
    pub display_driver_cmd: Option<String>,

    pub update_interval_secs: u64,
    pub full_refresh_every: u32,
    pub coverage_threshold: f32,
    pub max_consecutive_failures: u32,
    pub display_timeout_secs: u64,
    pub display_retries: u32,
    pub display_retry_delay_ms: u64,

    pub browser_bin: String,
    pub browser_width: Option<u32>,
    pub browser_height: Option<u32>,
    pub browser_timeout_secs: u64,
    pub browser_max_age_hours: u64,

    pub debug: bool,
    pub log_file: Option<PathBuf>,
    pub state_dir: PathBuf,

    pub prometheus_enabled: bool,
    pub prometheus_port: u16,

    pub integration_duration_secs: u64,
    pub integration_interval_secs: u64,
    pub collect_artifacts: bool,
    pub results_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dashboard_type: DashboardType::Dakboard,
            dakboard_url: String::new(),
            content_file: None,
            display_width: 400,
            display_height: 200,
            display_rotation: 0,
            epd_mode: ColorDepth::Bw,
            display_type: "it8951".into(),
            display_driver_cmd: None,
            update_interval_secs: 60,
            full_refresh_every: 60,
            coverage_threshold: 0.40,
            max_consecutive_failures: 3,
            display_timeout_secs: 30,
            display_retries: 3,
            display_retry_delay_ms: 2_000,
            browser_bin: "chromium".into(),
            browser_width: None,
            browser_height: None,
            browser_timeout_secs: 30,
            browser_max_age_hours: 24,
            debug: false,
            log_file: None,
            state_dir: PathBuf::from(".cache/pi-dashboard"),
            prometheus_enabled: true,
            prometheus_port: 8000,
            integration_duration_secs: 60,
            integration_interval_secs: 3,
            collect_artifacts: false,
            results_dir: PathBuf::from("test_results"),
        }
    }
}

impl Settings {
    /// Defaults, then `config_file` if given, then the process environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut settings = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|name| env::var(name).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))
    }

    /// Apply environment overrides. `lookup` is injectable so tests do not
    /// have to mutate the real process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(value) = get("DASHBOARD_TYPE") {
            self.dashboard_type = value.parse()?;
        }
        if let Some(value) = get("DAKBOARD_URL") {
            self.dakboard_url = value;
        }
        if let Some(value) = get("CONTENT_FILE") {
            self.content_file = Some(PathBuf::from(value));
        }
        if let Some(value) = get("DEBUG") {
            self.debug = parse_bool(&value);
        }
        if let Some(value) = get("LOG_FILE") {
            self.log_file = Some(PathBuf::from(value));
        }
        if let Some(value) = get("STATE_DIR") {
            self.state_dir = PathBuf::from(value);
        }
        if let Some(value) = get("DISPLAY_TYPE") {
            self.display_type = value;
        }
        if let Some(value) = get("DISPLAY_DRIVER_CMD") {
            self.display_driver_cmd = Some(value);
        }
        if let Some(value) = get("EPD_MODE") {
            self.epd_mode = value.parse()?;
        }
        if let Some(value) = get("BROWSER_BIN") {
            self.browser_bin = value;
        }
        if let Some(value) = get("PROMETHEUS_ENABLED") {
            self.prometheus_enabled = parse_bool(&value);
        }
        if let Some(value) = get("COLLECT_ARTIFACTS") {
            self.collect_artifacts = parse_bool(&value);
        }

        parse_into(&get, "UPDATE_INTERVAL", &mut self.update_interval_secs)?;
        parse_into(&get, "BROWSER_TIMEOUT", &mut self.browser_timeout_secs)?;
        parse_into(&get, "BROWSER_MAX_AGE_HOURS", &mut self.browser_max_age_hours)?;
        parse_into(&get, "EINK_PARTIAL_REFRESH_LIMIT", &mut self.full_refresh_every)?;
        parse_into(&get, "DISPLAY_WIDTH", &mut self.display_width)?;
        parse_into(&get, "DISPLAY_HEIGHT", &mut self.display_height)?;
        parse_into(&get, "DISPLAY_ROTATION", &mut self.display_rotation)?;
        parse_into(&get, "DISPLAY_TIMEOUT", &mut self.display_timeout_secs)?;
        parse_into(&get, "DISPLAY_RETRIES", &mut self.display_retries)?;
        parse_into(&get, "MAX_CONSECUTIVE_FAILURES", &mut self.max_consecutive_failures)?;
        parse_into(&get, "PROMETHEUS_PORT", &mut self.prometheus_port)?;
        parse_into(&get, "INTEGRATION_DURATION", &mut self.integration_duration_secs)?;
        parse_into(&get, "INTEGRATION_INTERVAL", &mut self.integration_interval_secs)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.dashboard_type == DashboardType::Dakboard && self.dakboard_url.is_empty() {
            errors.push("DAKboard URL is required when using the dakboard dashboard type");
        }
        if self.dashboard_type == DashboardType::File && self.content_file.is_none() {
            errors.push("a content file is required when using the file dashboard type");
        }
        if self.display_width == 0 || self.display_height == 0 {
            errors.push("display dimensions must be positive");
        }
        if !matches!(self.display_rotation, 0 | 90 | 180 | 270) {
            errors.push("display rotation must be one of 0, 90, 180, 270");
        }
        if self.update_interval_secs == 0 {
            errors.push("update interval must be positive");
        }
        if self.browser_timeout_secs == 0 || self.display_timeout_secs == 0 {
            errors.push("timeouts must be positive");
        }
        if self.full_refresh_every == 0 {
            errors.push("full refresh interval must be at least 1 cycle");
        }
        if !(0.0..=1.0).contains(&self.coverage_threshold) {
            errors.push("coverage threshold must be within 0.0..=1.0");
        }
        if self.display_retries == 0 {
            errors.push("display retries must be at least 1");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!("Configuration validation failed:\n{}", errors.join("\n"))
        }
    }

    pub fn is_mock_display(&self) -> bool {
        self.display_type.eq_ignore_ascii_case("mock")
    }

    /// Browser viewport; follows the display geometry unless overridden.
    pub fn browser_size(&self) -> (u32, u32) {
        (
            self.browser_width.unwrap_or(self.display_width),
            self.browser_height.unwrap_or(self.display_height),
        )
    }

    pub fn render_target(&self) -> RenderTarget {
        match self.dashboard_type {
            DashboardType::Dakboard => RenderTarget::Url(self.dakboard_url.clone()),
            DashboardType::File => match &self.content_file {
                Some(path) => RenderTarget::File(path.clone()),
                None => RenderTarget::Pattern,
            },
            DashboardType::Pattern => RenderTarget::Pattern,
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn update_policy(&self) -> UpdatePolicy {
        let interval = Duration::from_secs(self.update_interval_secs);
        UpdatePolicy {
            update_interval: interval,
            max_consecutive_failures: self.max_consecutive_failures,
            full_refresh_every: self.full_refresh_every,
            coverage_threshold: self.coverage_threshold,
            render_timeout: Duration::from_secs(self.browser_timeout_secs),
            display_timeout: Duration::from_secs(self.display_timeout_secs),
            browser_max_age: Duration::from_secs(self.browser_max_age_hours * 3600),
            display_retries: self.display_retries,
            display_retry_delay: Duration::from_millis(self.display_retry_delay_ms),
            backoff: BackoffPolicy::for_interval(interval),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_into<T, G>(get: &G, name: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(name) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid value '{raw}' for {name}: {err}"))?;
    }
    Ok(())
}
