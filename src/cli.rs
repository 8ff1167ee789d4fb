//! Command-line surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::settings::{DashboardType, Settings};

/// pi-dashboard - keeps an e-ink panel showing a web dashboard
#[derive(Debug, Parser)]
#[command(name = "pi-dashboard")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// JSON settings file layered under the environment
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Display backend: `mock` or a hardware driver name
    #[arg(long, global = true)]
    pub display: Option<String>,

    /// Dashboard URL (implies the dakboard dashboard type)
    #[arg(long, global = true)]
    pub url: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Show the built-in test pattern once
    Test,

    /// Render the dashboard once and force a full refresh
    Update,

    /// Keep the display updated until interrupted (default)
    Run,

    /// Timed run against a generated page on the mock display
    IntegrationTest {
        /// Run length in seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Seconds between cycles
        #[arg(long)]
        interval: Option<u64>,

        /// Save every frame sent to the display
        #[arg(long)]
        collect_artifacts: bool,
    },

    /// Blank the display
    Clear,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run)
    }

    /// Flags win over the file and the environment.
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if self.debug {
            settings.debug = true;
        }
        if let Some(display) = &self.display {
            settings.display_type = display.clone();
        }
        if let Some(url) = &self.url {
            settings.dashboard_type = DashboardType::Dakboard;
            settings.dakboard_url = url.clone();
        }

        match self.command() {
            Commands::Test => settings.dashboard_type = DashboardType::Pattern,
            Commands::IntegrationTest {
                duration,
                interval,
                collect_artifacts,
            } => {
                if let Some(duration) = duration {
                    settings.integration_duration_secs = duration;
                }
                if let Some(interval) = interval {
                    settings.integration_interval_secs = interval;
                }
                if collect_artifacts {
                    settings.collect_artifacts = true;
                }
            }
            Commands::Update | Commands::Run | Commands::Clear => {}
        }
    }

    /// Whether startup validation applies to the content settings. `test`,
    /// `clear` and `integration-test` pick their own content.
    pub fn needs_content(&self) -> bool {
        matches!(self.command(), Commands::Update | Commands::Run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::try_parse_from(["pi-dashboard"]).unwrap();
        assert_eq!(cli.command(), Commands::Run);
        assert!(cli.needs_content());
    }

    #[test]
    fn test_global_flags_override_settings() {
        let cli = Cli::try_parse_from([
            "pi-dashboard",
            "update",
            "--debug",
            "--display",
            "mock",
            "--url",
            "https://dakboard.com/screen/xyz",
        ])
        .unwrap();
        let mut settings = Settings {
            dashboard_type: DashboardType::Pattern,
            ..Settings::default()
        };
        cli.apply_overrides(&mut settings);

        assert_eq!(cli.command(), Commands::Update);
        assert!(settings.debug);
        assert!(settings.is_mock_display());
        assert_eq!(settings.dashboard_type, DashboardType::Dakboard);
        assert_eq!(settings.dakboard_url, "https://dakboard.com/screen/xyz");
    }

    #[test]
    fn test_integration_flags() {
        let cli = Cli::try_parse_from([
            "pi-dashboard",
            "integration-test",
            "--duration",
            "30",
            "--interval",
            "5",
            "--collect-artifacts",
        ])
        .unwrap();
        let mut settings = Settings::default();
        cli.apply_overrides(&mut settings);

        assert_eq!(settings.integration_duration_secs, 30);
        assert_eq!(settings.integration_interval_secs, 5);
        assert!(settings.collect_artifacts);
        assert!(!cli.needs_content());
    }

    #[test]
    fn test_pattern_command_selects_pattern() {
        let cli = Cli::try_parse_from(["pi-dashboard", "test", "--display", "mock"]).unwrap();
        let mut settings = Settings::default();
        cli.apply_overrides(&mut settings);
        assert_eq!(settings.dashboard_type, DashboardType::Pattern);
        settings.validate().unwrap();
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(Cli::try_parse_from(["pi-dashboard", "bogus"]).is_err());
    }
}
