use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DeviceMode, RefreshMode};

/// Counters that drive the partial/full decision. Owned by the display
/// controller and only changed after a successful device write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayDeviceState {
    pub width: u32,
    pub height: u32,
    pub mode: DeviceMode,
    pub refresh_counter: u64,
    pub since_last_full_refresh: u32,
    pub last_full_refresh_at: Option<DateTime<Utc>>,
}

impl DisplayDeviceState {
    pub fn new(width: u32, height: u32, mode: DeviceMode) -> Self {
        Self {
            width,
            height,
            mode,
            refresh_counter: 0,
            since_last_full_refresh: 0,
            last_full_refresh_at: None,
        }
    }

    pub fn record_refresh(&mut self, refresh: RefreshMode, at: DateTime<Utc>) {
        self.refresh_counter += 1;
        match refresh {
            RefreshMode::Full => {
                self.since_last_full_refresh = 0;
                self.last_full_refresh_at = Some(at);
            }
            RefreshMode::Partial => self.since_last_full_refresh += 1,
        }
    }
}

/// What survives a restart. Geometry and backend always come from the
/// current configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct PersistedState {
    refresh_counter: u64,
    since_last_full_refresh: u32,
    last_full_refresh_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Restore counters into a fresh state; a missing file means first boot.
    pub fn load(&self, width: u32, height: u32, mode: DeviceMode) -> Result<DisplayDeviceState> {
        let mut state = DisplayDeviceState::new(width, height, mode);
        if !self.path.exists() {
            return Ok(state);
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read display state {}", self.path.display()))?;
        let persisted: PersistedState = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse display state {}", self.path.display()))?;

        state.refresh_counter = persisted.refresh_counter;
        state.since_last_full_refresh = persisted.since_last_full_refresh;
        state.last_full_refresh_at = persisted.last_full_refresh_at;
        Ok(state)
    }

    pub fn save(&self, state: &DisplayDeviceState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state directory {}", parent.display()))?;
        }
        let persisted = PersistedState {
            refresh_counter: state.refresh_counter,
            since_last_full_refresh: state.since_last_full_refresh,
            last_full_refresh_at: state.last_full_refresh_at,
        };
        let json = serde_json::to_string_pretty(&persisted)?;

        // atomic replace
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
