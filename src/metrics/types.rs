use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::display::RefreshMode;
use crate::render::FrameSourceKind;

/// Upper bounds in seconds, shared by every duration histogram.
pub const DURATION_BUCKETS: [f64; 10] = [0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0];

/// Seconds a loop cycle finished after its scheduled tick; negative is early.
pub const TIMING_OFFSET_BUCKETS: [f64; 12] =
    [-5.0, -2.0, -1.0, -0.5, -0.1, 0.0, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0];

/// Minutes between the dashboard's clock and the system clock.
pub const TIME_OFFSET_BUCKETS: [f64; 9] = [-10.0, -5.0, -2.0, -1.0, 0.0, 1.0, 2.0, 5.0, 10.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceComponent {
    Browser,
    Display,
}

impl ServiceComponent {
    /// Label used by the metrics exposition (`component`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceComponent::Browser => "browser",
            ServiceComponent::Display => "display",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Success,
    RenderFailed,
    DisplayFailed,
    Skipped,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Success => "success",
            CycleOutcome::RenderFailed => "render_failed",
            CycleOutcome::DisplayFailed => "display_failed",
            CycleOutcome::Skipped => "skipped",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Success)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDurations {
    pub render_ms: u64,
    pub process_ms: u64,
    pub display_ms: u64,
    pub total_ms: u64,
}

/// One scheduler tick. Emitted to the metrics sink, never kept by the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub timestamp: DateTime<Utc>,
    pub outcome: CycleOutcome,
    pub durations: StageDurations,
    pub render_kind: Option<FrameSourceKind>,
    pub refresh_mode: Option<RefreshMode>,
    pub content_hash: Option<u64>,
    pub display_attempts: u32,
    pub error: Option<String>,
}

impl CycleResult {
    pub fn new(timestamp: DateTime<Utc>, outcome: CycleOutcome) -> Self {
        Self {
            timestamp,
            outcome,
            durations: StageDurations::default(),
            render_kind: None,
            refresh_mode: None,
            content_hash: None,
            display_attempts: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    /// Root filesystem; `None` when no disk is mounted at `/`.
    pub disk_percent: Option<f32>,
    pub temperature_celsius: Option<f32>,
    pub browser_memory_mb: Option<f64>,
    /// Chromium processes on the host, ours or not.
    pub browser_processes: usize,
}

/// Cumulative histogram. The `+Inf` bucket is `count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub bounds: Vec<f64>,
    pub buckets: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

/// Over [`DURATION_BUCKETS`].
impl Default for Histogram {
    fn default() -> Self {
        Self::with_bounds(&DURATION_BUCKETS)
    }
}

impl Histogram {
    pub fn with_bounds(bounds: &[f64]) -> Self {
        Self {
            bounds: bounds.to_vec(),
            buckets: vec![0; bounds.len()],
            sum: 0.0,
            count: 0,
        }
    }

    pub fn observe(&mut self, value: f64) {
        for (bucket, bound) in self.buckets.iter_mut().zip(&self.bounds) {
            if value <= *bound {
                *bucket += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub update_interval_seconds: f64,
    /// Keyed by `render_type`.
    pub render_duration: BTreeMap<String, Histogram>,
    /// Keyed by `refresh_type`.
    pub display_duration: BTreeMap<String, Histogram>,
    pub cycle_duration: Histogram,
    /// Keyed by cycle outcome.
    pub updates_total: BTreeMap<String, u64>,
    /// Keyed by `render_type`, then `status`.
    pub render_attempts_total: BTreeMap<String, BTreeMap<String, u64>>,
    pub display_refresh_total: BTreeMap<String, u64>,
    /// Loop cycles only; one-shot updates have no schedule.
    pub update_timing_offset: Histogram,
    /// Keyed by `component`; absent until first observed.
    pub service_status: BTreeMap<String, bool>,
    /// Keyed by `status`.
    pub time_validation_total: BTreeMap<String, u64>,
    pub time_validation_warnings_total: u64,
    pub time_offset_minutes: Histogram,
    pub recent_cycles: Vec<CycleResult>,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            system: SystemMetrics::default(),
            update_interval_seconds: 0.0,
            render_duration: BTreeMap::new(),
            display_duration: BTreeMap::new(),
            cycle_duration: Histogram::default(),
            updates_total: BTreeMap::new(),
            render_attempts_total: BTreeMap::new(),
            display_refresh_total: BTreeMap::new(),
            update_timing_offset: Histogram::with_bounds(&TIMING_OFFSET_BUCKETS),
            service_status: BTreeMap::new(),
            time_validation_total: BTreeMap::new(),
            time_validation_warnings_total: 0,
            time_offset_minutes: Histogram::with_bounds(&TIME_OFFSET_BUCKETS),
            recent_cycles: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_is_cumulative() {
        let mut hist = Histogram::default();
        hist.observe(0.2);
        hist.observe(3.0);
        hist.observe(120.0);

        assert_eq!(hist.count, 3);
        assert_eq!(hist.buckets[0], 0); // <= 0.1
        assert_eq!(hist.buckets[1], 1); // <= 0.25
        assert_eq!(hist.buckets[5], 2); // <= 5
        assert_eq!(*hist.buckets.last().unwrap(), 2);
        assert!((hist.sum - 123.2).abs() < 1e-9);
    }

    #[test]
    fn test_signed_bounds() {
        let mut hist = Histogram::with_bounds(&TIMING_OFFSET_BUCKETS);
        hist.observe(-0.3);
        hist.observe(0.0);
        hist.observe(0.05);
        hist.observe(42.0);

        assert_eq!(hist.buckets[0], 0); // <= -5
        assert_eq!(hist.buckets[3], 0); // <= -0.5
        assert_eq!(hist.buckets[4], 1); // <= -0.1
        assert_eq!(hist.buckets[5], 2); // <= 0
        assert_eq!(hist.buckets[6], 3); // <= 0.1
        assert_eq!(*hist.buckets.last().unwrap(), 3);
        assert_eq!(hist.count, 4);
    }
}
