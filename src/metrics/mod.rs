pub mod exporter;
pub mod time_check;
mod types;

pub use time_check::{TimeCheck, TimeCheckStatus};
pub use types::{
    CycleOutcome, CycleResult, Histogram, MetricsSnapshot, ServiceComponent, StageDurations,
    SystemMetrics, DURATION_BUCKETS, TIMING_OFFSET_BUCKETS, TIME_OFFSET_BUCKETS,
};

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Components, Disks, Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

use crate::render::FrameSourceKind;

const MAX_RECENT_CYCLES: usize = 50;
const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

/// Metrics sink shared by the scheduler and the exporter. Clones share state.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    snapshot: MetricsSnapshot,
    system: System,
    components: Components,
    disks: Disks,
    browser_pid: Option<u32>,
}

impl MetricsCollector {
    pub fn new(update_interval: Duration) -> Self {
        let mut system = System::new();
        // baseline for the first CPU delta
        system.refresh_cpu_usage();

        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                snapshot: MetricsSnapshot {
                    update_interval_seconds: update_interval.as_secs_f64(),
                    ..MetricsSnapshot::default()
                },
                system,
                components: Components::new_with_refreshed_list(),
                disks: Disks::new_with_refreshed_list(),
                browser_pid: None,
            })),
        }
    }

    pub async fn record_cycle(&self, result: &CycleResult) {
        let mut state = self.inner.lock().await;
        let snapshot = &mut state.snapshot;

        *snapshot
            .updates_total
            .entry(result.outcome.as_str().to_string())
            .or_default() += 1;
        snapshot
            .cycle_duration
            .observe(result.durations.total_ms as f64 / 1000.0);

        if let Some(mode) = result.refresh_mode {
            *snapshot
                .display_refresh_total
                .entry(mode.as_str().to_string())
                .or_default() += 1;
            snapshot
                .display_duration
                .entry(mode.as_str().to_string())
                .or_default()
                .observe(result.durations.display_ms as f64 / 1000.0);
        }

        snapshot.recent_cycles.push(result.clone());
        if snapshot.recent_cycles.len() > MAX_RECENT_CYCLES {
            snapshot.recent_cycles.remove(0);
        }
    }

    pub async fn record_render_attempt(&self, kind: FrameSourceKind, success: bool, elapsed: Duration) {
        let mut state = self.inner.lock().await;
        let snapshot = &mut state.snapshot;
        let status = if success { "success" } else { "failure" };

        *snapshot
            .render_attempts_total
            .entry(kind.as_str().to_string())
            .or_default()
            .entry(status.to_string())
            .or_default() += 1;
        if success {
            snapshot
                .render_duration
                .entry(kind.as_str().to_string())
                .or_default()
                .observe(elapsed.as_secs_f64());
        }
    }

    /// Positive when a loop cycle finished after its scheduled tick.
    pub async fn record_timing_offset(&self, seconds: f64) {
        self.inner.lock().await.snapshot.update_timing_offset.observe(seconds);
    }

    pub async fn set_service_status(&self, component: ServiceComponent, up: bool) {
        self.inner
            .lock()
            .await
            .snapshot
            .service_status
            .insert(component.as_str().to_string(), up);
    }

    pub async fn record_time_check(&self, check: &TimeCheck) {
        let mut state = self.inner.lock().await;
        let snapshot = &mut state.snapshot;

        *snapshot
            .time_validation_total
            .entry(check.status.as_str().to_string())
            .or_default() += 1;
        if check.status == TimeCheckStatus::Warning {
            snapshot.time_validation_warnings_total += 1;
        }
        if let Some(offset) = check.offset_minutes {
            snapshot.time_offset_minutes.observe(offset);
        }
    }

    /// Browser whose resident memory is reported; `None` when no browser runs.
    pub async fn set_browser_pid(&self, pid: Option<u32>) {
        self.inner.lock().await.browser_pid = pid;
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let mut state = self.inner.lock().await;
        let system = state.sample_system();
        state.snapshot.system = system;
        state.snapshot.clone()
    }
}

impl MetricsState {
    fn sample_system(&mut self) -> SystemMetrics {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (self.system.used_memory() as f64 / total as f64 * 100.0) as f32
        };

        self.system.refresh_processes(ProcessesToUpdate::All);
        let browser_memory_mb = self.browser_pid.and_then(|raw| {
            self.system
                .process(Pid::from_u32(raw))
                .map(|process| process.memory() as f64 / 1024.0 / 1024.0)
        });
        let browser_processes = self
            .system
            .processes()
            .values()
            .filter(|process| {
                let name: &OsStr = process.name().as_ref();
                is_browser_process(&name.to_string_lossy())
            })
            .count();

        SystemMetrics {
            cpu_percent: self.system.global_cpu_usage(),
            memory_percent,
            disk_percent: self.root_disk_percent(),
            temperature_celsius: self.cpu_temperature(),
            browser_memory_mb,
            browser_processes,
        }
    }

    fn root_disk_percent(&mut self) -> Option<f32> {
        self.disks.refresh();
        let root = self
            .disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))?;
        let total = root.total_space();
        if total == 0 {
            return None;
        }
        let used = total.saturating_sub(root.available_space());
        Some((used as f64 / total as f64 * 100.0) as f32)
    }

    fn cpu_temperature(&mut self) -> Option<f32> {
        self.components.refresh();
        let sensors = self.components.list();
        let preferred = sensors.iter().find(|component| {
            let label = component.label().to_ascii_lowercase();
            label.contains("cpu") || label.contains("soc")
        });
        if let Some(component) = preferred.or_else(|| sensors.first()) {
            return Some(component.temperature());
        }

        // Raspberry Pi kernels expose millidegrees here even without hwmon
        std::fs::read_to_string(THERMAL_ZONE)
            .ok()
            .and_then(|raw| raw.trim().parse::<f32>().ok())
            .map(|milli| milli / 1000.0)
    }
}

fn is_browser_process(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.contains("chromium") || name.contains("chrome")
}
