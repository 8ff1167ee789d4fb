//! Owner of the panel. Decides between partial and full refresh, performs
//! the write under the device lock and keeps the refresh bookkeeping.
//!
//! The lock is held only for write-and-wait. Retries and their delays belong
//! to the caller, so a failed write returns immediately and commits nothing.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use image::{GrayImage, Luma};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::DisplayError;
use crate::processing::{ColorDepth, DisplaySignature, FrameChange, ProcessedImage, Region};

use super::state::{DisplayDeviceState, StateStore};
use super::{DeviceMode, DisplayBackend, RefreshMode};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const MAX_TRANSITIONS: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayPolicy {
    pub width: u32,
    pub height: u32,
    pub depth: ColorDepth,
    pub full_refresh_every: u32,
    /// Fraction of the surface above which a change is drawn with a full refresh.
    pub coverage_threshold: f32,
    pub display_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Updating(RefreshMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Refreshed {
        mode: RefreshMode,
        region: Region,
        refresh_counter: u64,
    },
    /// Nothing changed and no full refresh was due; the panel was not touched.
    Unchanged,
}

impl Ack {
    pub fn refresh_mode(&self) -> Option<RefreshMode> {
        match self {
            Ack::Refreshed { mode, .. } => Some(*mode),
            Ack::Unchanged => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Skip,
    Refresh(RefreshMode, Region),
}

struct Device {
    backend: Box<dyn DisplayBackend>,
    state: DisplayDeviceState,
    last_displayed: Option<ProcessedImage>,
    phase: ControllerState,
    transitions: VecDeque<ControllerState>,
    opened: bool,
}

impl Device {
    fn enter(&mut self, next: ControllerState) {
        self.phase = next;
        if self.transitions.len() >= MAX_TRANSITIONS {
            self.transitions.pop_front();
        }
        self.transitions.push_back(next);
    }
}

pub struct DisplayController {
    policy: DisplayPolicy,
    store: Option<StateStore>,
    device: Mutex<Device>,
}

impl DisplayController {
    /// Open the backend and restore refresh counters from `store`.
    pub async fn open(
        mut backend: Box<dyn DisplayBackend>,
        policy: DisplayPolicy,
        store: Option<StateStore>,
    ) -> Result<Self, DisplayError> {
        let mode = backend.mode();
        let state = match &store {
            Some(store) => store
                .load(policy.width, policy.height, mode)
                .unwrap_or_else(|err| {
                    log_warn!("ignoring unreadable display state: {err:#}");
                    DisplayDeviceState::new(policy.width, policy.height, mode)
                }),
            None => DisplayDeviceState::new(policy.width, policy.height, mode),
        };

        backend.open().await?;
        log_info!(
            "display ready: {}x{} {:?}, {} refreshes so far, {} since last full",
            policy.width,
            policy.height,
            mode,
            state.refresh_counter,
            state.since_last_full_refresh
        );

        Ok(Self {
            policy,
            store,
            device: Mutex::new(Device {
                backend,
                state,
                last_displayed: None,
                phase: ControllerState::Idle,
                transitions: VecDeque::new(),
                opened: true,
            }),
        })
    }

    pub async fn update(
        &self,
        image: ProcessedImage,
        signature: &DisplaySignature,
    ) -> Result<Ack, DisplayError> {
        self.apply(image, signature, false).await
    }

    /// Like [`update`](Self::update) but always a full refresh.
    pub async fn force_full_update(
        &self,
        image: ProcessedImage,
        signature: &DisplaySignature,
    ) -> Result<Ack, DisplayError> {
        self.apply(image, signature, true).await
    }

    /// Blank the panel with a full white refresh.
    pub async fn clear(&self) -> Result<Ack, DisplayError> {
        let white = GrayImage::from_pixel(self.policy.width, self.policy.height, Luma([255]));
        let image = ProcessedImage::new(white, self.policy.depth);
        let mut device = self.device.lock().await;
        self.refresh_locked(
            &mut device,
            image,
            RefreshMode::Full,
            Region::full(self.policy.width, self.policy.height),
        )
        .await
    }

    /// Put the panel to sleep and persist the counters.
    pub async fn close(&self) -> Result<(), DisplayError> {
        let mut device = self.device.lock().await;
        if !device.opened {
            return Ok(());
        }
        device.opened = false;
        self.persist(&device.state);
        device.backend.close().await
    }

    pub async fn device_state(&self) -> DisplayDeviceState {
        self.device.lock().await.state.clone()
    }

    pub async fn last_displayed(&self) -> Option<ProcessedImage> {
        self.device.lock().await.last_displayed.clone()
    }

    pub async fn state(&self) -> ControllerState {
        self.device.lock().await.phase
    }

    /// States entered, oldest first.
    pub async fn transitions(&self) -> Vec<ControllerState> {
        self.device.lock().await.transitions.iter().copied().collect()
    }

    pub async fn mode(&self) -> DeviceMode {
        self.device.lock().await.state.mode
    }

    async fn apply(
        &self,
        image: ProcessedImage,
        signature: &DisplaySignature,
        force_full: bool,
    ) -> Result<Ack, DisplayError> {
        if (image.width(), image.height()) != (self.policy.width, self.policy.height) {
            return Err(DisplayError::DimensionMismatch {
                width: self.policy.width,
                height: self.policy.height,
                actual_width: image.width(),
                actual_height: image.height(),
            });
        }

        let mut device = self.device.lock().await;
        match self.plan(signature, force_full) {
            Plan::Skip => {
                log_debug!("frame unchanged, display left alone");
                Ok(Ack::Unchanged)
            }
            Plan::Refresh(mode, region) => self.refresh_locked(&mut device, image, mode, region).await,
        }
    }

    fn plan(&self, signature: &DisplaySignature, force_full: bool) -> Plan {
        let full = Region::full(self.policy.width, self.policy.height);
        if force_full || signature.since_last_full_refresh >= self.policy.full_refresh_every {
            return Plan::Refresh(RefreshMode::Full, full);
        }
        match signature.change {
            FrameChange::Initial => Plan::Refresh(RefreshMode::Full, full),
            FrameChange::Unchanged => Plan::Skip,
            FrameChange::Region(region) => {
                let coverage = region.area() as f64 / full.area().max(1) as f64;
                if coverage > self.policy.coverage_threshold as f64 {
                    Plan::Refresh(RefreshMode::Full, full)
                } else {
                    Plan::Refresh(RefreshMode::Partial, region)
                }
            }
        }
    }

    async fn refresh_locked(
        &self,
        device: &mut Device,
        image: ProcessedImage,
        mode: RefreshMode,
        region: Region,
    ) -> Result<Ack, DisplayError> {
        if !device.opened {
            return Err(DisplayError::Unavailable("display is closed".into()));
        }

        device.enter(ControllerState::Updating(mode));
        let limit = self.policy.display_timeout;
        let backend = &mut device.backend;
        let outcome = timeout(limit, async {
            backend.write(&image, mode, region).await?;
            backend.wait_ready().await
        })
        .await
        .unwrap_or(Err(DisplayError::DeviceBusyTimeout(limit)));
        device.enter(ControllerState::Idle);
        outcome?;

        device.state.record_refresh(mode, Utc::now());
        device.last_displayed = Some(image);
        self.persist(&device.state);

        log_info!(
            "{mode} refresh #{} ({}x{} at {},{}), {} since last full",
            device.state.refresh_counter,
            region.width,
            region.height,
            region.x,
            region.y,
            device.state.since_last_full_refresh
        );
        Ok(Ack::Refreshed {
            mode,
            region,
            refresh_counter: device.state.refresh_counter,
        })
    }

    fn persist(&self, state: &DisplayDeviceState) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save(state) {
                log_warn!("failed to persist display state: {err:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::mock::MockBackend;
    use crate::processing::FrameProcessor;
    use crate::render::{Frame, FrameSourceKind};
    use image::DynamicImage;
    use tempfile::TempDir;

    const W: u32 = 40;
    const H: u32 = 20;

    fn policy(full_refresh_every: u32) -> DisplayPolicy {
        DisplayPolicy {
            width: W,
            height: H,
            depth: ColorDepth::Bw,
            full_refresh_every,
            coverage_threshold: 0.40,
            display_timeout: Duration::from_secs(5),
        }
    }

    /// White frame with a black block of `size` pixels square at the origin.
    fn frame_with_block(size: u32) -> Frame {
        let img = GrayImage::from_fn(W, H, |x, y| {
            if x < size && y < size {
                Luma([0])
            } else {
                Luma([255])
            }
        });
        Frame::new(DynamicImage::ImageLuma8(img), FrameSourceKind::Persistent)
    }

    async fn push(
        controller: &DisplayController,
        processor: &FrameProcessor,
        frame: &Frame,
    ) -> Result<Ack, DisplayError> {
        let last = controller.last_displayed().await;
        let since = controller.device_state().await.since_last_full_refresh;
        let (image, signature) = processor.process(frame, last.as_ref(), since);
        controller.update(image, &signature).await
    }

    async fn mock_controller(every: u32, backend: MockBackend) -> DisplayController {
        DisplayController::open(Box::new(backend), policy(every), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_full_then_partial() {
        let backend = MockBackend::new();
        let writes = backend.writes();
        let controller = mock_controller(10, backend).await;
        let processor = FrameProcessor::new(W, H, 0, ColorDepth::Bw);

        let first = push(&controller, &processor, &frame_with_block(2)).await.unwrap();
        assert_eq!(first.refresh_mode(), Some(RefreshMode::Full));

        let second = push(&controller, &processor, &frame_with_block(4)).await.unwrap();
        assert_eq!(
            second,
            Ack::Refreshed {
                mode: RefreshMode::Partial,
                region: Region {
                    x: 0,
                    y: 0,
                    width: 4,
                    height: 4
                },
                refresh_counter: 2,
            }
        );

        let state = controller.device_state().await;
        assert_eq!(state.refresh_counter, 2);
        assert_eq!(state.since_last_full_refresh, 1);
        assert!(state.last_full_refresh_at.is_some());
        assert_eq!(writes.lock().unwrap().len(), 2);
        assert_eq!(
            controller.transitions().await,
            vec![
                ControllerState::Updating(RefreshMode::Full),
                ControllerState::Idle,
                ControllerState::Updating(RefreshMode::Partial),
                ControllerState::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn test_full_refresh_forced_one_before_limit() {
        let controller = mock_controller(3, MockBackend::new()).await;
        let processor = FrameProcessor::new(W, H, 0, ColorDepth::Bw);

        push(&controller, &processor, &frame_with_block(1)).await.unwrap();
        push(&controller, &processor, &frame_with_block(2)).await.unwrap();
        push(&controller, &processor, &frame_with_block(3)).await.unwrap();
        assert_eq!(controller.device_state().await.since_last_full_refresh, 2);

        // tiny change, but the counter is at full_refresh_every - 1
        let ack = push(&controller, &processor, &frame_with_block(4)).await.unwrap();
        assert_eq!(ack.refresh_mode(), Some(RefreshMode::Full));
        assert_eq!(controller.device_state().await.since_last_full_refresh, 0);
    }

    #[tokio::test]
    async fn test_large_change_uses_full_refresh() {
        let controller = mock_controller(100, MockBackend::new()).await;
        let processor = FrameProcessor::new(W, H, 0, ColorDepth::Bw);

        push(&controller, &processor, &frame_with_block(1)).await.unwrap();
        // 18x18 of 40x20 is 40.5% coverage
        let ack = push(&controller, &processor, &frame_with_block(18)).await.unwrap();
        assert_eq!(ack.refresh_mode(), Some(RefreshMode::Full));
    }

    #[tokio::test]
    async fn test_identical_frame_leaves_panel_alone() {
        let backend = MockBackend::new();
        let writes = backend.writes();
        let controller = mock_controller(10, backend).await;
        let processor = FrameProcessor::new(W, H, 0, ColorDepth::Bw);
        let frame = frame_with_block(5);

        push(&controller, &processor, &frame).await.unwrap();
        let (expected, _) = processor.process(&frame, None, 0);
        assert_eq!(controller.last_displayed().await, Some(expected));

        let ack = push(&controller, &processor, &frame).await.unwrap();
        assert_eq!(ack, Ack::Unchanged);
        assert_eq!(controller.device_state().await.refresh_counter, 1);
        assert_eq!(writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_commits_nothing() {
        let controller = mock_controller(10, MockBackend::new().with_write_failures(1)).await;
        let processor = FrameProcessor::new(W, H, 0, ColorDepth::Bw);

        let err = push(&controller, &processor, &frame_with_block(3)).await.unwrap_err();
        assert_eq!(err.kind(), "device_write_failed");
        assert_eq!(controller.state().await, ControllerState::Idle);
        assert_eq!(controller.device_state().await.refresh_counter, 0);
        assert_eq!(controller.last_displayed().await, None);

        push(&controller, &processor, &frame_with_block(3)).await.unwrap();
        assert_eq!(controller.device_state().await.refresh_counter, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_device_times_out() {
        let backend = MockBackend::new().with_latency(Duration::from_secs(60));
        let controller = mock_controller(10, backend).await;
        let processor = FrameProcessor::new(W, H, 0, ColorDepth::Bw);

        let err = push(&controller, &processor, &frame_with_block(3)).await.unwrap_err();
        assert_eq!(err, DisplayError::DeviceBusyTimeout(Duration::from_secs(5)));
        assert_eq!(controller.state().await, ControllerState::Idle);
        assert_eq!(controller.device_state().await.refresh_counter, 0);
    }

    #[tokio::test]
    async fn test_wrong_dimensions_are_rejected() {
        let controller = mock_controller(10, MockBackend::new()).await;
        let processor = FrameProcessor::new(W * 2, H, 0, ColorDepth::Bw);
        let (image, signature) = processor.process(&frame_with_block(3), None, 0);

        let err = controller.update(image, &signature).await.unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
        assert!(controller.transitions().await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_and_close() {
        let controller = mock_controller(10, MockBackend::new()).await;
        let processor = FrameProcessor::new(W, H, 0, ColorDepth::Bw);
        push(&controller, &processor, &frame_with_block(3)).await.unwrap();
        push(&controller, &processor, &frame_with_block(4)).await.unwrap();

        let ack = controller.clear().await.unwrap();
        assert_eq!(ack.refresh_mode(), Some(RefreshMode::Full));
        assert_eq!(controller.device_state().await.since_last_full_refresh, 0);
        let blank = controller.last_displayed().await.unwrap();
        assert!(blank.pixels().pixels().all(|p| p[0] == 255));

        controller.close().await.unwrap();
        assert_eq!(controller.clear().await.unwrap_err().kind(), "unavailable");
    }

    #[tokio::test]
    async fn test_counters_restored_on_reopen() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let processor = FrameProcessor::new(W, H, 0, ColorDepth::Bw);

        let controller = DisplayController::open(Box::new(MockBackend::new()), policy(10), Some(store.clone()))
            .await
            .unwrap();
        push(&controller, &processor, &frame_with_block(2)).await.unwrap();
        push(&controller, &processor, &frame_with_block(3)).await.unwrap();
        controller.close().await.unwrap();

        let reopened = DisplayController::open(Box::new(MockBackend::new()), policy(10), Some(store))
            .await
            .unwrap();
        let state = reopened.device_state().await;
        assert_eq!(state.refresh_counter, 2);
        assert_eq!(state.since_last_full_refresh, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mock_and_hardware_make_the_same_decisions() {
        use crate::display::command::CommandBackend;
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let driver = dir.path().join("fake-epd.sh");
        std::fs::write(&driver, "#!/bin/sh\ncat > /dev/null\n").unwrap();
        std::fs::set_permissions(&driver, std::fs::Permissions::from_mode(0o755)).unwrap();

        let hardware = CommandBackend::new(&driver.display().to_string()).unwrap();
        let backends: Vec<Box<dyn DisplayBackend>> = vec![Box::new(MockBackend::new()), Box::new(hardware)];
        let frames = [frame_with_block(2), frame_with_block(2), frame_with_block(5), frame_with_block(19)];
        let processor = FrameProcessor::new(W, H, 0, ColorDepth::Bw);

        let mut runs = Vec::new();
        for backend in backends {
            let controller = DisplayController::open(backend, policy(10), None).await.unwrap();
            let mut acks = Vec::new();
            for frame in &frames {
                acks.push(push(&controller, &processor, frame).await.unwrap());
            }
            runs.push((
                controller.mode().await,
                acks,
                controller.transitions().await,
                controller.device_state().await.refresh_counter,
            ));
            controller.close().await.unwrap();
        }

        assert_eq!(runs[0].0, DeviceMode::Mock);
        assert_eq!(runs[1].0, DeviceMode::Hardware);
        assert_eq!(runs[0].1, runs[1].1);
        assert_eq!(runs[0].2, runs[1].2);
        assert_eq!(runs[0].3, runs[1].3);
        assert_eq!(
            runs[0].1.iter().map(Ack::refresh_mode).collect::<Vec<_>>(),
            vec![
                Some(RefreshMode::Full),
                None,
                Some(RefreshMode::Partial),
                Some(RefreshMode::Full)
            ]
        );
    }
}
