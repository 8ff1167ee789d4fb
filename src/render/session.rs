use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{timeout, Instant};

use crate::error::RenderError;

use super::{
    BrowserLauncher, BrowserProcess, Frame, FrameSource, FrameSourceKind, PageText, RenderTarget,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Slack past `render_timeout` so a launcher can reap a browser that missed
/// its own startup deadline.
const LAUNCH_GRACE: Duration = Duration::from_secs(2);
const PAGE_TEXT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Starting,
    Ready,
    Degraded,
    Restarting,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub render_timeout: Duration,
    pub browser_max_age: Duration,
    pub max_consecutive_failures: u32,
}

struct RenderSessionState {
    status: SessionStatus,
    process: Option<Box<dyn BrowserProcess>>,
    target_url: String,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    last_frame_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl RenderSessionState {
    fn fail(&mut self, status: SessionStatus) {
        self.status = status;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

/// Supervised long-lived browser.
///
/// Clones share the same session. Capture and start requests never queue:
/// if another request holds the session they fail with
/// [`RenderError::SessionBusy`]. Lifecycle operations (`restart_if_stale`,
/// `force_restart`, `shutdown`) wait for the in-flight request instead, so
/// the old process is always reaped before a new one is spawned.
#[derive(Clone)]
pub struct RenderSession {
    launcher: Arc<dyn BrowserLauncher>,
    config: SessionConfig,
    inner: Arc<Mutex<Option<RenderSessionState>>>,
    pid: Arc<AtomicU32>,
}

impl RenderSession {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, config: SessionConfig) -> Self {
        Self {
            launcher,
            config,
            inner: Arc::new(Mutex::new(None)),
            pid: Arc::new(AtomicU32::new(0)),
        }
    }

    /// `None` until the first render request creates the session.
    pub async fn status(&self) -> Option<SessionStatus> {
        self.inner.lock().await.as_ref().map(|state| state.status)
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.inner
            .lock()
            .await
            .as_ref()
            .map(|state| state.consecutive_failures)
            .unwrap_or(0)
    }

    pub async fn last_frame_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().await.as_ref().and_then(|state| state.last_frame_at)
    }

    pub async fn ensure_ready(&self, url: &str) -> Result<(), RenderError> {
        let mut guard = self.try_acquire()?;
        self.ensure_ready_locked(&mut guard, url).await
    }

    pub async fn capture_frame(&self) -> Result<Frame, RenderError> {
        let mut guard = self.try_acquire()?;
        self.capture_locked(&mut guard).await
    }

    /// Replace the browser when it is older than `browser_max_age` or has
    /// failed `max_consecutive_failures` times in a row. Returns whether a
    /// restart happened.
    pub async fn restart_if_stale(&self, now: Instant) -> Result<bool, RenderError> {
        let mut guard = self.inner.lock().await;
        let Some(state) = guard.as_ref() else {
            return Ok(false);
        };

        let age = now.saturating_duration_since(state.started_at);
        let too_old = age > self.config.browser_max_age;
        let failing = state.consecutive_failures >= self.config.max_consecutive_failures;
        if !too_old && !failing {
            return Ok(false);
        }

        if too_old {
            log_info!(
                "browser started at {} is {}s old, restarting",
                state.started_wall,
                age.as_secs()
            );
        } else {
            log_warn!(
                "browser failed {} times in a row, restarting",
                state.consecutive_failures
            );
        }

        let url = state.target_url.clone();
        self.restart_locked(&mut guard, &url).await?;
        Ok(true)
    }

    /// Unconditional restart with the current target.
    pub async fn force_restart(&self) -> Result<(), RenderError> {
        let mut guard = self.inner.lock().await;
        let url = guard
            .as_ref()
            .map(|state| state.target_url.clone())
            .ok_or(RenderError::NotReady)?;
        self.restart_locked(&mut guard, &url).await
    }

    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(mut state) = guard.take() {
            if let Some(mut process) = state.process.take() {
                log_info!("terminating persistent browser (pid {:?})", process.pid());
                process.terminate().await;
            }
        }
        self.pid.store(0, Ordering::SeqCst);
    }

    fn try_acquire(&self) -> Result<MutexGuard<'_, Option<RenderSessionState>>, RenderError> {
        self.inner.try_lock().map_err(|_| RenderError::SessionBusy)
    }

    async fn ensure_ready_locked(
        &self,
        slot: &mut Option<RenderSessionState>,
        url: &str,
    ) -> Result<(), RenderError> {
        if let Some(state) = slot.as_ref() {
            if state.status == SessionStatus::Ready
                && state.process.is_some()
                && state.target_url == url
            {
                return Ok(());
            }
        }
        self.restart_locked(slot, url).await
    }

    /// Terminate whatever is running, then start a fresh browser.
    async fn restart_locked(
        &self,
        slot: &mut Option<RenderSessionState>,
        url: &str,
    ) -> Result<(), RenderError> {
        let mut carried_failures = 0;
        if let Some(state) = slot.as_mut() {
            state.status = SessionStatus::Restarting;
            carried_failures = state.consecutive_failures;
            if let Some(mut process) = state.process.take() {
                log_debug!("terminating browser pid {:?} before restart", process.pid());
                process.terminate().await;
            }
            self.pid.store(0, Ordering::SeqCst);
        }

        let now = Instant::now();
        let state = slot.insert(RenderSessionState {
            status: SessionStatus::Starting,
            process: None,
            target_url: url.to_string(),
            started_at: now,
            started_wall: Utc::now(),
            last_frame_at: None,
            consecutive_failures: carried_failures,
        });

        log_info!("starting persistent browser for {url}");
        let budget = self.config.render_timeout + LAUNCH_GRACE;
        match timeout(budget, self.launcher.launch(url)).await {
            Ok(Ok(process)) => {
                self.pid.store(process.pid().unwrap_or(0), Ordering::SeqCst);
                log_info!(
                    "persistent browser ready (pid {:?}) in {}ms",
                    process.pid(),
                    now.elapsed().as_millis()
                );
                state.process = Some(process);
                state.status = SessionStatus::Ready;
                state.consecutive_failures = 0;
                Ok(())
            }
            Ok(Err(err)) => {
                log_warn!("persistent browser failed to start: {err}");
                state.fail(SessionStatus::Degraded);
                Err(err)
            }
            Err(_) => {
                log_warn!(
                    "persistent browser not ready after {:?}",
                    self.config.render_timeout
                );
                state.fail(SessionStatus::Degraded);
                Err(RenderError::StartupTimeout(self.config.render_timeout))
            }
        }
    }

    async fn capture_locked(
        &self,
        slot: &mut Option<RenderSessionState>,
    ) -> Result<Frame, RenderError> {
        let state = slot.as_mut().ok_or(RenderError::NotReady)?;
        if state.status != SessionStatus::Ready {
            return Err(RenderError::NotReady);
        }
        let process = state.process.as_mut().ok_or(RenderError::NotReady)?;

        let started = Instant::now();
        let result = timeout(self.config.render_timeout, process.screenshot()).await;
        match result {
            Ok(Ok(bytes)) => match Frame::from_png(&bytes, FrameSourceKind::Persistent) {
                Ok(frame) => {
                    // the frame stands even when the text cannot be read
                    let page_text = match timeout(PAGE_TEXT_TIMEOUT, process.clock_text()).await {
                        Ok(Ok(texts)) => PageText::Captured(texts),
                        Ok(Err(err)) => PageText::Unreadable(err.to_string()),
                        Err(_) => PageText::Unreadable(format!(
                            "no page text after {PAGE_TEXT_TIMEOUT:?}"
                        )),
                    };
                    let frame = frame.with_page_text(page_text);
                    state.last_frame_at = Some(frame.captured_at());
                    state.consecutive_failures = 0;
                    log_debug!(
                        "persistent screenshot: {} bytes in {}ms",
                        bytes.len(),
                        started.elapsed().as_millis()
                    );
                    Ok(frame)
                }
                Err(err) => {
                    log_warn!("persistent screenshot undecodable: {err}");
                    state.fail(SessionStatus::Degraded);
                    Err(err)
                }
            },
            Ok(Err(err)) => {
                log_warn!("persistent capture failed: {err}");
                state.fail(SessionStatus::Degraded);
                Err(err)
            }
            Err(_) => {
                log_warn!(
                    "persistent capture exceeded {:?}",
                    self.config.render_timeout
                );
                state.fail(SessionStatus::Degraded);
                Err(RenderError::CaptureTimeout(self.config.render_timeout))
            }
        }
    }
}

#[async_trait]
impl FrameSource for RenderSession {
    fn kind(&self) -> FrameSourceKind {
        FrameSourceKind::Persistent
    }

    async fn maintain(&self, now: Instant) -> Result<(), RenderError> {
        self.restart_if_stale(now).await.map(|_| ())
    }

    async fn render(&self, target: &RenderTarget) -> Result<Frame, RenderError> {
        let url = target
            .browser_url()
            .ok_or_else(|| RenderError::Launch("target has no browser url".into()))?;
        // One guard for both steps so nothing can slip in between.
        let mut guard = self.try_acquire()?;
        self.ensure_ready_locked(&mut guard, &url).await?;
        self.capture_locked(&mut guard).await
    }

    async fn shutdown(&self) {
        RenderSession::shutdown(self).await;
    }

    fn browser_pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    pub(crate) fn png_bytes(shade: u8) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(GrayImage::from_pixel(16, 8, Luma([shade])))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[derive(Clone, Copy)]
    pub(crate) enum Shot {
        Ok,
        Crash,
        Hang,
        Garbage,
    }

    #[derive(Default)]
    pub(crate) struct Tracker {
        pub(crate) live: AtomicUsize,
        pub(crate) max_live: AtomicUsize,
        pub(crate) launches: AtomicU32,
        events: StdMutex<Vec<String>>,
    }

    impl Tracker {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    pub(crate) struct FakeLauncher {
        tracker: Arc<Tracker>,
        pub(crate) launch_delay: Duration,
        pub(crate) shot_delay: Duration,
        pub(crate) page_text: Vec<String>,
        shots: StdMutex<Vec<Shot>>,
    }

    impl FakeLauncher {
        pub(crate) fn new(tracker: Arc<Tracker>) -> Self {
            Self {
                tracker,
                launch_delay: Duration::ZERO,
                shot_delay: Duration::ZERO,
                page_text: Vec::new(),
                shots: StdMutex::new(Vec::new()),
            }
        }

        /// Outcomes consumed by successive screenshots; `Ok` once exhausted.
        pub(crate) fn with_shots(self, shots: Vec<Shot>) -> Self {
            *self.shots.lock().unwrap() = shots;
            self
        }
    }

    struct FakeProcess {
        id: u32,
        tracker: Arc<Tracker>,
        shot_delay: Duration,
        page_text: Vec<String>,
        next: Shot,
        alive: bool,
    }

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        async fn launch(&self, _url: &str) -> Result<Box<dyn BrowserProcess>, RenderError> {
            tokio::time::sleep(self.launch_delay).await;
            let id = self.tracker.launches.fetch_add(1, Ordering::SeqCst) + 1;
            let live = self.tracker.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.tracker.max_live.fetch_max(live, Ordering::SeqCst);
            self.tracker.push(format!("launch {id}"));
            let next = {
                let mut shots = self.shots.lock().unwrap();
                if shots.is_empty() {
                    Shot::Ok
                } else {
                    shots.remove(0)
                }
            };
            Ok(Box::new(FakeProcess {
                id,
                tracker: self.tracker.clone(),
                shot_delay: self.shot_delay,
                page_text: self.page_text.clone(),
                next,
                alive: true,
            }))
        }
    }

    #[async_trait]
    impl BrowserProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(1000 + self.id)
        }

        async fn screenshot(&mut self) -> Result<Vec<u8>, RenderError> {
            tokio::time::sleep(self.shot_delay).await;
            match self.next {
                Shot::Ok => {
                    self.tracker.push(format!("shot {}", self.id));
                    Ok(png_bytes(128))
                }
                Shot::Crash => Err(RenderError::ProcessCrashed("renderer gone".into())),
                Shot::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Shot::Garbage => Ok(b"\x89PNG truncated".to_vec()),
            }
        }

        async fn clock_text(&mut self) -> Result<Vec<String>, RenderError> {
            Ok(self.page_text.clone())
        }

        async fn terminate(&mut self) {
            if self.alive {
                self.alive = false;
                self.tracker.live.fetch_sub(1, Ordering::SeqCst);
                self.tracker.push(format!("terminate {}", self.id));
            }
        }
    }

    pub(crate) fn config() -> SessionConfig {
        SessionConfig {
            render_timeout: Duration::from_secs(5),
            browser_max_age: Duration::from_secs(24 * 3600),
            max_consecutive_failures: 3,
        }
    }

    fn session_with(launcher: FakeLauncher) -> RenderSession {
        RenderSession::new(Arc::new(launcher), config())
    }

    pub(crate) const URL: &str = "https://dakboard.example/screen";

    #[tokio::test(start_paused = true)]
    async fn test_ensure_ready_is_idempotent() {
        let tracker = Arc::new(Tracker::default());
        let session = session_with(FakeLauncher::new(tracker.clone()));

        assert_eq!(session.status().await, None);
        session.ensure_ready(URL).await.unwrap();
        session.ensure_ready(URL).await.unwrap();

        assert_eq!(tracker.launches.load(Ordering::SeqCst), 1);
        assert_eq!(session.status().await, Some(SessionStatus::Ready));
        assert_eq!(FrameSource::browser_pid(&session), Some(1001));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_startup_times_out() {
        let tracker = Arc::new(Tracker::default());
        let mut launcher = FakeLauncher::new(tracker.clone());
        launcher.launch_delay = Duration::from_secs(60);
        let session = session_with(launcher);

        let err = session.ensure_ready(URL).await.unwrap_err();
        assert_eq!(err, RenderError::StartupTimeout(Duration::from_secs(5)));
        assert_eq!(session.status().await, Some(SessionStatus::Degraded));
        assert_eq!(session.consecutive_failures().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_requires_ready() {
        let session = session_with(FakeLauncher::new(Arc::new(Tracker::default())));
        assert_eq!(
            session.capture_frame().await.unwrap_err(),
            RenderError::NotReady
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_produces_persistent_frame() {
        let session = session_with(FakeLauncher::new(Arc::new(Tracker::default())));
        let frame = session
            .render(&RenderTarget::Url(URL.into()))
            .await
            .unwrap();

        assert_eq!(frame.source(), FrameSourceKind::Persistent);
        assert_eq!((frame.width(), frame.height()), (16, 8));
        assert_eq!(frame.page_text(), &PageText::Captured(Vec::new()));
        assert!(session.last_frame_at().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_carries_clock_text() {
        let mut launcher = FakeLauncher::new(Arc::new(Tracker::default()));
        launcher.page_text = vec!["7:45 AM".into(), "Tuesday 7:45 AM Cloudy".into()];
        let session = session_with(launcher);

        let frame = session
            .render(&RenderTarget::Url(URL.into()))
            .await
            .unwrap();
        assert_eq!(
            frame.page_text(),
            &PageText::Captured(vec!["7:45 AM".into(), "Tuesday 7:45 AM Cloudy".into()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_degrades_and_next_render_replaces_process() {
        let tracker = Arc::new(Tracker::default());
        let session = session_with(
            FakeLauncher::new(tracker.clone()).with_shots(vec![Shot::Crash, Shot::Ok]),
        );
        let target = RenderTarget::Url(URL.into());

        let err = session.render(&target).await.unwrap_err();
        assert_eq!(err.kind(), "process_crashed");
        assert_eq!(session.status().await, Some(SessionStatus::Degraded));

        session.render(&target).await.unwrap();
        assert_eq!(
            tracker.events(),
            vec!["launch 1", "terminate 1", "launch 2", "shot 2"]
        );
        assert_eq!(tracker.max_live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_screenshot_degrades_and_restarts() {
        let tracker = Arc::new(Tracker::default());
        let session = session_with(
            FakeLauncher::new(tracker.clone()).with_shots(vec![Shot::Garbage, Shot::Ok]),
        );
        let target = RenderTarget::Url(URL.into());

        let err = session.render(&target).await.unwrap_err();
        assert_eq!(err.kind(), "decode");
        assert_eq!(session.status().await, Some(SessionStatus::Degraded));
        assert_eq!(session.consecutive_failures().await, 1);

        // degraded sessions are replaced on the next request
        session.render(&target).await.unwrap();
        assert_eq!(
            tracker.events(),
            vec!["launch 1", "terminate 1", "launch 2", "shot 2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_capture_times_out() {
        let session = session_with(
            FakeLauncher::new(Arc::new(Tracker::default())).with_shots(vec![Shot::Hang]),
        );
        session.ensure_ready(URL).await.unwrap();

        let err = session.capture_frame().await.unwrap_err();
        assert_eq!(err, RenderError::CaptureTimeout(Duration::from_secs(5)));
        assert_eq!(session.status().await, Some(SessionStatus::Degraded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_capture_fails_fast_while_one_is_pending() {
        let tracker = Arc::new(Tracker::default());
        let mut launcher = FakeLauncher::new(tracker.clone());
        launcher.shot_delay = Duration::from_secs(2);
        let session = session_with(launcher);
        session.ensure_ready(URL).await.unwrap();

        let background = session.clone();
        let pending = tokio::spawn(async move { background.capture_frame().await });
        tokio::task::yield_now().await;

        assert_eq!(
            session.capture_frame().await.unwrap_err(),
            RenderError::SessionBusy
        );
        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_restart_mid_capture_never_overlaps_processes() {
        let tracker = Arc::new(Tracker::default());
        let mut launcher = FakeLauncher::new(tracker.clone());
        launcher.shot_delay = Duration::from_secs(2);
        let session = session_with(launcher);
        session.ensure_ready(URL).await.unwrap();

        let background = session.clone();
        let pending = tokio::spawn(async move { background.capture_frame().await });
        tokio::task::yield_now().await;

        session.force_restart().await.unwrap();
        assert!(pending.await.unwrap().is_ok());

        assert_eq!(
            tracker.events(),
            vec!["launch 1", "shot 1", "terminate 1", "launch 2"]
        );
        assert_eq!(tracker.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_if_stale_by_age() {
        let tracker = Arc::new(Tracker::default());
        let session = session_with(FakeLauncher::new(tracker.clone()));
        session.ensure_ready(URL).await.unwrap();

        assert!(!session.restart_if_stale(Instant::now()).await.unwrap());

        tokio::time::advance(Duration::from_secs(24 * 3600 + 1)).await;
        assert!(session.restart_if_stale(Instant::now()).await.unwrap());

        assert_eq!(tracker.launches.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(session.status().await, Some(SessionStatus::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_if_stale_after_repeated_failures() {
        let tracker = Arc::new(Tracker::default());
        let mut launcher = FakeLauncher::new(tracker.clone());
        launcher.launch_delay = Duration::from_secs(60);
        let session = session_with(launcher);

        for _ in 0..3 {
            assert!(session.ensure_ready(URL).await.is_err());
        }
        assert_eq!(session.consecutive_failures().await, 3);
        assert!(session.restart_if_stale(Instant::now()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_terminates_process() {
        let tracker = Arc::new(Tracker::default());
        let session = session_with(FakeLauncher::new(tracker.clone()));
        session.ensure_ready(URL).await.unwrap();

        session.shutdown().await;
        assert_eq!(tracker.live.load(Ordering::SeqCst), 0);
        assert_eq!(session.status().await, None);
        assert_eq!(FrameSource::browser_pid(&session), None);
    }
}
