use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::display::{Ack, DisplayController};
use crate::error::{CycleError, DisplayError, RenderError};
use crate::metrics::{time_check, CycleOutcome, CycleResult, MetricsCollector, ServiceComponent};
use crate::processing::{DisplaySignature, FrameProcessor, ProcessedImage};
use crate::render::{Frame, FrameSource, FrameSourceKind, RenderTarget};

use super::policy::UpdatePolicy;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Minimum gap between two "still failing" alerts.
const ALERT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// The update loop: render, process, display, record. One cycle at a time.
pub struct UpdateScheduler {
    primary: Arc<dyn FrameSource>,
    fallback: Option<Arc<dyn FrameSource>>,
    target: RenderTarget,
    processor: FrameProcessor,
    display: Arc<DisplayController>,
    metrics: MetricsCollector,
    policy: UpdatePolicy,
    consecutive_failures: u32,
    last_alert: Option<Instant>,
    alerts_raised: u32,
}

impl UpdateScheduler {
    pub fn new(
        primary: Arc<dyn FrameSource>,
        fallback: Option<Arc<dyn FrameSource>>,
        target: RenderTarget,
        processor: FrameProcessor,
        display: Arc<DisplayController>,
        metrics: MetricsCollector,
        policy: UpdatePolicy,
    ) -> Self {
        Self {
            primary,
            fallback,
            target,
            processor,
            display,
            metrics,
            policy,
            consecutive_failures: 0,
            last_alert: None,
            alerts_raised: 0,
        }
    }

    pub fn display(&self) -> &Arc<DisplayController> {
        &self.display
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn alerts_raised(&self) -> u32 {
        self.alerts_raised
    }

    /// Wait before the next tick, including failure backoff.
    pub fn next_delay(&self) -> Duration {
        self.policy.next_delay(self.consecutive_failures)
    }

    /// Run cycles until `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) {
        log_info!(
            "update loop started: every {}s, {:?} renderer",
            self.policy.update_interval.as_secs(),
            self.primary.kind()
        );
        self.run_until(&cancel, None, |_| {}).await;
        log_info!("update loop stopped");
    }

    /// Run cycles on the interval for `duration`. A tick due at or after the
    /// deadline is not started.
    pub async fn run_for(&mut self, duration: Duration, cancel: &CancellationToken) -> Vec<CycleResult> {
        let mut results = Vec::new();
        let deadline = Instant::now() + duration;
        self.run_until(cancel, Some(deadline), |result| results.push(result.clone()))
            .await;
        results
    }

    /// A single cycle; `force_full` redraws the whole panel regardless of change.
    pub async fn run_once(&mut self, force_full: bool) -> CycleResult {
        self.run_cycle(&CancellationToken::new(), force_full).await
    }

    /// Stop the render sources and put the display to sleep.
    pub async fn shutdown(&self) {
        self.primary.shutdown().await;
        if let Some(fallback) = &self.fallback {
            fallback.shutdown().await;
        }
        if let Err(err) = self.display.close().await {
            log_warn!("failed to close display: {err}");
        }
    }

    async fn run_until<F>(&mut self, cancel: &CancellationToken, deadline: Option<Instant>, mut on_cycle: F)
    where
        F: FnMut(&CycleResult),
    {
        let mut next_tick = Instant::now();
        loop {
            if deadline.is_some_and(|deadline| next_tick >= deadline) {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep_until(next_tick) => {}
            }

            let result = self.cycle(cancel, false, Some(next_tick)).await;
            on_cycle(&result);

            let scheduled = next_tick + self.next_delay();
            let now = Instant::now();
            if scheduled < now {
                log_warn!(
                    "cycle overran its slot by {}ms, starting next one immediately",
                    now.duration_since(scheduled).as_millis()
                );
            }
            next_tick = scheduled.max(now);
        }
    }

    pub async fn run_cycle(&mut self, cancel: &CancellationToken, force_full: bool) -> CycleResult {
        self.cycle(cancel, force_full, None).await
    }

    /// `scheduled` is the loop tick this cycle was meant to run at.
    async fn cycle(
        &mut self,
        cancel: &CancellationToken,
        force_full: bool,
        scheduled: Option<Instant>,
    ) -> CycleResult {
        let started = Instant::now();
        let mut result = CycleResult::new(Utc::now(), CycleOutcome::Skipped);

        let outcome = self.execute(cancel, force_full, &mut result).await;
        result.durations.total_ms = millis(started.elapsed());

        match outcome {
            Ok(()) => {
                result.outcome = CycleOutcome::Success;
                self.consecutive_failures = 0;
            }
            Err(err) => {
                result.outcome = match &err {
                    CycleError::Cancelled => CycleOutcome::Skipped,
                    CycleError::RenderExhausted { .. } => CycleOutcome::RenderFailed,
                    CycleError::DisplayExhausted { attempts, .. } => {
                        result.display_attempts = *attempts;
                        CycleOutcome::DisplayFailed
                    }
                };
                if err != CycleError::Cancelled {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                }
                log_warn!(
                    "cycle {} ({}): {err}; {} consecutive failures",
                    result.outcome.as_str(),
                    err.kind(),
                    self.consecutive_failures
                );
                result.error = Some(err.to_string());
            }
        }
        self.raise_alert_if_due();

        self.metrics.set_browser_pid(self.primary.browser_pid()).await;
        self.metrics.record_cycle(&result).await;
        if let Some(tick) = scheduled.filter(|_| result.outcome != CycleOutcome::Skipped) {
            let offset = Instant::now().saturating_duration_since(tick).as_secs_f64();
            self.metrics.record_timing_offset(offset).await;
        }

        if result.outcome.is_success() {
            log_info!(
                "cycle done in {}ms (render {}ms, process {}ms, display {}ms, {})",
                result.durations.total_ms,
                result.durations.render_ms,
                result.durations.process_ms,
                result.durations.display_ms,
                result
                    .refresh_mode
                    .map(|mode| mode.as_str())
                    .unwrap_or("unchanged")
            );
        }
        result
    }

    async fn execute(
        &mut self,
        cancel: &CancellationToken,
        force_full: bool,
        result: &mut CycleResult,
    ) -> Result<(), CycleError> {
        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }
        // a restart here can take up to render_timeout
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CycleError::Cancelled),
            maintained = self.primary.maintain(Instant::now()) => {
                if let Err(err) = maintained {
                    log_warn!("render source maintenance failed: {err}");
                }
            }
        }

        let render_started = Instant::now();
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CycleError::Cancelled),
            rendered = self.render() => rendered?,
        };
        result.durations.render_ms = millis(render_started.elapsed());
        result.render_kind = Some(frame.source());

        let captured_at = frame.captured_at().with_timezone(&Local);
        if let Some(check) = time_check::validate(frame.page_text(), captured_at) {
            check.log_summary();
            self.metrics.record_time_check(&check).await;
        }

        let process_started = Instant::now();
        let last = self.display.last_displayed().await;
        let since = self.display.device_state().await.since_last_full_refresh;
        let (image, signature) = self.processor.process(&frame, last.as_ref(), since);
        drop(frame);
        result.durations.process_ms = millis(process_started.elapsed());
        result.content_hash = Some(signature.content_hash);
        log_debug!(
            "frame {:016x}: {:?}, {} since last full refresh",
            signature.content_hash,
            signature.change,
            signature.since_last_full_refresh
        );

        // abandon before the device lock is ever taken
        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }

        let display_started = Instant::now();
        let displayed = self.update_display(image, &signature, force_full, cancel).await;
        result.durations.display_ms = millis(display_started.elapsed());
        let (ack, attempts) = displayed?;
        result.display_attempts = attempts;
        result.refresh_mode = ack.refresh_mode();
        Ok(())
    }

    /// Primary source, then the fallback once. Both results are typed so the
    /// caller sees exactly which stage failed.
    async fn render(&self) -> Result<Frame, CycleError> {
        let primary = match self.attempt(self.primary.as_ref()).await {
            Ok(frame) => return Ok(frame),
            Err(err) => err,
        };
        log_warn!("{:?} render failed: {primary}", self.primary.kind());

        let Some(fallback) = &self.fallback else {
            return Err(CycleError::RenderExhausted {
                primary,
                fallback: None,
            });
        };
        match self.attempt(fallback.as_ref()).await {
            Ok(frame) => {
                log_info!("recovered with {:?} render", fallback.kind());
                Ok(frame)
            }
            Err(err) => Err(CycleError::RenderExhausted {
                primary,
                fallback: Some(err),
            }),
        }
    }

    async fn attempt(&self, source: &dyn FrameSource) -> Result<Frame, RenderError> {
        // startup and capture each get render_timeout inside the source
        let budget = self.policy.render_timeout * 2;
        let started = Instant::now();
        let rendered = timeout(budget, source.render(&self.target))
            .await
            .unwrap_or(Err(RenderError::CaptureTimeout(budget)));
        self.metrics
            .record_render_attempt(source.kind(), rendered.is_ok(), started.elapsed())
            .await;
        if source.kind() == FrameSourceKind::Persistent {
            self.metrics
                .set_service_status(ServiceComponent::Browser, rendered.is_ok())
                .await;
        }
        rendered
    }

    /// Retry with a fixed delay. The controller releases the device lock
    /// before returning, so the delay never holds it.
    async fn update_display(
        &self,
        image: ProcessedImage,
        signature: &DisplaySignature,
        force_full: bool,
        cancel: &CancellationToken,
    ) -> Result<(Ack, u32), CycleError> {
        let max_attempts = self.policy.display_retries.max(1);
        let mut attempts = 0;
        let mut last = DisplayError::Unavailable("no display attempt made".into());

        while attempts < max_attempts {
            attempts += 1;
            let outcome = if force_full {
                self.display.force_full_update(image.clone(), signature).await
            } else {
                self.display.update(image.clone(), signature).await
            };

            match outcome {
                Ok(ack) => {
                    self.metrics.set_service_status(ServiceComponent::Display, true).await;
                    return Ok((ack, attempts));
                }
                Err(err) => {
                    log_warn!("display attempt {attempts}/{max_attempts} failed: {err}");
                    let retryable = !matches!(err, DisplayError::DimensionMismatch { .. });
                    last = err;
                    if !retryable || attempts == max_attempts {
                        break;
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(CycleError::Cancelled),
                        _ = sleep(self.policy.display_retry_delay) => {}
                    }
                }
            }
        }

        self.metrics.set_service_status(ServiceComponent::Display, false).await;
        Err(CycleError::DisplayExhausted { attempts, last })
    }

    fn raise_alert_if_due(&mut self) {
        if self.consecutive_failures < self.policy.max_consecutive_failures {
            return;
        }
        let now = Instant::now();
        if self
            .last_alert
            .is_some_and(|at| now.duration_since(at) < ALERT_WINDOW)
        {
            return;
        }
        self.last_alert = Some(now);
        self.alerts_raised += 1;
        log_error!(
            "dashboard has failed {} cycles in a row; still retrying every {}s",
            self.consecutive_failures,
            self.next_delay().as_secs()
        );
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::{DisplayPolicy, MockBackend, RefreshMode};
    use crate::processing::ColorDepth;
    use crate::render::session::tests::{config as session_config, FakeLauncher, Tracker, URL};
    use crate::render::{PageText, PatternSource, RenderSession};
    use crate::scheduler::policy::{BackoffPolicy, Jitter};
    use async_trait::async_trait;
    use image::DynamicImage;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    const W: u32 = 64;
    const H: u32 = 32;

    fn policy() -> UpdatePolicy {
        UpdatePolicy {
            update_interval: Duration::from_secs(3),
            max_consecutive_failures: 3,
            full_refresh_every: 60,
            coverage_threshold: 0.4,
            render_timeout: Duration::from_secs(5),
            display_timeout: Duration::from_secs(5),
            browser_max_age: Duration::from_secs(86_400),
            display_retries: 3,
            display_retry_delay: Duration::from_secs(2),
            backoff: BackoffPolicy {
                first: Duration::from_secs(3),
                max: Duration::from_secs(60),
                factor: 2.0,
                jitter: Jitter::None,
            },
        }
    }

    /// Shows the whole seconds elapsed since creation, like a clock page.
    struct CounterSource {
        started: Instant,
        kind: FrameSourceKind,
        fail_first: u32,
        page_text: PageText,
        calls: AtomicU32,
        maintained: AtomicU32,
    }

    impl CounterSource {
        fn new(kind: FrameSourceKind) -> Self {
            Self {
                started: Instant::now(),
                kind,
                fail_first: 0,
                page_text: PageText::NotCaptured,
                calls: AtomicU32::new(0),
                maintained: AtomicU32::new(0),
            }
        }

        fn failing_first(mut self, count: u32) -> Self {
            self.fail_first = count;
            self
        }

        fn showing(mut self, page_text: PageText) -> Self {
            self.page_text = page_text;
            self
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FrameSource for CounterSource {
        fn kind(&self) -> FrameSourceKind {
            self.kind
        }

        async fn maintain(&self, _now: Instant) -> Result<(), RenderError> {
            self.maintained.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn render(&self, _target: &RenderTarget) -> Result<Frame, RenderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err(RenderError::ProcessCrashed(format!("simulated crash {call}")));
            }
            let seconds = self.started.elapsed().as_secs() as u32;
            let img = PatternSource::draw(W, H, seconds);
            Ok(Frame::new(DynamicImage::ImageLuma8(img), self.kind).with_page_text(self.page_text.clone()))
        }
    }

    async fn scheduler_with(
        primary: Arc<dyn FrameSource>,
        fallback: Option<Arc<dyn FrameSource>>,
        backend: MockBackend,
        policy: UpdatePolicy,
    ) -> UpdateScheduler {
        let display_policy: DisplayPolicy = policy.display_policy(W, H, ColorDepth::Bw);
        let display = DisplayController::open(Box::new(backend), display_policy, None)
            .await
            .unwrap();
        UpdateScheduler::new(
            primary,
            fallback,
            RenderTarget::Url("http://localhost/dashboard".into()),
            FrameProcessor::new(W, H, 0, ColorDepth::Bw),
            Arc::new(display),
            MetricsCollector::new(policy.update_interval),
            policy,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_nine_seconds_at_three_second_interval() {
        let source = Arc::new(CounterSource::new(FrameSourceKind::Persistent));
        let mut scheduler = scheduler_with(source.clone(), None, MockBackend::new(), policy()).await;

        let results = scheduler
            .run_for(Duration::from_secs(9), &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.outcome == CycleOutcome::Success));
        let hashes: Vec<u64> = results.iter().filter_map(|r| r.content_hash).collect();
        assert_eq!(hashes.len(), 3);
        assert_eq!(hashes.iter().collect::<HashSet<_>>().len(), 3);
        assert_eq!(source.maintained.load(Ordering::SeqCst), 3);
        assert_eq!(results[0].refresh_mode, Some(RefreshMode::Full));
        assert_eq!(results[1].refresh_mode, Some(RefreshMode::Partial));
        assert_eq!(scheduler.display().device_state().await.refresh_counter, 3);

        // every tick started on time and finished instantly
        let snapshot = scheduler.metrics().snapshot().await;
        assert_eq!(snapshot.update_timing_offset.count, 3);
        assert_eq!(snapshot.update_timing_offset.buckets[5], 3); // <= 0
        assert!(snapshot.service_status["browser"]);
        assert!(snapshot.service_status["display"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_completion_is_a_positive_offset() {
        let source = Arc::new(CounterSource::new(FrameSourceKind::Persistent));
        let backend = MockBackend::new().with_write_failures(1);
        let mut scheduler = scheduler_with(source, None, backend, policy()).await;

        // one display retry delays the first cycle by 2s
        let results = scheduler
            .run_for(Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert_eq!(results.len(), 1);

        let offset = scheduler.metrics().snapshot().await.update_timing_offset;
        assert_eq!(offset.count, 1);
        assert!(offset.sum >= 2.0 && offset.sum < 2.01);
        assert_eq!(offset.buckets[8], 0); // <= 1
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_cycles_have_no_timing_offset() {
        let source = Arc::new(CounterSource::new(FrameSourceKind::Persistent));
        let mut scheduler = scheduler_with(source, None, MockBackend::new(), policy()).await;
        scheduler.run_once(true).await;
        assert_eq!(scheduler.metrics().snapshot().await.update_timing_offset.count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_on_page_is_validated() {
        let source = Arc::new(
            CounterSource::new(FrameSourceKind::Persistent)
                .showing(PageText::Captured(vec!["Updated 10:27 AM".into()])),
        );
        let mut scheduler = scheduler_with(source, None, MockBackend::new(), policy()).await;
        scheduler.run_once(false).await;

        let snapshot = scheduler.metrics().snapshot().await;
        assert_eq!(snapshot.time_validation_total.values().sum::<u64>(), 1);
        assert_eq!(snapshot.time_offset_minutes.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_page_counts_as_time_check_error() {
        let source = Arc::new(
            CounterSource::new(FrameSourceKind::Persistent)
                .showing(PageText::Unreadable("devtools closed".into())),
        );
        let mut scheduler = scheduler_with(source, None, MockBackend::new(), policy()).await;
        let result = scheduler.run_once(false).await;
        assert_eq!(result.outcome, CycleOutcome::Success);

        let snapshot = scheduler.metrics().snapshot().await;
        assert_eq!(snapshot.time_validation_total["error"], 1);
        assert_eq!(snapshot.time_offset_minutes.count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_failures_fall_back_then_back_off() {
        let primary = Arc::new(CounterSource::new(FrameSourceKind::Persistent).failing_first(u32::MAX));
        let cold = Arc::new(CounterSource::new(FrameSourceKind::Cold).failing_first(2));
        let mut scheduler =
            scheduler_with(primary.clone(), Some(cold.clone()), MockBackend::new(), policy()).await;

        let first = scheduler.run_once(false).await;
        assert_eq!(first.outcome, CycleOutcome::RenderFailed);
        assert_eq!((primary.calls(), cold.calls()), (1, 1));
        assert_eq!(scheduler.next_delay(), Duration::from_secs(6));

        let second = scheduler.run_once(false).await;
        assert_eq!(second.outcome, CycleOutcome::RenderFailed);
        assert_eq!(scheduler.consecutive_failures(), 2);
        // backoff is in force before the third cycle
        assert_eq!(scheduler.next_delay(), Duration::from_secs(9));
        assert_eq!(scheduler.display().device_state().await.refresh_counter, 0);

        let third = scheduler.run_once(false).await;
        assert_eq!(third.outcome, CycleOutcome::Success);
        assert_eq!(third.render_kind, Some(FrameSourceKind::Cold));
        assert_eq!(scheduler.consecutive_failures(), 0);
        assert_eq!(scheduler.next_delay(), Duration::from_secs(3));

        let snapshot = scheduler.metrics().snapshot().await;
        assert!(!snapshot.service_status["browser"]);
        assert_eq!(snapshot.render_attempts_total["persistent_browser"]["failure"], 3);
        assert_eq!(snapshot.render_attempts_total["standard"]["failure"], 2);
        assert_eq!(snapshot.render_attempts_total["standard"]["success"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_waits_out_backoff() {
        let primary = Arc::new(CounterSource::new(FrameSourceKind::Persistent).failing_first(u32::MAX));
        let mut scheduler = scheduler_with(primary.clone(), None, MockBackend::new(), policy()).await;

        // ticks at 0s and 6s (3s + 3s backoff); the next would be 15s
        let results = scheduler
            .run_for(Duration::from_secs(12), &CancellationToken::new())
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.outcome == CycleOutcome::RenderFailed));
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_retry_counts_one_refresh() {
        let source = Arc::new(CounterSource::new(FrameSourceKind::Persistent));
        let backend = MockBackend::new().with_write_failures(2);
        let mut scheduler = scheduler_with(source, None, backend, policy()).await;

        let started = Instant::now();
        let result = scheduler.run_once(false).await;

        assert_eq!(result.outcome, CycleOutcome::Success);
        assert_eq!(result.display_attempts, 3);
        assert_eq!(scheduler.display().device_state().await.refresh_counter, 1);
        // two fixed retry delays
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_exhaustion_marks_cycle_failed() {
        let source = Arc::new(CounterSource::new(FrameSourceKind::Persistent));
        let backend = MockBackend::new().with_write_failures(5);
        let mut scheduler = scheduler_with(source, None, backend, policy()).await;

        let result = scheduler.run_once(false).await;
        assert_eq!(result.outcome, CycleOutcome::DisplayFailed);
        assert_eq!(result.display_attempts, 3);
        assert!(!scheduler.metrics().snapshot().await.service_status["display"]);
        assert_eq!(scheduler.consecutive_failures(), 1);
        assert_eq!(scheduler.display().device_state().await.refresh_counter, 0);

        // two failures left, then success on the next cycle
        let result = scheduler.run_once(false).await;
        assert_eq!(result.outcome, CycleOutcome::Success);
        assert_eq!(scheduler.display().device_state().await.refresh_counter, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_is_rate_limited() {
        let primary = Arc::new(CounterSource::new(FrameSourceKind::Persistent).failing_first(u32::MAX));
        let mut scheduler = scheduler_with(primary, None, MockBackend::new(), policy()).await;

        for _ in 0..6 {
            scheduler.run_once(false).await;
        }
        assert_eq!(scheduler.consecutive_failures(), 6);
        assert_eq!(scheduler.alerts_raised(), 1);

        tokio::time::advance(ALERT_WINDOW).await;
        scheduler.run_once(false).await;
        assert_eq!(scheduler.alerts_raised(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_cycle_is_skipped_without_rendering() {
        let source = Arc::new(CounterSource::new(FrameSourceKind::Persistent));
        let mut scheduler = scheduler_with(source.clone(), None, MockBackend::new(), policy()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = scheduler.run_cycle(&cancel, false).await;
        assert_eq!(result.outcome, CycleOutcome::Skipped);
        assert_eq!(source.calls(), 0);
        assert_eq!(scheduler.consecutive_failures(), 0);

        scheduler.run(cancel).await;
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_browser_restart() {
        let tracker = Arc::new(Tracker::default());
        let mut launcher = FakeLauncher::new(tracker.clone());
        launcher.launch_delay = Duration::from_secs(60);
        let session = RenderSession::new(Arc::new(launcher), session_config());
        // three timed-out starts leave the session due for a restart
        for _ in 0..3 {
            assert!(session.ensure_ready(URL).await.is_err());
        }
        let mut scheduler =
            scheduler_with(Arc::new(session.clone()), None, MockBackend::new(), policy()).await;

        let cancel = CancellationToken::new();
        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            })
        };

        let started = Instant::now();
        let result = scheduler.run_cycle(&cancel, false).await;
        let elapsed = started.elapsed();
        stopper.await.unwrap();

        assert_eq!(result.outcome, CycleOutcome::Skipped);
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed <= Duration::from_secs(1) + Duration::from_millis(1));
        assert_eq!(scheduler.consecutive_failures(), 0);
        assert_eq!(tracker.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_update_redraws_unchanged_frame() {
        let source = Arc::new(CounterSource::new(FrameSourceKind::Persistent));
        let mut scheduler = scheduler_with(source, None, MockBackend::new(), policy()).await;

        let first = scheduler.run_once(false).await;
        assert_eq!(first.refresh_mode, Some(RefreshMode::Full));

        let unchanged = scheduler.run_once(false).await;
        assert_eq!(unchanged.outcome, CycleOutcome::Success);
        assert_eq!(unchanged.refresh_mode, None);

        let forced = scheduler.run_once(true).await;
        assert_eq!(forced.refresh_mode, Some(RefreshMode::Full));
        assert_eq!(scheduler.display().device_state().await.refresh_counter, 2);
    }
}
