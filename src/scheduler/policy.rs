use std::time::Duration;

use rand::Rng;

use crate::display::DisplayPolicy;
use crate::processing::ColorDepth;
use crate::render::session::SessionConfig;

/// Randomisation applied to a backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    #[default]
    None,
    /// `delay/2 + random[0, delay/2]`
    Equal,
}

impl Jitter {
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Equal => {
                let ms = delay.as_millis() as u64;
                let half = ms / 2;
                if half == 0 {
                    return delay;
                }
                let extra = rand::thread_rng().gen_range(0..=half);
                Duration::from_millis(ms - half + extra)
            }
        }
    }
}

/// Capped exponential backoff: `first * factor^attempt`, clamped to `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: Jitter,
}

impl BackoffPolicy {
    /// Extra wait starts at one interval and doubles up to ten intervals
    /// (never below a minute).
    pub fn for_interval(interval: Duration) -> Self {
        Self {
            first: interval,
            max: (interval * 10).max(Duration::from_secs(60)),
            factor: 2.0,
            jitter: Jitter::Equal,
        }
    }

    /// Delay for the given 0-indexed attempt.
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        self.jitter.apply(base)
    }
}

/// Timing and retry knobs for the update loop. Read-only after startup.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePolicy {
    pub update_interval: Duration,
    pub max_consecutive_failures: u32,
    pub full_refresh_every: u32,
    pub coverage_threshold: f32,
    pub render_timeout: Duration,
    pub display_timeout: Duration,
    pub browser_max_age: Duration,
    /// Total display attempts per cycle, the first included.
    pub display_retries: u32,
    pub display_retry_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl UpdatePolicy {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            render_timeout: self.render_timeout,
            browser_max_age: self.browser_max_age,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    pub fn display_policy(&self, width: u32, height: u32, depth: ColorDepth) -> DisplayPolicy {
        DisplayPolicy {
            width,
            height,
            depth,
            full_refresh_every: self.full_refresh_every,
            coverage_threshold: self.coverage_threshold,
            display_timeout: self.display_timeout,
        }
    }

    /// Wait before the next cycle after `consecutive_failures` failed cycles.
    pub fn next_delay(&self, consecutive_failures: u32) -> Duration {
        match consecutive_failures {
            0 => self.update_interval,
            n => self.update_interval + self.backoff.next(n - 1),
        }
    }
}
