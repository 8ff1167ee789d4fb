//! Compares a clock shown on the dashboard with the system clock at capture
//! time. Only 12-hour `h:mm AM/PM` readings are recognised.

use chrono::{DateTime, Local, Timelike};
use serde::Serialize;

use crate::render::PageText;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const MINUTES_PER_DAY: f64 = 24.0 * 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeCheckStatus {
    Success,
    Warning,
    Error,
}

impl TimeCheckStatus {
    /// Label used by the metrics exposition (`status`).
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeCheckStatus::Success => "success",
            TimeCheckStatus::Warning => "warning",
            TimeCheckStatus::Error => "error",
        }
    }
}

/// A clock reading found in page text, in 24-hour form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayedClock {
    pub hour: u32,
    pub minute: u32,
    pub matched: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeCheck {
    pub status: TimeCheckStatus,
    /// Displayed minus system time, to a tenth of a minute.
    pub offset_minutes: Option<f64>,
    pub matched: Option<String>,
    pub detail: Option<String>,
}

impl TimeCheck {
    fn error(detail: String) -> Self {
        Self {
            status: TimeCheckStatus::Error,
            offset_minutes: None,
            matched: None,
            detail: Some(detail),
        }
    }

    pub fn log_summary(&self) {
        let matched = self.matched.as_deref().unwrap_or("unknown");
        match self.status {
            TimeCheckStatus::Success => {
                log_info!("time check passed: displayed '{matched}' is accurate");
            }
            TimeCheckStatus::Warning => {
                log_warn!("time check warning: {}", self.detail.as_deref().unwrap_or(matched));
            }
            TimeCheckStatus::Error => {
                log_error!("time check failed: {}", self.detail.as_deref().unwrap_or("no detail"));
            }
        }
    }
}

/// `None` when the page reported nothing that looks like a clock.
pub fn validate(page: &PageText, now: DateTime<Local>) -> Option<TimeCheck> {
    match page {
        PageText::NotCaptured => None,
        PageText::Unreadable(err) => Some(TimeCheck::error(format!("page text unavailable: {err}"))),
        PageText::Captured(texts) => {
            let clock = texts.iter().find_map(|text| find_clock(text))?;
            Some(compare(&clock, now))
        }
    }
}

/// First `h:mm AM|PM` in `text`, case-insensitive, optional spaces before
/// the meridiem.
pub fn find_clock(text: &str) -> Option<DisplayedClock> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(offset) = text[start..].find(':') {
        let colon = start + offset;
        start = colon + 1;

        let hour_start = (colon.saturating_sub(2)..colon)
            .find(|&i| bytes[i..colon].iter().all(u8::is_ascii_digit))
            .unwrap_or(colon);
        if hour_start == colon {
            continue;
        }
        let minute_end = colon + 3;
        if minute_end > bytes.len() || !bytes[colon + 1..minute_end].iter().all(u8::is_ascii_digit) {
            continue;
        }

        let mut cursor = minute_end;
        while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        let meridiem = match bytes.get(cursor..cursor + 2) {
            Some(pair) if pair.eq_ignore_ascii_case(b"am") => "AM",
            Some(pair) if pair.eq_ignore_ascii_case(b"pm") => "PM",
            _ => continue,
        };

        let hour: u32 = text[hour_start..colon].parse().ok()?;
        let minute: u32 = text[colon + 1..minute_end].parse().ok()?;
        let hour = match (meridiem, hour) {
            ("PM", h) if h != 12 => h + 12,
            ("AM", 12) => 0,
            (_, h) => h,
        };
        if hour > 23 || minute > 59 {
            continue;
        }
        return Some(DisplayedClock {
            hour,
            minute,
            matched: text[hour_start..cursor + 2].to_string(),
        });
    }
    None
}

/// Offsets beyond half a day are read as the clock being on the other side
/// of midnight.
pub fn compare(clock: &DisplayedClock, now: DateTime<Local>) -> TimeCheck {
    let system = now.num_seconds_from_midnight() as f64 / 60.0
        + now.nanosecond() as f64 / 60_000_000_000.0;
    let displayed = (clock.hour * 60 + clock.minute) as f64;

    let mut offset = displayed - system;
    if offset.abs() > MINUTES_PER_DAY / 2.0 {
        offset -= MINUTES_PER_DAY * offset.signum();
    }

    // the page shows whole minutes, so compare against the current minute
    let system_minute = system.floor();
    let mut minute_offset = displayed - system_minute;
    if minute_offset.abs() > MINUTES_PER_DAY / 2.0 {
        minute_offset -= MINUTES_PER_DAY * minute_offset.signum();
    }

    let offset_minutes = (offset * 10.0).round() / 10.0;
    if minute_offset == 0.0 {
        return TimeCheck {
            status: TimeCheckStatus::Success,
            offset_minutes: Some(offset_minutes),
            matched: Some(clock.matched.clone()),
            detail: None,
        };
    }

    TimeCheck {
        status: TimeCheckStatus::Warning,
        offset_minutes: Some(offset_minutes),
        matched: Some(clock.matched.clone()),
        detail: Some(format!(
            "displayed '{}' differs from system time {} by {:.1} minutes",
            clock.matched,
            now.format("%I:%M %p"),
            offset.abs()
        )),
    }
}
