//! Time-window matching for scheduled algorithm activation.
//!
//! A window may carry a daily time range, a set of weekdays, or both. Ranges whose end is earlier
//! than their start wrap past midnight; for those, the weekday check applies to the day the range
//! started on. A range whose start equals its end covers the whole day.
//!
//! When several windows match, the most specific wins: day-and-time beats time-only, which beats
//! day-only. Ties go to the narrower window, then to the configuration name.

use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike, Weekday};
use spinwallet_types::{ActivationWindow, AlgorithmConfiguration};

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Whether `window` covers `now` (local wall-clock time).
pub fn window_matches(window: &ActivationWindow, now: NaiveDateTime) -> bool {
    if !window.is_scheduled() {
        return false;
    }
    let anchor = match window.time_range() {
        Some((start, end)) => match time_anchor(start, end, now.time(), now.weekday()) {
            Some(day) => day,
            None => return false,
        },
        None => now.weekday(),
    };
    window.days_of_week.is_empty() || window.days_of_week.contains(&anchor)
}

/// Day the range containing `time` started on, or `None` if `time` is outside the range.
fn time_anchor(start: NaiveTime, end: NaiveTime, time: NaiveTime, today: Weekday) -> Option<Weekday> {
    if start == end {
        return Some(today);
    }
    if start < end {
        return (start <= time && time < end).then_some(today);
    }
    if time >= start {
        Some(today)
    } else if time < end {
        Some(today.pred())
    } else {
        None
    }
}

/// Higher is more specific.
fn specificity(window: &ActivationWindow) -> u8 {
    match (window.time_range().is_some(), !window.days_of_week.is_empty()) {
        (true, true) => 3,
        (true, false) => 2,
        (false, true) => 1,
        (false, false) => 0,
    }
}

/// Minutes per week the window is open.
fn coverage(window: &ActivationWindow) -> u32 {
    let daily = match window.time_range() {
        Some((start, end)) => {
            let start = start.num_seconds_from_midnight() / 60;
            let end = end.num_seconds_from_midnight() / 60;
            if start < end {
                end - start
            } else {
                MINUTES_PER_DAY - (start - end)
            }
        }
        None => MINUTES_PER_DAY,
    };
    let days = if window.days_of_week.is_empty() {
        7
    } else {
        window.days_of_week.len() as u32
    };
    daily * days
}

/// The configuration whose window best covers `now`, if any.
pub fn best_match(
    configurations: &[AlgorithmConfiguration],
    now: NaiveDateTime,
) -> Option<&AlgorithmConfiguration> {
    configurations
        .iter()
        .filter(|c| window_matches(&c.window, now))
        .min_by(|a, b| {
            specificity(&b.window)
                .cmp(&specificity(&a.window))
                .then_with(|| coverage(&a.window).cmp(&coverage(&b.window)))
                .then_with(|| a.name.cmp(&b.name))
        })
}
