//! Wall-clock abstraction.
//!
//! Every window computation in the crate is plain arithmetic on epoch
//! milliseconds. The runner is stateless between cycles, so there is no
//! monotonic-clock dependency; the trait exists so tests and simulations
//! can pin time.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Milliseconds in one hour.
pub const HOUR_MS: i64 = 60 * 60 * 1000;
/// Milliseconds in one day.
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Source of the current wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Settable clock for tests and dry runs.
#[derive(Debug)]
pub struct FixedClock(AtomicI64);

impl FixedClock {
    pub fn at(ms: i64) -> Self {
        FixedClock(AtomicI64::new(ms))
    }

    pub fn set(&self, ms: i64) {
        self.0.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Whole days expressed in milliseconds.
pub fn days_ms(days: i64) -> i64 {
    days * DAY_MS
}

/// Whole hours expressed in milliseconds.
pub fn hours_ms(hours: i64) -> i64 {
    hours * HOUR_MS
}

/// Elapsed whole days between two epoch-ms instants, floored.
pub fn elapsed_days(from_ms: i64, now_ms: i64) -> i64 {
    (now_ms - from_ms).div_euclid(DAY_MS)
}

/// Render an epoch-ms instant as UTC for logs and CLI output.
pub fn format_ms(ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => format!("{ms}ms"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::at(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(DAY_MS);
        assert_eq!(clock.now_ms(), 1_000 + DAY_MS);
        clock.set(0);
        assert_eq!(clock.now_ms(), 0);
    }

    #[test]
    fn elapsed_days_floors() {
        let start = 1_700_000_000_000;
        assert_eq!(elapsed_days(start, start), 0);
        assert_eq!(elapsed_days(start, start + DAY_MS - 1), 0);
        assert_eq!(elapsed_days(start, start + DAY_MS), 1);
        assert_eq!(elapsed_days(start, start + 4 * DAY_MS + HOUR_MS), 4);
    }

    #[test]
    fn format_ms_renders_utc() {
        assert_eq!(format_ms(0), "1970-01-01 00:00:00 UTC");
    }
}
