//! Timestamp parsing, formatting, and the monotonic applied-time clock.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Timestamp format used in definition files and stored records.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current wall-clock time as unix seconds.
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Parse a `created` value from a definition file.
///
/// Accepts `YYYY-MM-DD HH:MM:SS` and `YYYY-MM-DD HH:MM`.
pub fn parse_created(value: &str) -> Option<i64> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, DATE_TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M"))
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Format unix seconds using [`DATE_TIME_FORMAT`].
pub fn format_unix(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.format(DATE_TIME_FORMAT).to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

/// Applied-time source that is strictly increasing within a run.
///
/// Two migrations finalized within the same wall-clock second still get
/// distinct, ordered timestamps.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: i64,
}

impl MonotonicClock {
    /// Create a clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next applied timestamp.
    pub fn next(&mut self) -> i64 {
        self.last = (self.last + 1).max(now_unix());
        self.last
    }
}
