//! Fixed time windows used for quota accounting.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Time window for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// All windows, narrowest first.
    pub const ALL: [TimeWindow; 4] = [
        TimeWindow::Second,
        TimeWindow::Minute,
        TimeWindow::Hour,
        TimeWindow::Day,
    ];

    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds() as u64)
    }

    /// Length of the window in whole seconds.
    pub fn seconds(&self) -> i64 {
        match self {
            TimeWindow::Second => 1,
            TimeWindow::Minute => 60,
            TimeWindow::Hour => 3600,
            TimeWindow::Day => 86400,
        }
    }

    /// Start of the window containing `now`, in epoch seconds.
    ///
    /// Buckets are aligned to the epoch so every replica computes the same
    /// boundary for the same instant.
    pub fn bucket(&self, now: DateTime<Utc>) -> i64 {
        let secs = self.seconds();
        now.timestamp().div_euclid(secs) * secs
    }

    /// Time remaining until the window containing `now` closes.
    pub fn reset_after(&self, now: DateTime<Utc>) -> Duration {
        let end_ms = (self.bucket(now) + self.seconds()) * 1000;
        let remaining = end_ms - now.timestamp_millis();
        Duration::from_millis(remaining.max(0) as u64)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Second => "second",
            TimeWindow::Minute => "minute",
            TimeWindow::Hour => "hour",
            TimeWindow::Day => "day",
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_window_duration() {
        assert_eq!(TimeWindow::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeWindow::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeWindow::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeWindow::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_bucket_is_floored_to_window() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 45).unwrap();
        let hour_start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let minute_start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();

        assert_eq!(TimeWindow::Hour.bucket(now), hour_start.timestamp());
        assert_eq!(TimeWindow::Minute.bucket(now), minute_start.timestamp());
        assert_eq!(TimeWindow::Second.bucket(now), now.timestamp());
    }

    #[test]
    fn test_reset_after() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 45).unwrap();
        assert_eq!(TimeWindow::Minute.reset_after(now), Duration::from_secs(15));
        assert_eq!(TimeWindow::Hour.reset_after(now), Duration::from_secs(29 * 60 + 15));
    }

    #[test]
    fn test_windows_are_ordered_narrowest_first() {
        let mut sorted = TimeWindow::ALL;
        sorted.sort();
        assert_eq!(sorted, TimeWindow::ALL);
    }
}
