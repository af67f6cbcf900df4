use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Seconds to sleep so the next wake-up lands on a multiple of `every_secs`.
///
/// Always in `1..=every_secs`; a clock sitting exactly on a boundary waits a
/// full period.
pub fn seconds_until_next(now_unix: i64, every_secs: u64) -> u64 {
    let every = every_secs.max(1) as i64;
    let passed = now_unix.rem_euclid(every);
    (every - passed) as u64
}

pub fn next_aligned(now: DateTime<Utc>, every_secs: u64) -> DateTime<Utc> {
    let wait = seconds_until_next(now.timestamp(), every_secs) as i64;
    Utc.timestamp_opt(now.timestamp() + wait, 0)
        .single()
        .unwrap_or(now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSchedule {
    pub every_secs: u64,
}

impl Default for ReportSchedule {
    fn default() -> Self {
        Self { every_secs: 30 * 60 }
    }
}

impl ReportSchedule {
    pub fn new(every_secs: u64) -> Self {
        Self {
            every_secs: every_secs.max(1),
        }
    }

    pub fn wait(&self, now: DateTime<Utc>) -> std::time::Duration {
        std::time::Duration::from_secs(seconds_until_next(now.timestamp(), self.every_secs))
    }

    /// Wait after a report has just gone out. A boundary closer than half a
    /// period belongs to the report that was just sent (the sleep timer woke
    /// the board early), so the one after it is used instead.
    pub fn wait_after_report(&self, now: DateTime<Utc>) -> std::time::Duration {
        let mut wait = seconds_until_next(now.timestamp(), self.every_secs);
        if wait < self.every_secs / 2 {
            wait += self.every_secs;
        }
        std::time::Duration::from_secs(wait)
    }

    pub fn next_report(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        next_aligned(now, self.every_secs)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn fixed_time(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, hour, minute, second)
            .unwrap()
    }

    #[test]
    fn waits_until_next_half_hour() {
        let schedule = ReportSchedule::default();

        let now = fixed_time(8, 10, 0);
        assert_eq!(schedule.wait(now).as_secs(), 20 * 60);
        assert_eq!(schedule.next_report(now), fixed_time(8, 30, 0));
    }

    #[test]
    fn boundary_waits_a_full_period() {
        assert_eq!(seconds_until_next(1_800, 1_800), 1_800);
        assert_eq!(seconds_until_next(1_799, 1_800), 1);
    }

    #[test]
    fn handles_pre_epoch_and_zero_interval() {
        assert_eq!(seconds_until_next(-10, 60), 10);
        assert_eq!(seconds_until_next(12_345, 0), 1);
    }

    #[test]
    fn wait_after_report_skips_the_boundary_just_served() {
        let schedule = ReportSchedule::default();

        // Woke a little late and reported at 08:30:12.
        assert_eq!(
            schedule.wait_after_report(fixed_time(8, 30, 12)).as_secs(),
            30 * 60 - 12
        );
        // Woke 40s early; 08:30 is already reported.
        assert_eq!(
            schedule.wait_after_report(fixed_time(8, 29, 20)).as_secs(),
            40 + 30 * 60
        );
    }

    #[test]
    fn next_report_crosses_midnight() {
        let schedule = ReportSchedule::new(3_600);
        let now = fixed_time(23, 59, 59);

        assert_eq!(
            schedule.next_report(now),
            Utc.with_ymd_and_hms(2026, 1, 6, 0, 0, 0).unwrap()
        );
    }
}
