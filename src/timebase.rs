//! Wall-clock grid shared by the rotators, the snapshot poller and the
//! control-plane watcher.
//!
//! Everything here is calendar-aware UTC: bucket cadences are expressed as
//! named intervals rather than fixed durations so that month and year
//! boundaries land where the calendar says they do.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Months, SecondsFormat, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Bucket cadence. Also drives the control-plane tick and the canonical
/// bucket-name granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    EveryMinute,
    EveryHour,
    EveryDay,
    EveryMonth,
    EveryYear,
}

impl Interval {
    /// Name suffix carried by buckets of this cadence.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::EveryMinute => "min",
            Self::EveryHour => "h",
            Self::EveryDay => "d",
            Self::EveryMonth => "m",
            Self::EveryYear => "y",
        }
    }

    /// Truncate `t` to this interval's grid. Month and year floor to the
    /// first day / first of January.
    pub fn floor(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let y = t.year();
        let (mo, d, h, mi) = match self {
            Self::EveryMinute => (t.month(), t.day(), t.hour(), t.minute()),
            Self::EveryHour => (t.month(), t.day(), t.hour(), 0),
            Self::EveryDay => (t.month(), t.day(), 0, 0),
            Self::EveryMonth => (t.month(), 1, 0, 0),
            Self::EveryYear => (1, 1, 0, 0),
        };
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .expect("floored timestamp is always a valid date")
    }

    /// One step forward on the grid. Calendar-aware for month and year.
    pub fn advance(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::EveryMinute => t + ChronoDuration::minutes(1),
            Self::EveryHour => t + ChronoDuration::hours(1),
            Self::EveryDay => t + ChronoDuration::days(1),
            Self::EveryMonth => t
                .checked_add_months(Months::new(1))
                .expect("month arithmetic in range"),
            Self::EveryYear => t
                .checked_add_months(Months::new(12))
                .expect("year arithmetic in range"),
        }
    }

    /// Next grid instant strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.advance(self.floor(t))
    }
}

/// Block the current thread until `deadline`. No-op when the deadline has
/// already passed.
pub fn sleep_until(deadline: DateTime<Utc>) {
    let now = Utc::now();
    if deadline > now {
        if let Ok(wait) = (deadline - now).to_std() {
            std::thread::sleep(wait);
        }
    }
}

/// Canonical UTC timestamp string used to decorate records.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse the exchange's ISO-8601 timestamps. Accepts both offset-carrying
/// RFC 3339 (`...Z`) and bare naive UTC strings.
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|n| Utc.from_utc_datetime(&n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_floor_truncates_finer_fields() {
        let t = at(2024, 3, 17, 12, 42, 31);
        assert_eq!(Interval::EveryMinute.floor(t), at(2024, 3, 17, 12, 42, 0));
        assert_eq!(Interval::EveryHour.floor(t), at(2024, 3, 17, 12, 0, 0));
        assert_eq!(Interval::EveryDay.floor(t), at(2024, 3, 17, 0, 0, 0));
        assert_eq!(Interval::EveryMonth.floor(t), at(2024, 3, 1, 0, 0, 0));
        assert_eq!(Interval::EveryYear.floor(t), at(2024, 1, 1, 0, 0, 0));
    }

    #[test]
    fn test_advance_is_calendar_aware() {
        assert_eq!(
            Interval::EveryMonth.advance(at(2024, 1, 31, 0, 0, 0)),
            at(2024, 2, 29, 0, 0, 0)
        );
        assert_eq!(
            Interval::EveryYear.advance(at(2024, 2, 29, 0, 0, 0)),
            at(2025, 2, 28, 0, 0, 0)
        );
        assert_eq!(
            Interval::EveryMinute.advance(at(2024, 12, 31, 23, 59, 0)),
            at(2025, 1, 1, 0, 0, 0)
        );
    }

    #[test]
    fn test_next_after_lands_on_grid() {
        let t = at(2024, 3, 17, 12, 42, 31);
        assert_eq!(Interval::EveryMinute.next_after(t), at(2024, 3, 17, 12, 43, 0));
        assert_eq!(Interval::EveryHour.next_after(t), at(2024, 3, 17, 13, 0, 0));
    }

    #[test]
    fn test_parse_iso_accepts_both_forms() {
        let zulu = parse_iso("2024-01-01T12:00:30.500Z").unwrap();
        assert_eq!(zulu, at(2024, 1, 1, 12, 0, 30) + ChronoDuration::milliseconds(500));
        let naive = parse_iso("2024-01-01T12:00:30.500").unwrap();
        assert_eq!(naive, zulu);
        assert!(parse_iso("not a time").is_none());
    }

    #[test]
    fn test_interval_serde_names() {
        let i: Interval = serde_json::from_str("\"every_minute\"").unwrap();
        assert_eq!(i, Interval::EveryMinute);
        assert_eq!(serde_json::to_string(&Interval::EveryYear).unwrap(), "\"every_year\"");
    }

    #[test]
    fn test_sleep_until_past_deadline_returns_immediately() {
        let before = std::time::Instant::now();
        sleep_until(Utc::now() - ChronoDuration::seconds(5));
        assert!(before.elapsed() < std::time::Duration::from_millis(100));
    }
}
