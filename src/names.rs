//! Canonical bucket names.
//!
//! A bucket is named `<prefix>_<YYYY>_<MM>_<DD>_<HH>_<Min>_<suffix>` with
//! the fields finer than the bucket's cadence written as zeros. Fields are
//! zero-padded so that, for a fixed prefix and cadence, names sort
//! lexicographically in time order.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

use crate::timebase::Interval;

/// Canonical name of the bucket that owns instant `t` under `interval`.
pub fn bucket_name(interval: Interval, prefix: &str, t: DateTime<Utc>) -> String {
    let f = interval.floor(t);
    let (y, mo, d, h, mi) = match interval {
        Interval::EveryMinute => (f.year(), f.month(), f.day(), f.hour(), f.minute()),
        Interval::EveryHour => (f.year(), f.month(), f.day(), f.hour(), 0),
        Interval::EveryDay => (f.year(), f.month(), f.day(), 0, 0),
        Interval::EveryMonth => (f.year(), f.month(), 0, 0, 0),
        Interval::EveryYear => (f.year(), 0, 0, 0, 0),
    };
    format!(
        "{}_{:04}_{:02}_{:02}_{:02}_{:02}_{}",
        prefix,
        y,
        mo,
        d,
        h,
        mi,
        interval.suffix()
    )
}

/// Recover the embedded bucket time from a canonical name. Zeroed month and
/// day fields map back to 1 so every name parses to a real instant.
///
/// Returns `None` for names that do not carry the date tuple, which lets
/// callers filter foreign entries out of storage listings.
pub fn parse_bucket_time(name: &str) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = name.split('_').collect();
    // prefix + five date fields + suffix
    if parts.len() < 7 {
        return None;
    }
    let suffix = *parts.last()?;
    if !matches!(suffix, "min" | "h" | "d" | "m" | "y") {
        return None;
    }
    let fields = &parts[parts.len() - 6..parts.len() - 1];
    let mut nums = [0u32; 5];
    for (i, f) in fields.iter().enumerate() {
        nums[i] = f.parse().ok()?;
    }
    let year = nums[0] as i32;
    let month = nums[1].max(1);
    let day = nums[2].max(1);
    Utc.with_ymd_and_hms(year, month, day, nums[3], nums[4], 0).single()
}
