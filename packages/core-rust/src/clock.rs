//! Wall-clock access for envelope timestamps and day-stamped log files.

use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over the system clock for dependency injection.
///
/// Tests swap in a fixed or stepping clock to make timestamps deterministic.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now(&self) -> u64;
}

/// Clock source that reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Current Unix time in milliseconds from the system clock.
#[must_use]
pub fn now_millis() -> u64 {
    SystemClock.now()
}

/// Converts Unix milliseconds to a UTC civil date `(year, month, day)`.
///
/// Days-from-civil inversion over the proleptic Gregorian calendar, valid for
/// every `u64` millisecond value.
#[must_use]
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub fn civil_date(millis: u64) -> (i64, u32, u32) {
    let days = (millis / 86_400_000) as i64;
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// `YYYYMMDD` stamp for the UTC day containing `millis`.
#[must_use]
pub fn day_stamp(millis: u64) -> String {
    let (year, month, day) = civil_date(millis);
    format!("{year:04}{month:02}{day:02}")
}
