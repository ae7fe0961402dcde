//! Frequency-string helpers.
//!
//! Schedules, backtracks and chunk sizes arrive from the payload as short
//! duration strings ("5min", "1h", "7d", "1us"). They are parsed once into
//! `chrono::Duration` and used as such everywhere downstream.

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::error::CoreError;

/// Parse a frequency string such as "5min" or "7d".
pub fn parse_freq(value: &str) -> Result<Duration, CoreError> {
    let invalid = || CoreError::InvalidFrequency {
        value: value.to_string(),
    };
    let parsed = humantime::parse_duration(value.trim()).map_err(|_| invalid())?;
    Duration::from_std(parsed).map_err(|_| invalid())
}

/// Floor a timestamp to a whole multiple of `step`, anchored at the epoch.
pub fn floor_to(ts: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let Some(step_us) = step.num_microseconds().filter(|us| *us > 0) else {
        return ts;
    };
    let floored = ts.timestamp_micros().div_euclid(step_us) * step_us;
    match Utc.timestamp_micros(floored) {
        chrono::LocalResult::Single(dt) => dt,
        _ => ts,
    }
}
