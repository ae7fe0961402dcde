//! Schedule model and rounding arithmetic.
//!
//! A schedule is `(frequency, optional rounding anchor, backtrack)`.
//! Schedules are totally ordered by frequency duration; the shortest one is
//! the default every unscheduled stage runs on.

use chrono::{DateTime, Duration, Utc};

use crate::error::CoreError;
use crate::util::freq::parse_freq;

pub const DEFAULT_SCHEDULE_FREQ: &str = "5min";

/// How far back data extraction reaches relative to execution time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Backtrack {
    /// No backtrack: the schedule runs with no explicit start date.
    #[default]
    None,
    /// Resume from the last completion recorded in the job log.
    Checkpoint,
    /// Fixed look-back window, as a frequency string ("1d").
    Window(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub freq: String,
    pub round_hour: Option<u32>,
    pub round_min: Option<u32>,
    pub backtrack: Backtrack,
}

impl Schedule {
    pub fn new(freq: impl Into<String>) -> Self {
        Self {
            freq: freq.into(),
            round_hour: None,
            round_min: None,
            backtrack: Backtrack::None,
        }
    }

    #[must_use]
    pub fn with_rounding(mut self, hour: Option<u32>, minute: Option<u32>) -> Self {
        self.round_hour = hour;
        self.round_min = minute;
        self
    }

    #[must_use]
    pub fn with_backtrack(mut self, backtrack: Backtrack) -> Self {
        self.backtrack = backtrack;
        self
    }

    pub fn interval(&self) -> Result<Duration, CoreError> {
        parse_freq(&self.freq)
    }
}

/// Sort schedules by frequency duration ascending, injecting the default
/// frequency when the payload does not declare it. The first entry becomes
/// the default schedule.
pub(crate) fn order_schedules(mut schedules: Vec<Schedule>) -> Result<Vec<Schedule>, CoreError> {
    if !schedules
        .iter()
        .any(|s| s.freq == DEFAULT_SCHEDULE_FREQ)
    {
        schedules.push(Schedule::new(DEFAULT_SCHEDULE_FREQ));
    }
    let mut keyed: Vec<(Duration, Schedule)> = schedules
        .into_iter()
        .map(|s| Ok((s.interval()?, s)))
        .collect::<Result<_, CoreError>>()?;
    keyed.sort_by_key(|(duration, _)| *duration);
    Ok(keyed.into_iter().map(|(_, s)| s).collect())
}

/// Align an execution date onto a schedule's rounding grid: anchor at the
/// date's own `round_hour:round_min`, step back a day if the anchor lies
/// ahead, then floor onto whole intervals from the anchor. Without rounding
/// the date passes through unchanged. The adjusted date never moves forward.
pub fn adjust_to_schedule(
    execute_date: DateTime<Utc>,
    round_hour: Option<u32>,
    round_min: Option<u32>,
    interval: Duration,
) -> DateTime<Utc> {
    if round_hour.is_none() && round_min.is_none() {
        return execute_date;
    }
    let hours = i64::from(round_hour.unwrap_or(0));
    let minutes = i64::from(round_min.unwrap_or(0));
    let mut anchor = execute_date
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map_or(execute_date, |midnight| midnight.and_utc())
        + Duration::hours(hours)
        + Duration::minutes(minutes);
    if anchor > execute_date {
        anchor -= Duration::days(1);
    }
    let Some(step) = interval.num_microseconds().filter(|us| *us > 0) else {
        return anchor;
    };
    let elapsed = (execute_date - anchor).num_microseconds().unwrap_or(0);
    anchor + Duration::microseconds(elapsed.div_euclid(step) * step)
}
