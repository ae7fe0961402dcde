//! Multi-schedule evaluation.
//!
//! For every candidate schedule the evaluator works out the next execution
//! date from the job log, applies rounding, decides whether the schedule is
//! due and derives the data-extraction start date (fixed backtrack window or
//! checkpoint resumption). With progressive scheduling, the longest due
//! schedule absorbs the work of the shorter ones: it alone executes and
//! marks every originally due schedule complete.

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use tracing::debug;

use super::schedule::{adjust_to_schedule, Backtrack, Schedule};
use crate::store::job_log::JobLog;
use crate::util::freq::parse_freq;

/// Evaluation result for one schedule at one tick.
#[derive(Debug, Clone)]
pub struct ScheduleStatus {
    pub schedule: Schedule,
    pub next_date: DateTime<Utc>,
    pub is_due: bool,
    pub is_subsumed: bool,
    pub is_checkpoint_driven: bool,
    pub start_date: Option<DateTime<Utc>>,
    pub prev_checkpoint: Option<DateTime<Utc>>,
    pub backtrack: Option<Duration>,
    /// Schedules to record as complete when this one finishes.
    pub mark_complete: Vec<String>,
    pub rounding_note: Option<String>,
}

pub(crate) struct ScheduleEvaluator<'a> {
    job_log: &'a JobLog,
    schedules: &'a [Schedule],
    progressive: bool,
}

impl<'a> ScheduleEvaluator<'a> {
    pub(crate) fn new(job_log: &'a JobLog, schedules: &'a [Schedule], progressive: bool) -> Self {
        Self {
            job_log,
            schedules,
            progressive,
        }
    }

    pub(crate) async fn evaluate(
        &self,
        execute_date: DateTime<Utc>,
    ) -> anyhow::Result<IndexMap<String, ScheduleStatus>> {
        let mut statuses: IndexMap<String, ScheduleStatus> = IndexMap::new();
        let mut last_due: Option<String> = None;
        let mut all_due: Vec<String> = Vec::new();

        for schedule in self.schedules {
            let interval = schedule.interval()?;
            let last_execution = self.job_log.last_execution(&schedule.freq).await?;
            let mut next_date =
                last_execution.map_or(execute_date, |last| last + interval);
            debug!(
                schedule = %schedule.freq,
                ?last_execution,
                %next_date,
                %execute_date,
                "evaluated next execution date"
            );

            let mut rounding_note = None;
            let rounded = adjust_to_schedule(
                next_date,
                schedule.round_hour,
                schedule.round_min,
                interval,
            );
            if rounded != next_date {
                rounding_note = Some(format!(
                    "start date revised to {rounded} from {next_date} due to rounding"
                ));
                next_date = rounded;
            }

            let mut status = ScheduleStatus {
                schedule: schedule.clone(),
                next_date,
                is_due: false,
                is_subsumed: false,
                is_checkpoint_driven: false,
                start_date: None,
                prev_checkpoint: None,
                backtrack: None,
                mark_complete: Vec::new(),
                rounding_note,
            };

            if next_date <= execute_date {
                status.is_due = true;
                match &schedule.backtrack {
                    Backtrack::Checkpoint => {
                        status.is_checkpoint_driven = true;
                        status.prev_checkpoint = last_execution;
                        status.start_date =
                            last_execution.map(|ts| ts + Duration::microseconds(1));
                    }
                    Backtrack::Window(window) => {
                        let back = parse_freq(window)?;
                        status.backtrack = Some(back);
                        status.start_date = Some(execute_date - back);
                    }
                    Backtrack::None => {}
                }
                status.mark_complete = vec![schedule.freq.clone()];
                last_due = Some(schedule.freq.clone());
                all_due.push(schedule.freq.clone());
            }
            statuses.insert(schedule.freq.clone(), status);
        }

        // The schedules are ordered by frequency, so the last due one is the
        // longest-period schedule: it does the work of all shorter schedules
        // and they are subsumed for this tick.
        if self.progressive {
            if let Some(last_due) = last_due {
                for (freq, status) in &mut statuses {
                    if *freq == last_due {
                        status.mark_complete = all_due.clone();
                        debug!(
                            schedule = %freq,
                            mark_complete = ?status.mark_complete,
                            "schedule will execute and mark the subsumed schedules complete"
                        );
                    } else if status.is_due {
                        status.is_due = false;
                        status.is_subsumed = true;
                    }
                }
            }
        }

        Ok(statuses)
    }
}
