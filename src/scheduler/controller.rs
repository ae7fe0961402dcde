//! The top-level job controller.
//!
//! One controller drives one payload: evaluate the candidate schedules, run
//! the due ones (preload, job-spec build, chunked execution, job-log append)
//! and sleep until the next pending execution inside the keep-alive horizon.
//! Failures are contained by scope: a failed chunk skips that chunk, a fatal
//! schedule error aborts that schedule only, and a schedule is recorded
//! complete only when every chunk finished cleanly.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::chunk::build_chunks;
use super::evaluate::{ScheduleEvaluator, ScheduleStatus};
use super::schedule::{order_schedules, Schedule, DEFAULT_SCHEDULE_FREQ};
use crate::config::Settings;
use crate::error::CoreError;
use crate::frame::Value;
use crate::payload::Payload;
use crate::pipeline::executor::StageRunner;
use crate::pipeline::spec::{JobSpec, JobSpecBuilder, SpecStage, INPUT_LEVEL_PHASE};
use crate::stage::StageType;
use crate::store::job_log::JobLog;
use crate::util::freq::parse_freq;
use crate::util::time;

pub struct JobController {
    payload: Arc<dyn Payload>,
    settings: Settings,
    schedules: Vec<Schedule>,
    default_schedule: Schedule,
    job_log: JobLog,
}

impl std::fmt::Debug for JobController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobController")
            .field("settings", &self.settings)
            .field("schedules", &self.schedules)
            .field("default_schedule", &self.default_schedule)
            .finish()
    }
}

impl JobController {
    /// Bind a controller to a payload. Fails when the payload carries no
    /// stage metadata or the job log cannot be provided.
    pub async fn new(payload: Arc<dyn Payload>, settings: Settings) -> Result<Self, CoreError> {
        if payload.stages().is_empty() {
            return Err(CoreError::PayloadMetadataMissing);
        }
        let schedules = order_schedules(payload.schedules())?;
        let default_schedule = schedules[0].clone();
        if default_schedule.freq != DEFAULT_SCHEDULE_FREQ {
            debug!(
                default = %default_schedule.freq,
                "changed default schedule: a higher frequency schedule is present in the payload"
            );
        }
        let job_log = JobLog::ensure(
            payload.store(),
            settings.job_log_table().to_string(),
            payload.object_type().to_string(),
            payload.name().to_string(),
        )
        .await?;
        Ok(Self {
            payload,
            settings,
            schedules,
            default_schedule,
            job_log,
        })
    }

    /// Process ticks until the keep-alive horizon passes or nothing is left
    /// to execute before it.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut execute_date = time::now();
        let execute_until = self
            .settings
            .keep_alive()
            .map_or(execute_date, |keep| execute_date + keep);
        if execute_until > execute_date {
            debug!(%execute_until, "job will keep executing until the keep-alive horizon");
        }
        let run_id = Uuid::new_v4();
        let mut execution_counter: u64 = 0;

        while execute_date <= execute_until {
            debug!(
                %run_id,
                execution = execution_counter,
                %execute_date,
                "starting execution"
            );
            let evaluator = ScheduleEvaluator::new(
                &self.job_log,
                &self.schedules,
                self.payload.is_schedule_progressive(),
            );
            let statuses = evaluator.evaluate(execute_date).await?;

            let mut future_executions: Vec<DateTime<Utc>> = Vec::new();
            let mut executed = false;
            for (freq, status) in &statuses {
                if !status.is_due {
                    self.log_non_execution(freq, status);
                    if !status.is_subsumed && status.next_date <= execute_until {
                        future_executions.push(status.next_date);
                    }
                    continue;
                }
                self.log_tagged_for_execution(freq, status, execute_date);
                match self
                    .execute_schedule(status, execute_date, execute_until)
                    .await
                {
                    Ok(ran) => executed |= ran,
                    Err(err) => {
                        error!(
                            schedule = %freq,
                            error = %format!("{err:#}"),
                            "schedule execution failed"
                        );
                        executed = true;
                    }
                }
            }

            if !executed {
                let Some(next) = future_executions.iter().min().copied() else {
                    debug!("nothing left to process before the execution end time");
                    break;
                };
                if let Ok(wait) = (next - time::now()).to_std() {
                    debug!(
                        wait_seconds = wait.as_secs(),
                        "waiting until the next scheduled execution"
                    );
                    sleep(wait).await;
                }
            }
            execution_counter += 1;
            execute_date = time::now();
        }
        Ok(())
    }

    /// Run one due schedule: preload, spec build, chunked execution and
    /// completion bookkeeping. Returns whether any work was attempted.
    async fn execute_schedule(
        &self,
        status: &ScheduleStatus,
        execute_date: DateTime<Utc>,
        execute_until: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let entities = self.payload.entity_filter();
        let runner = StageRunner::new(entities.as_deref());

        // Preload stages run once per schedule, never backtracked; their
        // outputs become constants carried into every chunk.
        let mut constants: IndexMap<String, Value> = IndexMap::new();
        let (preload, preload_columns) = self.payload.stages().selectable(
            StageType::Preload,
            None,
            Some(&HashSet::new()),
            &[],
        );
        if !preload.is_empty() {
            debug!("executing preload stages");
            let preload_spec: Vec<SpecStage> = preload
                .into_iter()
                .map(|stage| SpecStage::new(stage, &status.schedule.freq))
                .collect();
            let (_, proceed) = runner
                .run_phase(
                    &preload_spec,
                    None,
                    status.prev_checkpoint,
                    Some(execute_date),
                    None,
                )
                .await?;
            if !proceed {
                info!(
                    schedule = %status.schedule.freq,
                    "preload halted; skipping this schedule"
                );
                return Ok(false);
            }
            for column in preload_columns {
                constants.insert(column, Value::Bool(true));
            }
            debug!("preload stages complete");
        }

        let builder = JobSpecBuilder::new(
            self.payload.as_ref(),
            &self.default_schedule.freq,
            self.settings.max_resolver_passes(),
            self.settings.write_batch_rows(),
        );
        let spec = builder.build(&status.schedule.freq, &status.mark_complete)?;

        let chunk_size = match self.payload.chunk_size() {
            Some(raw) => parse_freq(&raw)?,
            None => self.settings.chunk_size(),
        };
        let start = self.payload.start_ts_override().or(status.start_date);
        let end = self.payload.end_ts_override().unwrap_or(execute_date);
        let chunks = build_chunks(
            self.payload.as_ref(),
            start,
            end,
            status.schedule.round_hour,
            status.schedule.round_min,
            status.schedule.interval()?,
            chunk_size,
        )
        .await;

        let mut chunk_failed = false;
        let mut deadline_reached = false;
        for (index, (chunk_start, chunk_end)) in chunks.iter().enumerate() {
            // The keep-alive horizon is a soft deadline: the chunk in flight
            // completes, no further chunk starts.
            if index > 0 && time::now() > execute_until {
                warn!(
                    schedule = %status.schedule.freq,
                    remaining = chunks.len() - index,
                    "keep-alive horizon reached; not starting further chunks"
                );
                deadline_reached = true;
                break;
            }
            if let Err(err) = self
                .execute_chunk(&runner, &spec, *chunk_start, *chunk_end, &constants)
                .await
            {
                error!(
                    schedule = %status.schedule.freq,
                    chunk = index,
                    error = %format!("{err:#}"),
                    "chunk execution failed; continuing with the next chunk"
                );
                chunk_failed = true;
            }
        }

        if chunk_failed || deadline_reached {
            warn!(
                schedule = %status.schedule.freq,
                "schedule is not marked complete: not all chunks finished cleanly"
            );
            return Ok(true);
        }
        for schedule in &status.mark_complete {
            self.job_log
                .record_completion(schedule, execute_date, None)
                .await?;
        }
        Ok(true)
    }

    /// Run the input-level phase and then each granularity phase over its
    /// result. A halt stops the remaining phases of this chunk only.
    async fn execute_chunk(
        &self,
        runner: &StageRunner<'_>,
        spec: &JobSpec,
        chunk_start: Option<DateTime<Utc>>,
        chunk_end: DateTime<Utc>,
        constants: &IndexMap<String, Value>,
    ) -> anyhow::Result<()> {
        let (frame, proceed) = runner
            .run_phase(
                spec.phase(INPUT_LEVEL_PHASE),
                None,
                chunk_start,
                Some(chunk_end),
                Some(constants.clone()),
            )
            .await?;
        if !proceed {
            return Ok(());
        }
        for (phase, stages) in &spec.phases {
            if phase == INPUT_LEVEL_PHASE {
                continue;
            }
            let (_, proceed) = runner
                .run_phase(
                    stages,
                    Some(frame.clone()),
                    chunk_start,
                    Some(chunk_end),
                    None,
                )
                .await?;
            if !proceed {
                debug!(
                    phase = %phase,
                    "granularity phase halted; stopping the remaining phases for this chunk"
                );
                break;
            }
        }
        Ok(())
    }

    fn log_non_execution(&self, freq: &str, status: &ScheduleStatus) {
        if status.is_subsumed {
            debug!(
                schedule = %freq,
                note = status.rounding_note.as_deref().unwrap_or(""),
                "schedule skipped: subsumed by a longer progressive schedule"
            );
        } else {
            debug!(
                schedule = %freq,
                next_date = %status.next_date,
                "schedule is not due yet"
            );
        }
    }

    fn log_tagged_for_execution(
        &self,
        freq: &str,
        status: &ScheduleStatus,
        execute_date: DateTime<Utc>,
    ) {
        info!(
            job = %self.payload.name(),
            schedule = %freq,
            %execute_date,
            backtrack = ?status.backtrack,
            prev_checkpoint = ?status.prev_checkpoint,
            note = status.rounding_note.as_deref().unwrap_or(""),
            "starting job for schedule"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, FrameIndex};
    use crate::payload::{DataItemMetadata, Granularity};
    use crate::scheduler::schedule::Backtrack;
    use crate::stage::{Reduction, StageOutput};
    use crate::testkit::{ScriptStage, TestPayload};
    use chrono::{Duration, TimeZone};

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, h, m, 0).unwrap()
    }

    fn number_item(table: &str) -> DataItemMetadata {
        DataItemMetadata {
            column_type: Some("NUMBER".into()),
            transient: false,
            source_table: Some(table.to_string()),
        }
    }

    fn temp_source() -> Arc<ScriptStage> {
        ScriptStage::new("temp_source", &[], &["temp"])
            .as_data_source()
            .with_behavior(|_| {
                let index = FrameIndex::new(
                    vec!["id".into(), "timestamp".into()],
                    vec![
                        vec![Value::text("a"), Value::Timestamp(ts(10, 5))],
                        vec![Value::text("a"), Value::Timestamp(ts(10, 20))],
                    ],
                );
                Ok(StageOutput::Frame(Frame::from_columns(
                    index,
                    vec![(
                        "temp".to_string(),
                        vec![Value::number(1.0), Value::number(3.0)],
                    )],
                )))
            })
            .arc()
    }

    async fn controller(payload: TestPayload) -> (Arc<TestPayload>, JobController) {
        let payload = Arc::new(payload);
        let controller = JobController::new(
            Arc::clone(&payload) as Arc<dyn Payload>,
            Settings::default(),
        )
        .await
        .unwrap();
        (payload, controller)
    }

    #[tokio::test]
    async fn construction_requires_stage_metadata() {
        let payload = Arc::new(TestPayload::new("pump"));
        let err = JobController::new(payload as Arc<dyn Payload>, Settings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PayloadMetadataMissing));
    }

    #[tokio::test]
    async fn a_tick_runs_stages_writes_values_and_logs_completion() {
        let mut payload = TestPayload::new("pump");
        let source = temp_source();
        payload
            .catalog
            .add(StageType::GetData, None, Arc::clone(&source) as Arc<dyn crate::stage::Stage>);
        let grain = Granularity {
            name: "hourly".into(),
            grouper: vec!["id".into(), "timestamp".into()],
            entity_id: Some("id".into()),
            freq: Some("1h".into()),
            dimensions: None,
        };
        payload.catalog.add(
            StageType::SimpleAggregate,
            Some(&grain),
            ScriptStage::new("temp_mean", &["temp"], &["temp_mean"])
                .with_agg_function(Reduction::Mean)
                .arc(),
        );
        payload.items.insert("temp".into(), number_item("tableT"));
        payload
            .items
            .insert("temp_mean".into(), number_item("tableM"));
        payload.grains.insert("temp_mean".into(), grain);
        let store = Arc::clone(&payload.store);

        let (_, controller) = controller(payload).await;
        controller.run().await.unwrap();

        // Input-level values land in tableT, aggregated values in tableM.
        assert_eq!(store.rows("tableT").len(), 2);
        let aggregated = store.rows("tableM");
        assert_eq!(aggregated.len(), 1);
        assert_eq!(aggregated[0].key, "temp_mean");
        assert_eq!(aggregated[0].value_n, Some(2.0));
        assert_eq!(
            aggregated[0].dimensions,
            vec![Value::text("a"), Value::Timestamp(ts(10, 0))]
        );

        let completions = store.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].schedule, "5min");
        assert_eq!(completions[0].object_name, "pump");

        assert_eq!(source.call_count(), 1);
    }

    // The longest due schedule executes once and records completion for
    // every originally due schedule.
    #[tokio::test]
    async fn progressive_tick_marks_all_due_schedules_complete() {
        let mut payload = TestPayload::new("pump");
        let source = temp_source();
        payload
            .catalog
            .add(StageType::GetData, None, Arc::clone(&source) as Arc<dyn crate::stage::Stage>);
        payload.items.insert("temp".into(), number_item("tableT"));
        payload.schedules = vec![
            Schedule::new("5min"),
            Schedule::new("1h").with_backtrack(Backtrack::Window("1d".into())),
        ];
        let store = Arc::clone(&payload.store);
        store.seed_execution("5min", time::now() - Duration::minutes(10));
        store.seed_execution("1h", time::now() - Duration::minutes(65));

        let (_, controller) = controller(payload).await;
        controller.run().await.unwrap();

        let mut recorded: Vec<String> = store
            .completions()
            .iter()
            .map(|r| r.schedule.clone())
            .collect();
        recorded.sort();
        assert_eq!(recorded, vec!["1h", "5min"]);
        // One execution, one chunk: the source ran exactly once.
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn preload_halt_skips_the_schedule_entirely() {
        let mut payload = TestPayload::new("pump");
        let source = temp_source();
        payload
            .catalog
            .add(StageType::GetData, None, Arc::clone(&source) as Arc<dyn crate::stage::Stage>);
        payload.catalog.add(
            StageType::Preload,
            None,
            ScriptStage::new("warmup", &[], &["warmed"])
                .with_behavior(|_| Ok(StageOutput::Ack(false)))
                .arc(),
        );
        let store = Arc::clone(&payload.store);

        let (_, controller) = controller(payload).await;
        controller.run().await.unwrap();

        assert!(store.completions().is_empty());
        assert_eq!(source.call_count(), 0);
    }

    #[tokio::test]
    async fn preload_outputs_become_constants() {
        let mut payload = TestPayload::new("pump");
        let source = temp_source();
        payload
            .catalog
            .add(StageType::GetData, None, Arc::clone(&source) as Arc<dyn crate::stage::Stage>);
        payload.catalog.add(
            StageType::Preload,
            None,
            ScriptStage::new("warmup", &[], &["warmed"])
                .with_behavior(|_| Ok(StageOutput::Ack(true)))
                .arc(),
        );
        payload.items.insert("temp".into(), number_item("tableT"));
        payload.items.insert(
            "warmed".into(),
            DataItemMetadata {
                column_type: Some("BOOLEAN".into()),
                transient: false,
                source_table: Some("tableT".into()),
            },
        );
        let store = Arc::clone(&payload.store);

        let (_, controller) = controller(payload).await;
        controller.run().await.unwrap();

        // The preload constant is applied to every row and persisted as a
        // boolean value.
        let warmed: Vec<_> = store
            .rows("tableT")
            .into_iter()
            .filter(|r| r.key == "warmed")
            .collect();
        assert_eq!(warmed.len(), 2);
        assert!(warmed.iter().all(|r| r.value_b == Some(1)));
    }

    #[tokio::test]
    async fn a_failed_write_leaves_the_schedule_incomplete() {
        let mut payload = TestPayload::new("pump");
        payload
            .catalog
            .add(StageType::GetData, None, temp_source() as Arc<dyn crate::stage::Stage>);
        payload.items.insert("temp".into(), number_item("tableT"));
        let store = Arc::clone(&payload.store);
        store.fail_inserts_for("tableT");

        let (_, controller) = controller(payload).await;
        controller.run().await.unwrap();

        assert!(store.completions().is_empty());
    }

    #[tokio::test]
    async fn a_soft_halt_still_completes_the_schedule() {
        let mut payload = TestPayload::new("pump");
        payload.catalog.add(
            StageType::GetData,
            None,
            ScriptStage::new("empty_source", &[], &["temp"])
                .with_behavior(|_| Ok(StageOutput::Ack(true)))
                .arc(),
        );
        payload.catalog.add(
            StageType::Transform,
            None,
            ScriptStage::new("needs_rows", &["temp"], &["derived"])
                .rejecting_empty()
                .arc(),
        );
        payload.items.insert("temp".into(), number_item("tableT"));
        let store = Arc::clone(&payload.store);

        let (_, controller) = controller(payload).await;
        controller.run().await.unwrap();

        // The chunk halted before the writer ran, but a halt is soft: the
        // schedule is still recorded complete.
        assert!(store.deletes().is_empty());
        assert_eq!(store.completions().len(), 1);
    }

    #[tokio::test]
    async fn nothing_due_and_no_future_work_ends_the_tick_loop() {
        let mut payload = TestPayload::new("pump");
        payload
            .catalog
            .add(StageType::GetData, None, temp_source() as Arc<dyn crate::stage::Stage>);
        let store = Arc::clone(&payload.store);
        store.seed_execution("5min", time::now());

        let (_, controller) = controller(payload).await;
        controller.run().await.unwrap();
        assert!(store.completions().is_empty());
    }
}
