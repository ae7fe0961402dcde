//! Dependency-driven job-spec builder.
//!
//! The payload is a master template of possible stages; each execution builds
//! a fresh spec containing only the stages the current schedule needs, in an
//! order their column dependencies allow. The spec starts with the
//! `input_level` phase (data retrieval plus input-level transforms) and adds
//! one phase per granularity (aggregation plus grain transforms), each phase
//! ending in a value-writer stage. After the build, data-source projections
//! are trimmed to the columns that are actually required.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::CoreError;
use crate::payload::Payload;
use crate::pipeline::aggregate::{self, DataAggregator};
use crate::stage::{Stage, StageCatalog, StageType};
use crate::store::writer::ValueWriter;

pub const INPUT_LEVEL_PHASE: &str = "input_level";

/// One stage slotted into a job spec. The effective schedule and the
/// projection override live here rather than on the (shared, externally
/// owned) stage object.
#[derive(Clone)]
pub struct SpecStage {
    pub stage: Arc<dyn Stage>,
    pub schedule: String,
    pub projection: Option<Vec<String>>,
}

impl SpecStage {
    pub(crate) fn new(stage: Arc<dyn Stage>, schedule: &str) -> Self {
        Self {
            stage,
            schedule: schedule.to_string(),
            projection: None,
        }
    }

    /// Columns this slot delivers: the trimmed projection when one was
    /// computed, the stage's declared outputs otherwise.
    pub fn effective_outputs(&self) -> Vec<String> {
        self.projection
            .clone()
            .unwrap_or_else(|| self.stage.output_list())
    }
}

/// Ordered mapping `phase -> stages`; `input_level` first, then one phase per
/// granularity in catalog order.
pub struct JobSpec {
    pub phases: IndexMap<String, Vec<SpecStage>>,
    pub custom_calendar: Option<Arc<dyn Stage>>,
}

impl JobSpec {
    pub fn phase(&self, name: &str) -> &[SpecStage] {
        self.phases.get(name).map_or(&[], Vec::as_slice)
    }
}

#[derive(Default)]
struct BuildState {
    available: HashSet<String>,
    required: HashSet<String>,
    /// Data-source stage name -> columns recorded for projection trimming.
    projections: IndexMap<String, HashSet<String>>,
    calendar: Option<Arc<dyn Stage>>,
}

pub(crate) struct JobSpecBuilder<'a> {
    payload: &'a dyn Payload,
    default_schedule: String,
    max_passes: usize,
    write_batch_rows: usize,
}

impl<'a> JobSpecBuilder<'a> {
    pub(crate) fn new(
        payload: &'a dyn Payload,
        default_schedule: impl Into<String>,
        max_passes: usize,
        write_batch_rows: usize,
    ) -> Self {
        Self {
            payload,
            default_schedule: default_schedule.into(),
            max_passes: max_passes.max(1),
            write_batch_rows,
        }
    }

    pub(crate) fn build(
        &self,
        schedule: &str,
        subsumed: &[String],
    ) -> Result<JobSpec, CoreError> {
        debug!(schedule, ?subsumed, "building job spec");
        let catalog = self.payload.stages();
        let mut allowed: HashSet<String> = subsumed.iter().cloned().collect();
        allowed.insert(schedule.to_string());

        let mut state = BuildState::default();
        let mut phases: IndexMap<String, Vec<SpecStage>> = IndexMap::new();

        let mut phase = Vec::new();
        self.gather(catalog, StageType::GetData, None, &allowed, &mut phase, &mut state);
        self.gather(catalog, StageType::Transform, None, &allowed, &mut phase, &mut state);
        phase.push(self.writer_stage(INPUT_LEVEL_PHASE, schedule));
        phases.insert(INPUT_LEVEL_PHASE.to_string(), phase);

        // Every granularity phase starts from the input-level columns; grains
        // do not leak columns into one another.
        let input_level_columns = state.available.clone();
        for granularity in catalog.granularities() {
            debug!(granularity = %granularity.name, "building job spec for aggregation grain");
            let mut phase = Vec::new();
            state.available = input_level_columns.clone();

            let plan = aggregate::collapse(catalog, granularity, &state.available)?;
            state.required.extend(plan.inputs.iter().cloned());
            state.available.extend(plan.outputs.iter().cloned());
            let aggregator =
                DataAggregator::new("auto_aggregate", granularity.clone(), plan);
            phase.push(SpecStage::new(Arc::new(aggregator), schedule));

            self.gather(
                catalog,
                StageType::Transform,
                Some(&granularity.name),
                &allowed,
                &mut phase,
                &mut state,
            );
            phase.push(self.writer_stage(&granularity.name, schedule));
            phases.insert(granularity.name.clone(), phase);
        }

        let mut spec = JobSpec {
            phases,
            custom_calendar: state.calendar.clone(),
        };
        self.trim_projections(&mut spec, &state);

        for (name, stages) in &spec.phases {
            debug!(
                phase = %name,
                stages = ?stages.iter().map(|s| s.stage.name()).collect::<Vec<_>>(),
                "job spec phase complete"
            );
        }
        Ok(spec)
    }

    /// Repeatedly select stages whose inputs are already available, growing
    /// the available-column set with each pass, until a pass adds nothing or
    /// the pass limit is reached.
    fn gather(
        &self,
        catalog: &StageCatalog,
        stage_type: StageType,
        granularity: Option<&str>,
        allowed: &HashSet<String>,
        phase: &mut Vec<SpecStage>,
        state: &mut BuildState,
    ) {
        for _ in 0..self.max_passes {
            let exclude: Vec<String> = phase
                .iter()
                .map(|entry| entry.stage.name().to_string())
                .collect();
            let (candidates, _) =
                catalog.selectable(stage_type, granularity, Some(&state.available), &exclude);

            let mut added: Vec<String> = Vec::new();
            for stage in candidates {
                let effective = stage
                    .schedule()
                    .unwrap_or_else(|| self.default_schedule.clone());
                if !allowed.contains(&effective) {
                    continue;
                }
                state.available.extend(stage.output_list());
                state.required.extend(stage.input_set());
                if stage.is_data_source() {
                    state
                        .projections
                        .entry(stage.name().to_string())
                        .or_default()
                        .extend(stage.output_list());
                }
                if stage.is_custom_calendar() {
                    state.calendar = Some(Arc::clone(&stage));
                    self.payload.register_custom_calendar(Arc::clone(&stage));
                    debug!(
                        stage = stage.name(),
                        "stage registered itself as the custom calendar"
                    );
                }
                let params = stage.metadata_params();
                if !params.is_empty() {
                    debug!(
                        stage = stage.name(),
                        params = ?params.keys().collect::<Vec<_>>(),
                        "stage contributed properties to the payload"
                    );
                    self.payload.absorb_params(params);
                }
                added.push(stage.name().to_string());
                phase.push(SpecStage::new(stage, &effective));
            }
            if added.is_empty() {
                break;
            }
            debug!(?stage_type, stages = ?added, "added stages to the job spec");
        }

        let (all, all_columns) = catalog.selectable(stage_type, granularity, None, &[]);
        let selected: HashSet<&str> = phase.iter().map(|e| e.stage.name()).collect();
        let skipped: Vec<&str> = all
            .iter()
            .map(|s| s.name())
            .filter(|name| !selected.contains(name))
            .collect();
        if !skipped.is_empty() {
            let omitted: Vec<&String> = all_columns
                .iter()
                .filter(|c| !state.available.contains(*c))
                .collect();
            debug!(
                ?stage_type,
                ?skipped,
                ?omitted,
                "stages skipped for this schedule; their data items are unavailable"
            );
        }
    }

    /// Trim each recorded data source down to the columns something actually
    /// requires. A source nothing requires is removed from every phase.
    fn trim_projections(&self, spec: &mut JobSpec, state: &BuildState) {
        let mut protected = state.required.clone();
        protected.extend(self.payload.mandatory_columns());

        for (stage_name, recorded) in &state.projections {
            let needed: HashSet<String> = recorded
                .iter()
                .filter(|col| protected.contains(*col))
                .cloned()
                .collect();
            debug!(
                stage = %stage_name,
                required = ?needed,
                "evaluating data source projection"
            );
            if needed.is_empty() {
                debug!(
                    stage = %stage_name,
                    "data source is not required for this execution; removing it"
                );
                for stages in spec.phases.values_mut() {
                    stages.retain(|entry| entry.stage.name() != stage_name);
                }
            } else if needed.len() != recorded.len() {
                for stages in spec.phases.values_mut() {
                    for entry in stages
                        .iter_mut()
                        .filter(|entry| entry.stage.name() == *stage_name)
                    {
                        let ordered: Vec<String> = entry
                            .stage
                            .output_list()
                            .into_iter()
                            .filter(|col| needed.contains(col))
                            .collect();
                        debug!(
                            stage = %stage_name,
                            projection = ?ordered,
                            "trimming data source projection"
                        );
                        entry.projection = Some(ordered);
                    }
                }
            }
        }
    }

    fn writer_stage(&self, label: &str, schedule: &str) -> SpecStage {
        let writer = ValueWriter::new(
            format!("data_writer_{label}"),
            self.payload.store(),
            self.payload.data_items(),
            self.payload.grains(),
            self.write_batch_rows,
        );
        SpecStage::new(Arc::new(writer), schedule)
    }
}
