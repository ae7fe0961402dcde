//! Runs the stages of one job-spec phase and merges their results.
//!
//! Every stage goes through the same contract: guard against empty input
//! when the stage forbids it, execute with the chunk window, normalize the
//! result (`true` is an empty frame, `false` is a halt) and auto-merge the
//! declared output columns into the running frame. A halt is soft: it stops
//! the current run and reports `false`, leaving the caller to move on to the
//! next chunk or schedule.

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::{debug, info};

use crate::frame::merge::DataMerge;
use crate::frame::{Frame, Value};
use crate::pipeline::spec::SpecStage;
use crate::stage::StageContext;

pub(crate) struct StageRunner<'a> {
    entities: Option<&'a [String]>,
}

impl<'a> StageRunner<'a> {
    pub(crate) fn new(entities: Option<&'a [String]>) -> Self {
        Self { entities }
    }

    /// Execute a phase over the given frame. Returns the resulting frame and
    /// whether the phase ran to completion (`false` means a halt).
    pub(crate) async fn run_phase(
        &self,
        stages: &[SpecStage],
        frame: Option<Frame>,
        start_ts: Option<DateTime<Utc>>,
        end_ts: Option<DateTime<Utc>>,
        constants: Option<IndexMap<String, Value>>,
    ) -> anyhow::Result<(Frame, bool)> {
        let mut merge = DataMerge::new(frame, constants);

        for entry in stages {
            let stage = entry.stage.as_ref();
            if !stage.allow_empty_frame() && merge.frame().is_empty() {
                info!(
                    stage = stage.name(),
                    "terminating this run: the stage received an empty frame but does not accept one"
                );
                return Ok((merge.into_frame(), false));
            }

            let output = {
                let ctx = StageContext {
                    frame: merge.frame(),
                    start_ts,
                    end_ts,
                    entities: self.entities,
                    projection: entry.projection.as_deref(),
                };
                stage
                    .execute(ctx)
                    .await
                    .with_context(|| format!("stage {} failed", stage.name()))?
            };
            debug!(stage = stage.name(), "executed stage");

            if stage.discard_prior_on_merge() {
                debug!(
                    stage = stage.name(),
                    "prior data will be replaced by this stage's results"
                );
                merge.clear();
            }

            let Some(input) = output.into_merge_input() else {
                info!(stage = stage.name(), "stage signalled a halt for this run");
                return Ok((merge.into_frame(), false));
            };

            if stage.produces_output_items() {
                let columns = entry.effective_outputs();
                if columns.is_empty() {
                    bail!(
                        "stage {} produces output items but declared no output columns",
                        stage.name()
                    );
                }
                merge.merge(input, &columns, false)?;
                debug!(
                    stage = stage.name(),
                    rows = merge.frame().row_count(),
                    columns = ?merge.frame().column_names(),
                    index = ?merge.frame().index_names(),
                    "merged stage output"
                );
            } else {
                debug!(
                    stage = stage.name(),
                    "stage does not contribute output items"
                );
            }
        }

        Ok((merge.into_frame(), true))
    }
}
