//! Aggregation planning and the generic aggregator stage.
//!
//! Simple aggregators (one input, one output) for a granularity are collapsed
//! into a single grouped aggregation dictionary so the frame is grouped once
//! per grain. Complex aggregators keep their identity and are applied per
//! group. The collapsed plan runs as one [`DataAggregator`] stage whose
//! result replaces the merge state.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::{debug, info};

use crate::error::CoreError;
use crate::frame::{Frame, FrameIndex, IndexKey, Value};
use crate::payload::Granularity;
use crate::stage::{Reduction, Stage, StageCatalog, StageContext, StageOutput, StageType};
use crate::util::freq::{floor_to, parse_freq};

/// One aggregation to run over a grouped input column: a named reduction, or
/// the declaring stage's own execute as a fallback.
#[derive(Clone)]
pub enum AggCall {
    Named(Reduction),
    Stage(Arc<dyn Stage>),
}

impl fmt::Debug for AggCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggCall::Named(reduction) => write!(f, "{reduction:?}"),
            AggCall::Stage(stage) => write!(f, "stage:{}", stage.name()),
        }
    }
}

/// The collapsed aggregation work for one granularity.
#[derive(Default)]
pub struct AggregationPlan {
    /// input column -> aggregations, in stage declaration order.
    pub agg: IndexMap<String, Vec<AggCall>>,
    pub complex: Vec<Arc<dyn Stage>>,
    pub inputs: HashSet<String>,
    /// Output names: simple outputs in declaration order, then complex
    /// outputs. Result columns are renamed to these positionally.
    pub outputs: Vec<String>,
}

impl fmt::Debug for AggregationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationPlan")
            .field("agg", &self.agg)
            .field(
                "complex",
                &self.complex.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// Collapse the simple aggregators for `granularity` into one plan and carry
/// the complex ones alongside.
pub(crate) fn collapse(
    catalog: &StageCatalog,
    granularity: &Granularity,
    available: &HashSet<String>,
) -> Result<AggregationPlan, CoreError> {
    let mut plan = AggregationPlan::default();

    let (simple, _) = catalog.selectable(
        StageType::SimpleAggregate,
        Some(&granularity.name),
        Some(available),
        &[],
    );
    for stage in simple {
        let mut inputs: Vec<String> = stage.input_set().into_iter().collect();
        inputs.sort();
        let outputs = stage.output_list();
        if inputs.len() != 1 || outputs.len() != 1 {
            return Err(CoreError::BadAggregatorShape {
                stage: stage.name().to_string(),
                inputs,
                outputs,
            });
        }
        let call = stage
            .agg_function()
            .map_or_else(|| AggCall::Stage(Arc::clone(&stage)), AggCall::Named);
        let input = inputs.remove(0);
        plan.agg.entry(input.clone()).or_default().push(call);
        plan.inputs.insert(input);
        plan.outputs.extend(outputs);
    }

    let (complex, _) = catalog.selectable(
        StageType::ComplexAggregate,
        Some(&granularity.name),
        Some(available),
        &[],
    );
    for stage in complex {
        plan.inputs.extend(stage.input_set());
        plan.outputs.extend(stage.output_list());
        plan.complex.push(stage);
    }

    debug!(
        granularity = %granularity.name,
        agg = ?plan.agg,
        complex = ?plan.complex.iter().map(|s| s.name()).collect::<Vec<_>>(),
        outputs = ?plan.outputs,
        "collapsed aggregation stages"
    );
    Ok(plan)
}

/// Generic grouped-aggregation stage emitted by the job-spec builder for
/// each granularity phase.
pub struct DataAggregator {
    name: String,
    granularity: Granularity,
    plan: AggregationPlan,
}

impl DataAggregator {
    pub(crate) fn new(
        name: impl Into<String>,
        granularity: Granularity,
        plan: AggregationPlan,
    ) -> Self {
        Self {
            name: name.into(),
            granularity,
            plan,
        }
    }

    /// Group row positions by the granularity grouper. Timestamp keys are
    /// floored to the grain frequency when one is declared.
    fn group_rows(&self, frame: &Frame) -> anyhow::Result<BTreeMap<IndexKey, Vec<usize>>> {
        let bucket = self
            .granularity
            .freq
            .as_deref()
            .map(parse_freq)
            .transpose()?;
        let index = frame.index();
        let mut groups: BTreeMap<IndexKey, Vec<usize>> = BTreeMap::new();
        for row in 0..frame.row_count() {
            let mut key = Vec::with_capacity(self.granularity.grouper.len());
            for part in &self.granularity.grouper {
                let value = index
                    .position(part)
                    .map(|pos| index.keys()[row][pos].clone())
                    .or_else(|| frame.cell(row, part).cloned())
                    .with_context(|| {
                        format!("grouping key {part} is neither an index part nor a column")
                    })?;
                let value = match (&value, bucket) {
                    (Value::Timestamp(ts), Some(step)) => Value::Timestamp(floor_to(*ts, step)),
                    _ => value,
                };
                key.push(value);
            }
            groups.entry(key).or_default().push(row);
        }
        Ok(groups)
    }

    /// Run a fallback simple aggregator over one group of the input column
    /// and expect a single value back.
    async fn stage_reduction(
        &self,
        stage: &dyn Stage,
        input: &str,
        rows: &[usize],
        frame: &Frame,
        ctx: StageContext<'_>,
    ) -> anyhow::Result<Value> {
        let sliced = frame.sub_frame(rows);
        let column = sliced
            .column(input)
            .with_context(|| format!("aggregation input {input} is missing from the frame"))?
            .to_vec();
        let sub = Frame::from_columns(sliced.index().clone(), vec![(input.to_string(), column)]);
        let sub_ctx = StageContext {
            frame: &sub,
            start_ts: ctx.start_ts,
            end_ts: ctx.end_ts,
            entities: ctx.entities,
            projection: None,
        };
        let out = stage.execute(sub_ctx).await?;
        single_value(out).with_context(|| {
            format!(
                "simple aggregator {} must reduce each group to a single value",
                stage.name()
            )
        })
    }
}

fn single_value(out: StageOutput) -> Option<Value> {
    match out {
        StageOutput::Scalar(value) => Some(value),
        StageOutput::Series(series) if series.values.len() == 1 => {
            series.values.into_iter().next()
        }
        StageOutput::Frame(frame) if frame.row_count() == 1 => {
            frame.columns().next().map(|(_, v)| v[0].clone())
        }
        _ => None,
    }
}

/// One group's worth of values from a complex aggregator.
fn complex_result_row(
    out: StageOutput,
    width: usize,
    stage_name: &str,
) -> anyhow::Result<Vec<Value>> {
    let values = match out {
        StageOutput::Scalar(value) => vec![value],
        StageOutput::Series(series) => series.values,
        StageOutput::Frame(frame) if frame.row_count() == 1 => frame
            .columns()
            .map(|(_, values)| values[0].clone())
            .collect(),
        _ => bail!(
            "complex aggregator {stage_name} must produce one row per group"
        ),
    };
    if values.len() != width {
        bail!(
            "complex aggregator {stage_name} produced {} values per group but declares {width} outputs",
            values.len()
        );
    }
    Ok(values)
}

fn reduce(reduction: Reduction, values: &[&Value]) -> Value {
    let non_null: Vec<&Value> = values.iter().copied().filter(|v| !v.is_null()).collect();
    let numbers = || -> Vec<f64> {
        non_null
            .iter()
            .filter_map(|v| v.as_f64())
            .filter(|f| !f.is_nan())
            .collect()
    };
    match reduction {
        #[allow(clippy::cast_precision_loss)]
        Reduction::Count => Value::number(non_null.len() as f64),
        Reduction::First => non_null.first().map_or(Value::Null, |v| (*v).clone()),
        Reduction::Last => non_null.last().map_or(Value::Null, |v| (*v).clone()),
        Reduction::Min => non_null.iter().min().map_or(Value::Null, |v| (*v).clone()),
        Reduction::Max => non_null.iter().max().map_or(Value::Null, |v| (*v).clone()),
        Reduction::Sum => Value::number(numbers().iter().sum()),
        Reduction::Mean => {
            let nums = numbers();
            if nums.is_empty() {
                return Value::Null;
            }
            #[allow(clippy::cast_precision_loss)]
            let mean = nums.iter().sum::<f64>() / nums.len() as f64;
            Value::number(mean)
        }
        Reduction::Median => {
            let mut nums = numbers();
            if nums.is_empty() {
                return Value::Null;
            }
            nums.sort_by(f64::total_cmp);
            let mid = nums.len() / 2;
            if nums.len() % 2 == 0 {
                Value::number((nums[mid - 1] + nums[mid]) / 2.0)
            } else {
                Value::number(nums[mid])
            }
        }
        Reduction::Std => {
            let nums = numbers();
            if nums.len() < 2 {
                return Value::Null;
            }
            #[allow(clippy::cast_precision_loss)]
            let mean = nums.iter().sum::<f64>() / nums.len() as f64;
            #[allow(clippy::cast_precision_loss)]
            let var = nums.iter().map(|n| (n - mean).powi(2)).sum::<f64>()
                / (nums.len() - 1) as f64;
            Value::number(var.sqrt())
        }
    }
}

#[async_trait]
impl Stage for DataAggregator {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_set(&self) -> HashSet<String> {
        self.plan.inputs.clone()
    }

    fn output_list(&self) -> Vec<String> {
        self.plan.outputs.clone()
    }

    fn allow_empty_frame(&self) -> bool {
        false
    }

    fn discard_prior_on_merge(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: StageContext<'_>) -> anyhow::Result<StageOutput> {
        let frame = ctx.frame;
        let groups = self.group_rows(frame)?;
        let group_keys: Vec<IndexKey> = groups.keys().cloned().collect();
        let mut result_columns: Vec<Vec<Value>> = Vec::new();

        for (input, calls) in &self.plan.agg {
            let column = frame.column(input).with_context(|| {
                format!("aggregation input {input} is missing from the frame")
            })?;
            for call in calls {
                let mut out = Vec::with_capacity(groups.len());
                for rows in groups.values() {
                    let values: Vec<&Value> = rows.iter().map(|&r| &column[r]).collect();
                    let value = match call {
                        AggCall::Named(reduction) => reduce(*reduction, &values),
                        AggCall::Stage(stage) => {
                            self.stage_reduction(stage.as_ref(), input, rows, frame, ctx)
                                .await?
                        }
                    };
                    out.push(value);
                }
                result_columns.push(out);
            }
        }

        for stage in &self.plan.complex {
            let width = stage.output_list().len().max(1);
            let mut cols: Vec<Vec<Value>> = vec![Vec::with_capacity(groups.len()); width];
            for rows in groups.values() {
                let sub = frame.sub_frame(rows);
                let sub_ctx = StageContext {
                    frame: &sub,
                    start_ts: ctx.start_ts,
                    end_ts: ctx.end_ts,
                    entities: ctx.entities,
                    projection: None,
                };
                let out = stage.execute(sub_ctx).await?;
                let row_values = complex_result_row(out, width, stage.name())?;
                for (col, value) in row_values.into_iter().enumerate() {
                    cols[col].push(value);
                }
            }
            result_columns.extend(cols);
        }

        if result_columns.len() != self.plan.outputs.len() {
            bail!(
                "aggregation for {} produced {} columns but {} outputs were declared",
                self.granularity.name,
                result_columns.len(),
                self.plan.outputs.len()
            );
        }

        let index = FrameIndex::new(self.granularity.grouper.clone(), group_keys);
        let mut result = Frame::with_index(index);
        for (name, column) in self.plan.outputs.iter().zip(result_columns) {
            result.set_column(name, column);
        }
        info!(granularity = %self.granularity.name, "completed aggregation");
        Ok(StageOutput::Frame(result))
    }
}
