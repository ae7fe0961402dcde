//! The uniform stage contract.
//!
//! Stages are externally owned, polymorphic units of work. The core never
//! subclasses them; it inspects capability flags and metadata through this
//! trait and drives everything through one `execute` entry point taking a
//! context struct. Legacy window-less transforms are wrapped by the
//! [`FrameOnly`] adapter instead of being probed for their call shape.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::frame::merge::MergeInput;
use crate::frame::{Frame, Series, Value};
use crate::payload::Granularity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageType {
    Preload,
    GetData,
    Transform,
    SimpleAggregate,
    ComplexAggregate,
}

/// Everything a stage may need for one invocation. All window fields are
/// optional; a stage that ignores them behaves like the legacy single-arg
/// call shape.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub frame: &'a Frame,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub entities: Option<&'a [String]>,
    /// Projection override computed by the job-spec builder for data sources.
    pub projection: Option<&'a [String]>,
}

/// Raw stage result before normalization. `Ack(true)` stands in for an empty
/// frame, `Ack(false)` asks the runner to halt the current chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Frame(Frame),
    Series(Series),
    Grid(Vec<Vec<Value>>),
    Scalar(Value),
    Mapping(IndexMap<String, Value>),
    Ack(bool),
}

impl StageOutput {
    /// Normalize into something the merger accepts; `None` signals a halt.
    pub(crate) fn into_merge_input(self) -> Option<MergeInput> {
        match self {
            StageOutput::Ack(false) => None,
            StageOutput::Ack(true) => Some(MergeInput::Frame(Frame::new())),
            StageOutput::Frame(frame) => Some(MergeInput::Frame(frame)),
            StageOutput::Series(series) => Some(MergeInput::Series(series)),
            StageOutput::Grid(grid) => Some(MergeInput::Grid(grid)),
            StageOutput::Scalar(value) => Some(MergeInput::Scalar(value)),
            StageOutput::Mapping(mapping) => Some(MergeInput::Mapping(mapping)),
        }
    }
}

/// Named reductions understood by the aggregator without calling back into
/// the declaring stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    Mean,
    Min,
    Max,
    First,
    Last,
    Count,
    Median,
    Std,
}

impl FromStr for Reduction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(Reduction::Sum),
            "mean" | "avg" => Ok(Reduction::Mean),
            "min" => Ok(Reduction::Min),
            "max" => Ok(Reduction::Max),
            "first" => Ok(Reduction::First),
            "last" => Ok(Reduction::Last),
            "count" => Ok(Reduction::Count),
            "median" => Ok(Reduction::Median),
            "std" => Ok(Reduction::Std),
            other => Err(format!("unknown aggregation function: {other}")),
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Data items this stage needs before it can run.
    fn input_set(&self) -> HashSet<String> {
        HashSet::new()
    }

    /// Data items this stage delivers, in order.
    fn output_list(&self) -> Vec<String> {
        Vec::new()
    }

    /// Declared schedule frequency; stages without one run on the default
    /// schedule (the effective schedule is recorded on the job-spec entry).
    fn schedule(&self) -> Option<String> {
        None
    }

    fn is_data_source(&self) -> bool {
        false
    }

    fn is_custom_calendar(&self) -> bool {
        false
    }

    /// Replace prior merge state with this stage's result.
    fn discard_prior_on_merge(&self) -> bool {
        false
    }

    /// When false, the runner halts the chunk instead of invoking the stage
    /// on an empty frame.
    fn allow_empty_frame(&self) -> bool {
        true
    }

    fn produces_output_items(&self) -> bool {
        true
    }

    /// Named reduction for simple aggregators; `None` falls back to calling
    /// `execute` per group.
    fn agg_function(&self) -> Option<Reduction> {
        None
    }

    /// Properties a metadata-provider stage contributes to the payload.
    fn metadata_params(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    async fn execute(&self, ctx: StageContext<'_>) -> anyhow::Result<StageOutput>;
}

/// Window-less transform: the legacy single-argument call shape.
pub trait FrameTransform: Send + Sync {
    fn name(&self) -> &str;

    fn input_set(&self) -> HashSet<String> {
        HashSet::new()
    }

    fn output_list(&self) -> Vec<String>;

    fn apply(&self, frame: &Frame) -> anyhow::Result<StageOutput>;
}

/// Adapter presenting a [`FrameTransform`] through the full stage contract.
pub struct FrameOnly<T>(pub T);

#[async_trait]
impl<T: FrameTransform> Stage for FrameOnly<T> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn input_set(&self) -> HashSet<String> {
        self.0.input_set()
    }

    fn output_list(&self) -> Vec<String> {
        self.0.output_list()
    }

    async fn execute(&self, ctx: StageContext<'_>) -> anyhow::Result<StageOutput> {
        self.0.apply(ctx.frame)
    }
}

/// Time-windowed source of raw data items.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn get_data(
        &self,
        start_ts: Option<DateTime<Utc>>,
        end_ts: Option<DateTime<Utc>>,
        entities: Option<&[String]>,
        columns: &[String],
    ) -> anyhow::Result<Frame>;
}

/// Built-in stage wrapping a [`DataSource`]. The job-spec builder may narrow
/// the retrieved columns through the context projection.
pub struct SourceReader {
    name: String,
    source: Arc<dyn DataSource>,
    outputs: Vec<String>,
    schedule: Option<String>,
}

impl SourceReader {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn DataSource>,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            outputs,
            schedule: None,
        }
    }

    #[must_use]
    pub fn with_schedule(mut self, freq: impl Into<String>) -> Self {
        self.schedule = Some(freq.into());
        self
    }
}

#[async_trait]
impl Stage for SourceReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_list(&self) -> Vec<String> {
        self.outputs.clone()
    }

    fn schedule(&self) -> Option<String> {
        self.schedule.clone()
    }

    fn is_data_source(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: StageContext<'_>) -> anyhow::Result<StageOutput> {
        let columns: Vec<String> = ctx
            .projection
            .map_or_else(|| self.outputs.clone(), <[String]>::to_vec);
        let frame = self
            .source
            .get_data(ctx.start_ts, ctx.end_ts, ctx.entities, &columns)
            .await?;
        Ok(StageOutput::Frame(frame))
    }
}

/// Ordered stage metadata: `(stage type, granularity) -> stages`, plus the
/// distinct granularities in first-seen order.
#[derive(Default)]
pub struct StageCatalog {
    slots: IndexMap<(StageType, Option<String>), Vec<Arc<dyn Stage>>>,
    granularities: IndexMap<String, Granularity>,
}

impl StageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        stage_type: StageType,
        granularity: Option<&Granularity>,
        stage: Arc<dyn Stage>,
    ) {
        let gran_name = granularity.map(|g| {
            self.granularities
                .entry(g.name.clone())
                .or_insert_with(|| g.clone());
            g.name.clone()
        });
        self.slots
            .entry((stage_type, gran_name))
            .or_default()
            .push(stage);
    }

    pub fn stages(&self, stage_type: StageType, granularity: Option<&str>) -> &[Arc<dyn Stage>] {
        self.slots
            .get(&(stage_type, granularity.map(str::to_string)))
            .map_or(&[], Vec::as_slice)
    }

    pub fn granularities(&self) -> impl Iterator<Item = &Granularity> {
        self.granularities.values()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Stages of a type at a granularity that are runnable with the given
    /// columns, minus excluded names. `available: None` disables the column
    /// filter. Also returns the columns the selected stages would add.
    pub(crate) fn selectable(
        &self,
        stage_type: StageType,
        granularity: Option<&str>,
        available: Option<&HashSet<String>>,
        exclude: &[String],
    ) -> (Vec<Arc<dyn Stage>>, HashSet<String>) {
        let mut selected = Vec::new();
        let mut new_cols = HashSet::new();
        for stage in self.stages(stage_type, granularity) {
            if exclude.iter().any(|name| name == stage.name()) {
                continue;
            }
            if let Some(available) = available {
                if !stage.input_set().is_subset(available) {
                    continue;
                }
            }
            for col in stage.output_list() {
                if available.map_or(true, |a| !a.contains(&col)) {
                    new_cols.insert(col);
                }
            }
            selected.push(Arc::clone(stage));
        }
        (selected, new_cols)
    }
}
