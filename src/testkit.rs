//! Shared test scaffolding: a scriptable stage and a configurable payload
//! backed by the in-memory store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::payload::{DataItemCatalog, Granularity, Payload};
use crate::scheduler::schedule::Schedule;
use crate::stage::{Reduction, Stage, StageCatalog, StageContext, StageOutput};
use crate::store::mock::MockStore;
use crate::store::KpiStore;

type BehaviorFn = dyn Fn(StageContext<'_>) -> anyhow::Result<StageOutput> + Send + Sync;

/// One recorded stage invocation: window bounds and projection override.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedCall {
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub projection: Option<Vec<String>>,
}

/// A stage whose metadata and behavior are fully scripted by the test.
pub(crate) struct ScriptStage {
    name: String,
    inputs: HashSet<String>,
    outputs: Vec<String>,
    schedule: Option<String>,
    data_source: bool,
    custom_calendar: bool,
    discard_prior: bool,
    allow_empty: bool,
    produces_outputs: bool,
    agg_function: Option<Reduction>,
    metadata: serde_json::Map<String, serde_json::Value>,
    behavior: Box<BehaviorFn>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptStage {
    pub(crate) fn new(name: &str, inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            inputs: inputs.iter().map(ToString::to_string).collect(),
            outputs: outputs.iter().map(ToString::to_string).collect(),
            schedule: None,
            data_source: false,
            custom_calendar: false,
            discard_prior: false,
            allow_empty: true,
            produces_outputs: true,
            agg_function: None,
            metadata: serde_json::Map::new(),
            behavior: Box::new(|_| Ok(StageOutput::Ack(true))),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_schedule(mut self, freq: &str) -> Self {
        self.schedule = Some(freq.to_string());
        self
    }

    pub(crate) fn as_data_source(mut self) -> Self {
        self.data_source = true;
        self
    }

    pub(crate) fn as_custom_calendar(mut self) -> Self {
        self.custom_calendar = true;
        self
    }

    pub(crate) fn discarding_prior(mut self) -> Self {
        self.discard_prior = true;
        self
    }

    pub(crate) fn rejecting_empty(mut self) -> Self {
        self.allow_empty = false;
        self
    }

    pub(crate) fn without_outputs(mut self) -> Self {
        self.produces_outputs = false;
        self
    }

    pub(crate) fn with_agg_function(mut self, reduction: Reduction) -> Self {
        self.agg_function = Some(reduction);
        self
    }

    pub(crate) fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub(crate) fn with_behavior(
        mut self,
        behavior: impl Fn(StageContext<'_>) -> anyhow::Result<StageOutput> + Send + Sync + 'static,
    ) -> Self {
        self.behavior = Box::new(behavior);
        self
    }

    pub(crate) fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub(crate) fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Stage for ScriptStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_set(&self) -> HashSet<String> {
        self.inputs.clone()
    }

    fn output_list(&self) -> Vec<String> {
        self.outputs.clone()
    }

    fn schedule(&self) -> Option<String> {
        self.schedule.clone()
    }

    fn is_data_source(&self) -> bool {
        self.data_source
    }

    fn is_custom_calendar(&self) -> bool {
        self.custom_calendar
    }

    fn discard_prior_on_merge(&self) -> bool {
        self.discard_prior
    }

    fn allow_empty_frame(&self) -> bool {
        self.allow_empty
    }

    fn produces_output_items(&self) -> bool {
        self.produces_outputs
    }

    fn agg_function(&self) -> Option<Reduction> {
        self.agg_function
    }

    fn metadata_params(&self) -> serde_json::Map<String, serde_json::Value> {
        self.metadata.clone()
    }

    async fn execute(&self, ctx: StageContext<'_>) -> anyhow::Result<StageOutput> {
        self.calls.lock().unwrap().push(RecordedCall {
            start_ts: ctx.start_ts,
            end_ts: ctx.end_ts,
            projection: ctx.projection.map(<[String]>::to_vec),
        });
        (self.behavior)(ctx)
    }
}

/// Payload stub with every knob the controller consults.
pub(crate) struct TestPayload {
    pub(crate) name: String,
    pub(crate) catalog: StageCatalog,
    pub(crate) store: Arc<MockStore>,
    pub(crate) schedules: Vec<Schedule>,
    pub(crate) items: DataItemCatalog,
    pub(crate) grains: HashMap<String, Granularity>,
    pub(crate) mandatory: Vec<String>,
    pub(crate) progressive: bool,
    pub(crate) chunk_size: Option<String>,
    pub(crate) early: Option<DateTime<Utc>>,
    pub(crate) entities: Option<Vec<String>>,
    pub(crate) adjust_start: Option<Box<dyn Fn(DateTime<Utc>) -> DateTime<Utc> + Send + Sync>>,
    pub(crate) absorbed: Mutex<serde_json::Map<String, serde_json::Value>>,
    pub(crate) calendar: Mutex<Option<String>>,
}

impl TestPayload {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            catalog: StageCatalog::new(),
            store: Arc::new(MockStore::new()),
            schedules: Vec::new(),
            items: DataItemCatalog::new(),
            grains: HashMap::new(),
            mandatory: Vec::new(),
            progressive: true,
            chunk_size: None,
            early: None,
            entities: None,
            adjust_start: None,
            absorbed: Mutex::new(serde_json::Map::new()),
            calendar: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Payload for TestPayload {
    fn name(&self) -> &str {
        &self.name
    }

    fn store(&self) -> Arc<dyn KpiStore> {
        Arc::clone(&self.store) as Arc<dyn KpiStore>
    }

    fn stages(&self) -> &StageCatalog {
        &self.catalog
    }

    fn schedules(&self) -> Vec<Schedule> {
        self.schedules.clone()
    }

    fn data_items(&self) -> DataItemCatalog {
        self.items.clone()
    }

    fn grains(&self) -> HashMap<String, Granularity> {
        self.grains.clone()
    }

    fn mandatory_columns(&self) -> Vec<String> {
        self.mandatory.clone()
    }

    fn is_schedule_progressive(&self) -> bool {
        self.progressive
    }

    fn chunk_size(&self) -> Option<String> {
        self.chunk_size.clone()
    }

    async fn early_timestamp(&self) -> Option<DateTime<Utc>> {
        self.early
    }

    fn adjusted_start_date(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        self.adjust_start.as_ref().map_or(start, |f| f(start))
    }

    fn entity_filter(&self) -> Option<Vec<String>> {
        self.entities.clone()
    }

    fn absorb_params(&self, params: serde_json::Map<String, serde_json::Value>) {
        self.absorbed.lock().unwrap().extend(params);
    }

    fn register_custom_calendar(&self, calendar: Arc<dyn Stage>) {
        *self.calendar.lock().unwrap() = Some(calendar.name().to_string());
    }
}
