//! The payload contract.
//!
//! A payload is the externally supplied configuration-and-stage bundle the
//! controller drives: stage metadata, schedules, data-item metadata,
//! granularities and the storage handle. Every method beyond the required
//! getters has a default, so a payload implements only what it needs and the
//! controller falls back to defaults for the rest.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::scheduler::schedule::Schedule;
use crate::stage::{Stage, StageCatalog};
use crate::store::KpiStore;

/// A grouping specification for aggregation: entity and/or time and/or
/// extra dimensions. `grouper` lists the key names in grouping order;
/// `freq` buckets timestamp keys when present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Granularity {
    pub name: String,
    pub grouper: Vec<String>,
    pub entity_id: Option<String>,
    pub freq: Option<String>,
    pub dimensions: Option<Vec<String>>,
}

impl Granularity {
    pub fn new(name: impl Into<String>, grouper: Vec<String>) -> Self {
        Self {
            name: name.into(),
            grouper,
            entity_id: None,
            freq: None,
            dimensions: None,
        }
    }
}

/// Persistence metadata for one derived data item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataItemMetadata {
    /// BOOLEAN / NUMBER / LITERAL / TIMESTAMP; anything else is coerced to
    /// LITERAL by the writer with a warning.
    pub column_type: Option<String>,
    /// Transient items are never written to the database.
    pub transient: bool,
    pub source_table: Option<String>,
}

pub type DataItemCatalog = HashMap<String, DataItemMetadata>;

#[async_trait]
pub trait Payload: Send + Sync {
    fn name(&self) -> &str;

    /// Kind tag recorded as `object_type` in the job log.
    fn object_type(&self) -> &str {
        "entity_type"
    }

    /// Storage handle shared by the job log and the value writer.
    fn store(&self) -> Arc<dyn KpiStore>;

    fn db_schema(&self) -> Option<String> {
        None
    }

    /// Stage metadata; an empty catalog fails controller construction.
    fn stages(&self) -> &StageCatalog;

    fn schedules(&self) -> Vec<Schedule> {
        Vec::new()
    }

    fn data_items(&self) -> DataItemCatalog {
        DataItemCatalog::new()
    }

    /// Granularity per data item, for the writer's table layout.
    fn grains(&self) -> HashMap<String, Granularity> {
        HashMap::new()
    }

    /// Columns the projection trimmer must never remove from a data source.
    fn mandatory_columns(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether a longer due schedule subsumes shorter ones in the same tick.
    fn is_schedule_progressive(&self) -> bool {
        true
    }

    /// Extraction chunk size as a frequency string; `None` uses the
    /// controller default of seven days.
    fn chunk_size(&self) -> Option<String> {
        None
    }

    /// Earliest timestamp with data, consulted when a schedule has no start
    /// date of its own.
    async fn early_timestamp(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Hook to snap a chunk start onto a calendar boundary.
    fn adjusted_start_date(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start
    }

    fn entity_filter(&self) -> Option<Vec<String>> {
        None
    }

    fn start_ts_override(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn end_ts_override(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Receive properties contributed by metadata-provider stages.
    fn absorb_params(&self, _params: serde_json::Map<String, serde_json::Value>) {}

    /// Receive the custom-calendar stage selected during a spec build.
    fn register_custom_calendar(&self, _calendar: Arc<dyn Stage>) {}
}
