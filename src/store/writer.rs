//! Bulk writer for derived data items.
//!
//! The writer is an ordinary stage appended to every job-spec phase. It
//! inspects each frame column's data-item metadata, groups columns by their
//! destination table, deletes the extraction window and bulk-inserts typed
//! rows into the narrow KPI value schema (`KEY`, dimensions, `VALUE_B/N/S/T`,
//! `LAST_UPDATE`). Delete-then-insert makes re-running a chunk idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use super::{KpiStore, ValueRow};
use crate::error::CoreError;
use crate::frame::{Frame, IndexKey, Value};
use crate::payload::{DataItemCatalog, Granularity};
use crate::stage::{Stage, StageContext, StageOutput};

pub const ENTITY_ID_COLUMN: &str = "ENTITY_ID";
pub const TIMESTAMP_COLUMN: &str = "TIMESTAMP";

pub const DEFAULT_BATCH_ROWS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Boolean,
    Number,
    Literal,
    Timestamp,
}

impl ColumnType {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "BOOLEAN" => Some(ColumnType::Boolean),
            "NUMBER" => Some(ColumnType::Number),
            "LITERAL" => Some(ColumnType::Literal),
            "TIMESTAMP" => Some(ColumnType::Timestamp),
            _ => None,
        }
    }
}

/// Where a table's dimension values come from: `index_positions` selects the
/// row-index parts per dimension; `None` means a single-part index taken
/// as-is.
#[derive(Debug, Clone, PartialEq)]
struct TableTarget {
    dimensions: Vec<String>,
    index_positions: Option<Vec<usize>>,
}

pub struct ValueWriter {
    name: String,
    store: Arc<dyn KpiStore>,
    data_items: DataItemCatalog,
    grains: HashMap<String, Granularity>,
    batch_rows: usize,
}

impl ValueWriter {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn KpiStore>,
        data_items: DataItemCatalog,
        grains: HashMap<String, Granularity>,
        batch_rows: usize,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            data_items,
            grains,
            batch_rows: batch_rows.max(1),
        }
    }

    /// Columns of the frame that map to a persistable data item, with their
    /// resolved type and destination table.
    fn column_properties(&self, frame: &Frame) -> IndexMap<String, (ColumnType, String)> {
        let mut props = IndexMap::new();
        for (name, _) in frame.columns() {
            let Some(meta) = self.data_items.get(name) else {
                debug!(item = %name, "column does not correspond to a data item; not persisted");
                continue;
            };
            if meta.transient {
                debug!(item = %name, "data item is transient; not persisted");
                continue;
            }
            let Some(table) = meta.source_table.as_deref() else {
                warn!(item = %name, "no table name defined for data item; not persisted");
                continue;
            };
            let Some(raw_type) = meta.column_type.as_deref() else {
                warn!(item = %name, "no data type defined for data item; not persisted");
                continue;
            };
            let column_type = ColumnType::parse(raw_type).unwrap_or_else(|| {
                warn!(
                    item = %name,
                    column_type = raw_type,
                    "unknown data item type; writing as LITERAL"
                );
                ColumnType::Literal
            });
            props.insert(name.clone(), (column_type, table.to_string()));
        }
        props
    }

    /// One target per destination table, derived from the granularity of the
    /// first item routed to it.
    fn table_properties(
        &self,
        frame: &Frame,
        col_props: &IndexMap<String, (ColumnType, String)>,
    ) -> Result<IndexMap<String, TableTarget>, CoreError> {
        let index_names = frame.index_names();
        let position_of: HashMap<&str, usize> = index_names
            .iter()
            .enumerate()
            .map(|(pos, name)| (name.as_str(), pos))
            .collect();

        let mut targets: IndexMap<String, TableTarget> = IndexMap::new();
        for (item, (_, table)) in col_props {
            if targets.contains_key(table) {
                continue;
            }
            let grain = self.grains.get(item);
            let dimensions = dimension_columns(grain);

            let index_positions = if index_names.len() <= 1 {
                None
            } else if let Some(grain) = grain {
                let mut positions = Vec::new();
                if grain.entity_id.is_some() {
                    positions.push(0);
                }
                if grain.freq.is_some() {
                    positions.push(usize::from(grain.entity_id.is_some()));
                }
                if let Some(dims) = &grain.dimensions {
                    for dim in dims {
                        let pos = position_of.get(dim.as_str()).copied().ok_or_else(|| {
                            CoreError::WriteFailed {
                                table: table.clone(),
                                source: anyhow::anyhow!(
                                    "grain dimension {dim} is not part of the frame index {index_names:?}"
                                ),
                            }
                        })?;
                        positions.push(pos);
                    }
                }
                Some(positions)
            } else {
                // No grain: the index must be (entity id, timestamp).
                Some(vec![0, 1])
            };

            let produced = index_positions
                .as_ref()
                .map_or(index_names.len(), Vec::len);
            if produced != dimensions.len() {
                return Err(CoreError::WriteFailed {
                    table: table.clone(),
                    source: anyhow::anyhow!(
                        "table expects dimensions {dimensions:?} but the frame index provides {produced} values"
                    ),
                });
            }
            debug!(
                table = %table,
                ?dimensions,
                ?index_positions,
                "resolved value table target"
            );
            targets.insert(table.clone(), TableTarget {
                dimensions,
                index_positions,
            });
        }
        Ok(targets)
    }

    async fn flush(
        &self,
        table: &str,
        target: &TableTarget,
        buffer: &mut Vec<ValueRow>,
    ) -> Result<u64, CoreError> {
        let rows = std::mem::take(buffer);
        let expected = rows.len() as u64;
        let written = self
            .store
            .insert_values(table, &target.dimensions, &rows)
            .await
            .map_err(|source| CoreError::WriteFailed {
                table: table.to_string(),
                source,
            })?;
        if written != expected {
            warn!(
                table,
                written,
                expected,
                "driver reported a different row count than submitted"
            );
        }
        Ok(written)
    }
}

fn dimension_columns(grain: Option<&Granularity>) -> Vec<String> {
    match grain {
        None => vec![ENTITY_ID_COLUMN.to_string(), TIMESTAMP_COLUMN.to_string()],
        Some(grain) => {
            let mut dims = Vec::new();
            if grain.entity_id.is_some() {
                dims.push(ENTITY_ID_COLUMN.to_string());
            }
            if grain.freq.is_some() {
                dims.push(TIMESTAMP_COLUMN.to_string());
            }
            if let Some(extra) = &grain.dimensions {
                dims.extend(extra.iter().cloned());
            }
            dims
        }
    }
}

fn dimension_values(key: &IndexKey, positions: Option<&[usize]>) -> Vec<Value> {
    match positions {
        None => key.to_vec(),
        Some(positions) => positions
            .iter()
            .map(|&pos| key.get(pos).cloned().unwrap_or(Value::Null))
            .collect(),
    }
}

/// Route a cell into exactly one typed value slot.
fn typed_row(item: &str, column_type: ColumnType, value: &Value, dims: Vec<Value>) -> ValueRow {
    let mut row = ValueRow {
        key: item.to_string(),
        dimensions: dims,
        ..ValueRow::default()
    };
    match column_type {
        ColumnType::Boolean => row.value_b = Some(i16::from(value.truthy())),
        ColumnType::Number => row.value_n = value.as_f64().filter(|f| f.is_finite()),
        ColumnType::Literal => row.value_s = Some(value.to_string()),
        ColumnType::Timestamp => row.value_t = value.as_timestamp(),
    }
    row
}

#[async_trait]
impl Stage for ValueWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn produces_output_items(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: StageContext<'_>) -> anyhow::Result<StageOutput> {
        let frame = ctx.frame;
        let end_ts: DateTime<Utc> = ctx
            .end_ts
            .context("the value writer requires an end timestamp")?;
        debug!(
            writer = %self.name,
            start_ts = ?ctx.start_ts,
            %end_ts,
            "writing derived data items for the extraction window"
        );

        let col_props = self.column_properties(frame);
        if col_props.is_empty() {
            warn!("there are no data items that have to be written to the database");
            return Ok(StageOutput::Ack(true));
        }
        info!(
            items = ?col_props.keys().collect::<Vec<_>>(),
            "data items will be written to the database"
        );

        let targets = self.table_properties(frame, &col_props)?;
        for table in targets.keys() {
            let deleted = self
                .store
                .delete_window(table, ctx.start_ts, end_ts)
                .await
                .map_err(|source| CoreError::WriteFailed {
                    table: table.clone(),
                    source,
                })?;
            info!(table = %table, deleted, "old data item values deleted");
        }

        let mut buffers: HashMap<&str, Vec<ValueRow>> = HashMap::new();
        let mut persisted: u64 = 0;
        for row_idx in 0..frame.row_count() {
            for (item, (column_type, table)) in &col_props {
                let Some(value) = frame.cell(row_idx, item) else {
                    continue;
                };
                if value.is_null() {
                    continue;
                }
                let target = &targets[table.as_str()];
                let dims = dimension_values(
                    &frame.index().keys()[row_idx],
                    target.index_positions.as_deref(),
                );
                let buffer = buffers.entry(table.as_str()).or_default();
                buffer.push(typed_row(item, *column_type, value, dims));
                if buffer.len() >= self.batch_rows {
                    persisted += self.flush(table, target, buffer).await?;
                    debug!(table = %table, persisted, "data item values persisted so far");
                }
            }
        }
        for (table, target) in &targets {
            if let Some(buffer) = buffers.get_mut(table.as_str()) {
                if !buffer.is_empty() {
                    persisted += self.flush(table, target, buffer).await?;
                }
            }
        }
        info!(persisted, "total number of persisted data item values");
        Ok(StageOutput::Ack(true))
    }
}
