//! Auto-merge of stage results into the running frame.
//!
//! A stage does not need to know how to combine its output with prior state;
//! the merger inspects the shape of the incoming value and picks a strategy:
//! `skip`, `replace`, `slice` (same index), `outer` (same index names) or
//! `lookup` (single-part index resolvable against the frame). A constants map
//! registered while the frame was still empty is re-applied whenever a merge
//! can introduce rows.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use tracing::debug;

use super::{Frame, FrameIndex, IndexKey, Series, Value};
use crate::error::CoreError;

const RIGHT_SUFFIX: &str = "_new_";

/// A stage result in a shape the merger understands.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeInput {
    Frame(Frame),
    Series(Series),
    /// Row-major 2-D array adopting the frame's index.
    Grid(Vec<Vec<Value>>),
    Scalar(Value),
    /// Mappings are always rejected; stages must deliver indexed data.
    Mapping(IndexMap<String, Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Skip,
    Replace,
    Slice,
    Outer,
    Lookup,
}

/// Merge state for one chunk: the running frame plus constants to re-apply.
#[derive(Debug, Default)]
pub struct DataMerge {
    frame: Frame,
    constants: IndexMap<String, Value>,
}

impl DataMerge {
    pub fn new(frame: Option<Frame>, constants: Option<IndexMap<String, Value>>) -> Self {
        Self {
            frame: frame.unwrap_or_default(),
            constants: constants.unwrap_or_default(),
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }

    pub fn constants(&self) -> &IndexMap<String, Value> {
        &self.constants
    }

    /// Register a constant and write it through to the frame.
    pub fn add_constant(&mut self, name: &str, value: Value) {
        self.frame.fill_column(name, &value);
        self.constants.insert(name.to_string(), value);
    }

    /// Re-apply every registered constant over all current rows.
    pub fn apply_constants(&mut self) {
        for (name, value) in &self.constants {
            self.frame.fill_column(name, value);
        }
    }

    /// Drop both the frame and the constants.
    pub fn clear(&mut self) {
        self.frame = Frame::new();
        self.constants.clear();
    }

    /// Combine a stage result with the running frame. `col_names` is the list
    /// of data items the stage promised to deliver; after the merge each of
    /// them must be resolvable as a column or index part.
    pub fn merge(
        &mut self,
        input: MergeInput,
        col_names: &[String],
        force_overwrite: bool,
    ) -> Result<(), CoreError> {
        debug!(
            frame_columns = ?self.frame.column_names(),
            frame_index = ?self.frame.index_names(),
            constants = ?self.constants.keys().collect::<Vec<_>>(),
            "auto-merge invoked"
        );
        match input {
            MergeInput::Mapping(_) => return Err(CoreError::UnsupportedMergeInput),
            MergeInput::Frame(df) => self.merge_frame(df, col_names, force_overwrite)?,
            MergeInput::Series(series) => {
                let frame = series.into_frame(col_names.first().map(String::as_str));
                self.merge_frame(frame, col_names, force_overwrite)?;
            }
            MergeInput::Grid(rows) if col_names.len() > 1 => {
                let frame = self.grid_to_frame(rows, col_names)?;
                self.merge_frame(frame, col_names, force_overwrite)?;
            }
            MergeInput::Grid(rows) => {
                let values = rows
                    .into_iter()
                    .map(|mut row| row.pop().unwrap_or(Value::Null))
                    .collect();
                self.merge_column_values(values, col_names)?;
            }
            MergeInput::Scalar(value) if col_names.len() > 1 => {
                let frame = self.broadcast_to_frame(&value, col_names);
                self.merge_frame(frame, col_names, force_overwrite)?;
            }
            MergeInput::Scalar(value) => self.merge_scalar(value, col_names),
        }

        if !self.frame.is_empty() {
            let names = self.frame.all_names();
            let missing: Vec<String> = col_names
                .iter()
                .filter(|c| !names.contains(*c))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(CoreError::MergePostconditionFailed { missing });
            }
        }
        Ok(())
    }

    fn merge_frame(
        &mut self,
        mut df: Frame,
        col_names: &[String],
        force_overwrite: bool,
    ) -> Result<(), CoreError> {
        if !col_names.is_empty() && col_names.len() == df.column_names().len() {
            df.rename_columns(col_names);
        }

        let strategy = self.select_strategy(&df, col_names, force_overwrite)?;
        debug!(
            ?strategy,
            incoming_columns = ?df.column_names(),
            incoming_index = ?df.index_names(),
            "merge strategy selected"
        );
        match strategy {
            Strategy::Skip => {
                for name in col_names {
                    if !self.frame.has_column(name) {
                        self.frame.add_null_column(name);
                    }
                }
            }
            Strategy::Replace => {
                self.frame = df;
                self.apply_constants();
            }
            Strategy::Slice => {
                let columns: Vec<(String, Vec<Value>)> = df
                    .columns()
                    .map(|(n, v)| (n.clone(), v.clone()))
                    .collect();
                for (name, values) in columns {
                    self.frame.set_column(&name, values);
                }
            }
            Strategy::Outer => self.outer_join(df),
            Strategy::Lookup => self.lookup_join(&df),
        }
        Ok(())
    }

    fn select_strategy(
        &self,
        df: &Frame,
        col_names: &[String],
        force_overwrite: bool,
    ) -> Result<Strategy, CoreError> {
        if df.is_empty() {
            return Ok(Strategy::Skip);
        }
        if self.frame.is_empty() {
            return Ok(Strategy::Replace);
        }
        if df.index().values_equal(self.frame.index()) {
            if !force_overwrite && col_names.iter().all(|c| self.frame.has_column(c)) {
                debug!("merge already took place; skipping (force_overwrite bypasses this)");
                return Ok(Strategy::Skip);
            }
            return Ok(Strategy::Slice);
        }
        let obj_names = df.index_names();
        if obj_names == self.frame.index_names() {
            return Ok(Strategy::Outer);
        }
        if obj_names.len() == 1 && self.frame.all_names().contains(&obj_names[0]) {
            return Ok(Strategy::Lookup);
        }
        Err(CoreError::UnmergeableShape {
            expected: self.frame.index_names(),
            actual: obj_names,
        })
    }

    /// Full outer join on the row index; colliding columns come in under a
    /// suffix and are coalesced away. New rows get the constants re-applied.
    fn outer_join(&mut self, right: Frame) {
        let left = std::mem::take(&mut self.frame);
        let left_keys: HashSet<IndexKey> = left.index().keys().iter().cloned().collect();
        let mut union_keys: Vec<IndexKey> = left.index().keys().to_vec();
        for key in right.index().keys() {
            if !left_keys.contains(key) {
                union_keys.push(key.clone());
            }
        }
        let right_rows: HashMap<IndexKey, usize> = right
            .index()
            .keys()
            .iter()
            .enumerate()
            .map(|(row, key)| (key.clone(), row))
            .collect();

        let rows = union_keys.len();
        let mut merged =
            Frame::with_index(FrameIndex::new(left.index_names(), union_keys.clone()));
        for (name, values) in left.columns() {
            let mut column = values.clone();
            column.resize(rows, Value::Null);
            merged.set_column(name, column);
        }
        for (name, values) in right.columns() {
            let target = if merged.has_column(name) {
                format!("{name}{RIGHT_SUFFIX}")
            } else {
                name.clone()
            };
            let column = union_keys
                .iter()
                .map(|key| {
                    right_rows
                        .get(key)
                        .map_or(Value::Null, |&row| values[row].clone())
                })
                .collect();
            merged.set_column(&target, column);
        }

        self.frame = merged;
        self.coalesce(RIGHT_SUFFIX);
        self.apply_constants();
    }

    /// Left join against a single-part lookup index: the frame index moves to
    /// columns, the lookup key resolves row by row, and the original index is
    /// restored afterwards.
    fn lookup_join(&mut self, right: &Frame) {
        let original_index = self.frame.index_names();
        let key_name = right.index_names()[0].clone();
        self.frame.reset_index();
        let key_column: Vec<Value> = self
            .frame
            .column(&key_name)
            .map(<[Value]>::to_vec)
            .unwrap_or_default();
        let right_rows: HashMap<Value, usize> = right
            .index()
            .keys()
            .iter()
            .enumerate()
            .map(|(row, key)| (key[0].clone(), row))
            .collect();

        let right_columns: Vec<(String, Vec<Value>)> = right
            .columns()
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect();
        for (name, values) in right_columns {
            let target = if self.frame.has_column(&name) {
                format!("{name}{RIGHT_SUFFIX}")
            } else {
                name
            };
            let column = key_column
                .iter()
                .map(|key| {
                    right_rows
                        .get(key)
                        .map_or(Value::Null, |&row| values[row].clone())
                })
                .collect();
            self.frame.set_column(&target, column);
        }
        self.coalesce(RIGHT_SUFFIX);
        self.frame.set_index(&original_index);
    }

    /// Fill nulls in each base column from its suffixed variant, then drop
    /// the variant.
    fn coalesce(&mut self, suffix: &str) {
        for name in self.frame.column_names() {
            if name.ends_with(suffix) {
                continue;
            }
            let shadow = format!("{name}{suffix}");
            if !self.frame.has_column(&shadow) {
                continue;
            }
            let filled: Vec<Value> = {
                let base = self.frame.column(&name).unwrap_or_default();
                let over = self.frame.column(&shadow).unwrap_or_default();
                base.iter()
                    .zip(over)
                    .map(|(b, o)| if b.is_null() { o.clone() } else { b.clone() })
                    .collect()
            };
            self.frame.set_column(&name, filled);
            self.frame.drop_column(&shadow);
        }
    }

    /// A scalar delivered into an empty frame becomes a constant; otherwise
    /// it broadcasts into the named column.
    fn merge_scalar(&mut self, value: Value, col_names: &[String]) {
        let name = col_names.first().map_or("", String::as_str);
        if self.frame.is_empty() {
            self.add_constant(name, value);
        } else {
            self.frame.fill_column(name, &value);
        }
    }

    /// A one-column array must line up with the current rows.
    fn merge_column_values(
        &mut self,
        values: Vec<Value>,
        col_names: &[String],
    ) -> Result<(), CoreError> {
        if values.is_empty() {
            return Ok(());
        }
        if values.len() != self.frame.row_count() {
            return Err(CoreError::GridShapeMismatch {
                rows: values.len(),
                cols: 1,
                frame_rows: self.frame.row_count(),
                expected: col_names.len().max(1),
            });
        }
        let name = col_names.first().map_or("", String::as_str);
        self.frame.set_column(name, values);
        Ok(())
    }

    fn grid_to_frame(
        &self,
        rows: Vec<Vec<Value>>,
        col_names: &[String],
    ) -> Result<Frame, CoreError> {
        let mismatch = rows.iter().any(|row| row.len() != col_names.len());
        if mismatch || rows.len() != self.frame.row_count() {
            return Err(CoreError::GridShapeMismatch {
                rows: rows.len(),
                cols: rows.first().map_or(0, Vec::len),
                frame_rows: self.frame.row_count(),
                expected: col_names.len(),
            });
        }
        let mut frame = Frame::with_index(self.frame.index().clone());
        for (part, name) in col_names.iter().enumerate() {
            let column = rows.iter().map(|row| row[part].clone()).collect();
            frame.set_column(name, column);
        }
        Ok(frame)
    }

    fn broadcast_to_frame(&self, value: &Value, col_names: &[String]) -> Frame {
        let mut frame = Frame::with_index(self.frame.index().clone());
        for name in col_names {
            frame.fill_column(name, value);
        }
        frame
    }
}
