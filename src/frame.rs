//! In-memory tabular values.
//!
//! The pipeline carries its working data as a small index-aware frame: an
//! ordered set of named columns over a (possibly multi-part) row index. The
//! type implements exactly what the merge engine, the aggregator and the
//! value writer need; it is not a general dataframe.

pub mod merge;

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use ordered_float::OrderedFloat;

/// A single cell value. `Number` wraps `OrderedFloat` so index keys and
/// group keys are `Eq + Hash + Ord` even when they contain floats.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    Null,
    Bool(bool),
    Number(OrderedFloat<f64>),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn number(v: f64) -> Self {
        Value::Number(OrderedFloat(v))
    }

    pub fn text(v: impl Into<String>) -> Self {
        Value::Text(v.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Loose boolean interpretation, mirroring how derived boolean items
    /// coerce on write: zero, empty and null are false, everything else true.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.into_inner() != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::Timestamp(_) => true,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(n.into_inner()),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{}", n.into_inner()),
            Value::Text(s) => write!(f, "{s}"),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::number(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::text(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

/// One row-index entry: one value per index name.
pub type IndexKey = Vec<Value>;

/// A named, possibly multi-part row index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameIndex {
    names: Vec<String>,
    keys: Vec<IndexKey>,
}

impl FrameIndex {
    pub fn new(names: Vec<String>, keys: Vec<IndexKey>) -> Self {
        debug_assert!(keys.iter().all(|k| k.len() == names.len()));
        Self { names, keys }
    }

    /// An anonymous positional index, as left behind by `reset_index`.
    pub fn unnamed(rows: usize) -> Self {
        Self {
            names: Vec::new(),
            keys: vec![Vec::new(); rows],
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn keys(&self) -> &[IndexKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Index equality by values only; names are compared separately when a
    /// merge strategy needs them.
    pub fn values_equal(&self, other: &FrameIndex) -> bool {
        self.keys == other.keys
    }
}

/// An ordered set of named columns over a shared row index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    index: FrameIndex,
    columns: IndexMap<String, Vec<Value>>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(index: FrameIndex) -> Self {
        Self {
            index,
            columns: IndexMap::new(),
        }
    }

    pub fn from_columns<I, S>(index: FrameIndex, columns: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<Value>)>,
        S: Into<String>,
    {
        let mut frame = Self::with_index(index);
        for (name, values) in columns {
            frame.set_column(&name.into(), values);
        }
        frame
    }

    pub fn row_count(&self) -> usize {
        self.index.len()
    }

    /// A frame with no rows or no columns holds no data.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty() || self.columns.is_empty()
    }

    pub fn index(&self) -> &FrameIndex {
        &self.index
    }

    pub fn index_names(&self) -> Vec<String> {
        self.index.names().to_vec()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Vec<Value>)> {
        self.columns.iter()
    }

    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// All names a merge can resolve against: index parts plus columns.
    pub fn all_names(&self) -> HashSet<String> {
        let mut names: HashSet<String> = self.index.names().iter().cloned().collect();
        names.extend(self.columns.keys().cloned());
        names
    }

    pub fn set_column(&mut self, name: &str, values: Vec<Value>) {
        assert_eq!(
            values.len(),
            self.row_count(),
            "column {name} length must match the frame row count"
        );
        self.columns.insert(name.to_string(), values);
    }

    /// Broadcast a single value over every row of the column.
    pub fn fill_column(&mut self, name: &str, value: &Value) {
        let values = vec![value.clone(); self.row_count()];
        self.columns.insert(name.to_string(), values);
    }

    pub fn add_null_column(&mut self, name: &str) {
        self.fill_column(name, &Value::Null);
    }

    pub fn drop_column(&mut self, name: &str) {
        self.columns.shift_remove(name);
    }

    /// Rename all columns positionally.
    pub fn rename_columns(&mut self, names: &[String]) {
        assert_eq!(
            names.len(),
            self.columns.len(),
            "positional rename requires one name per column"
        );
        let mut renamed = IndexMap::with_capacity(self.columns.len());
        for (name, (_, values)) in names.iter().zip(self.columns.drain(..)) {
            renamed.insert(name.clone(), values);
        }
        self.columns = renamed;
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        self.columns.get(column).and_then(|values| values.get(row))
    }

    /// A copy of the frame restricted to the given row positions.
    pub fn sub_frame(&self, rows: &[usize]) -> Frame {
        let keys = rows
            .iter()
            .map(|&r| self.index.keys()[r].clone())
            .collect();
        let index = FrameIndex::new(self.index.names().to_vec(), keys);
        let mut frame = Frame::with_index(index);
        for (name, values) in &self.columns {
            let sliced = rows.iter().map(|&r| values[r].clone()).collect();
            frame.columns.insert(name.clone(), sliced);
        }
        frame
    }

    /// Move every index part into a leading column and leave an anonymous
    /// positional index behind.
    pub fn reset_index(&mut self) {
        let rows = self.row_count();
        let names = self.index.names().to_vec();
        let keys = std::mem::replace(&mut self.index, FrameIndex::unnamed(rows)).keys;
        let mut columns = IndexMap::with_capacity(names.len() + self.columns.len());
        for (part, name) in names.iter().enumerate() {
            let values = keys.iter().map(|k| k[part].clone()).collect();
            columns.insert(name.clone(), values);
        }
        for (name, values) in self.columns.drain(..) {
            columns.entry(name).or_insert(values);
        }
        self.columns = columns;
    }

    /// Pull the named columns back into the row index, in the given order.
    pub fn set_index(&mut self, names: &[String]) {
        let mut parts = Vec::with_capacity(names.len());
        for name in names {
            let values = self
                .columns
                .shift_remove(name)
                .unwrap_or_else(|| panic!("set_index requires column {name} to be present"));
            parts.push(values);
        }
        let rows = parts.first().map_or_else(|| self.row_count(), Vec::len);
        let keys = (0..rows)
            .map(|r| parts.iter().map(|p| p[r].clone()).collect())
            .collect();
        self.index = FrameIndex::new(names.to_vec(), keys);
    }
}

/// A single named column over its own index, as produced by stages that
/// deliver one data item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub name: Option<String>,
    pub index: FrameIndex,
    pub values: Vec<Value>,
}

impl Series {
    pub fn new(name: Option<String>, index: FrameIndex, values: Vec<Value>) -> Self {
        Self {
            name,
            index,
            values,
        }
    }

    /// Promote to a one-column frame, renaming when a name is supplied.
    pub fn into_frame(self, rename: Option<&str>) -> Frame {
        let name = rename
            .map(str::to_string)
            .or(self.name)
            .unwrap_or_default();
        let mut frame = Frame::with_index(self.index);
        frame.set_column(&name, self.values);
        frame
    }
}
