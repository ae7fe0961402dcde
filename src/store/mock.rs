//! In-memory [`KpiStore`] used by unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{JobLogRecord, KpiStore, ValueRow};
use crate::frame::Value;

#[derive(Default)]
pub(crate) struct MockStore {
    pub(crate) state: Mutex<MockState>,
}

#[derive(Default)]
pub(crate) struct MockState {
    pub(crate) job_log: Vec<JobLogRecord>,
    /// Pre-seeded last-execution timestamps keyed by schedule frequency.
    pub(crate) seeded_executions: HashMap<String, DateTime<Utc>>,
    pub(crate) deletes: Vec<(String, Option<DateTime<Utc>>, DateTime<Utc>)>,
    pub(crate) tables: HashMap<String, Vec<ValueRow>>,
    pub(crate) insert_batches: Vec<(String, usize)>,
    pub(crate) fail_inserts_for: Option<String>,
}

impl MockStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn seed_execution(&self, schedule: &str, ts: DateTime<Utc>) {
        self.state
            .lock()
            .unwrap()
            .seeded_executions
            .insert(schedule.to_string(), ts);
    }

    pub(crate) fn fail_inserts_for(&self, table: &str) {
        self.state.lock().unwrap().fail_inserts_for = Some(table.to_string());
    }

    pub(crate) fn rows(&self, table: &str) -> Vec<ValueRow> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn completions(&self) -> Vec<JobLogRecord> {
        self.state.lock().unwrap().job_log.clone()
    }

    pub(crate) fn insert_batches(&self) -> Vec<(String, usize)> {
        self.state.lock().unwrap().insert_batches.clone()
    }

    pub(crate) fn deletes(&self) -> Vec<(String, Option<DateTime<Utc>>, DateTime<Utc>)> {
        self.state.lock().unwrap().deletes.clone()
    }

    fn row_in_window(
        row: &ValueRow,
        start_ts: Option<DateTime<Utc>>,
        end_ts: DateTime<Utc>,
    ) -> bool {
        row.dimensions.iter().any(|dim| match dim {
            Value::Timestamp(ts) => start_ts.map_or(true, |s| *ts >= s) && *ts < end_ts,
            _ => false,
        })
    }
}

#[async_trait]
impl KpiStore for MockStore {
    async fn ensure_job_log(&self, _table: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn last_execution(
        &self,
        _table: &str,
        object_type: &str,
        object_name: &str,
        schedule: &str,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().unwrap();
        let recorded = state
            .job_log
            .iter()
            .filter(|r| {
                r.object_type == object_type
                    && r.object_name == object_name
                    && r.schedule == schedule
            })
            .map(|r| r.last_update)
            .max();
        let seeded = state.seeded_executions.get(schedule).copied();
        Ok(recorded.max(seeded))
    }

    async fn record_completion(&self, _table: &str, record: &JobLogRecord) -> anyhow::Result<()> {
        self.state.lock().unwrap().job_log.push(record.clone());
        Ok(())
    }

    async fn delete_window(
        &self,
        table: &str,
        start_ts: Option<DateTime<Utc>>,
        end_ts: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let mut state = self.state.lock().unwrap();
        state
            .deletes
            .push((table.to_string(), start_ts, end_ts));
        let Some(rows) = state.tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| !Self::row_in_window(row, start_ts, end_ts));
        Ok((before - rows.len()) as u64)
    }

    async fn insert_values(
        &self,
        table: &str,
        _dimensions: &[String],
        rows: &[ValueRow],
    ) -> anyhow::Result<u64> {
        let mut state = self.state.lock().unwrap();
        if state.fail_inserts_for.as_deref() == Some(table) {
            bail!("simulated insert failure for table {table}");
        }
        state
            .insert_batches
            .push((table.to_string(), rows.len()));
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }
}
