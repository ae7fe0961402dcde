//! Persistence layer.
//!
//! All durable state (the job log and the KPI value tables) goes through
//! the [`KpiStore`] trait so the controller can run against Postgres in
//! production and against an in-memory mock in tests. The payload owns the
//! store; the job log and the value writer share it.

pub mod job_log;
pub mod pg;
pub mod writer;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::frame::Value;

pub use pg::PgKpiStore;

/// One completed execution of a schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct JobLogRecord {
    pub object_type: String,
    pub object_name: String,
    pub schedule: String,
    pub last_update: DateTime<Utc>,
    pub trace: Option<String>,
}

/// One derived value routed to a KPI value table: the item name, the
/// dimension values from the row index, and the value in exactly one of the
/// four typed slots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueRow {
    pub key: String,
    pub dimensions: Vec<Value>,
    pub value_b: Option<i16>,
    pub value_n: Option<f64>,
    pub value_s: Option<String>,
    pub value_t: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait KpiStore: Send + Sync {
    /// Create the job-log table when absent.
    async fn ensure_job_log(&self, table: &str) -> anyhow::Result<()>;

    /// Latest completion timestamp for `(object_type, object_name, schedule)`.
    async fn last_execution(
        &self,
        table: &str,
        object_type: &str,
        object_name: &str,
        schedule: &str,
    ) -> anyhow::Result<Option<DateTime<Utc>>>;

    async fn record_completion(&self, table: &str, record: &JobLogRecord) -> anyhow::Result<()>;

    /// Delete one extraction window from a KPI value table. A missing start
    /// leaves the lower bound open.
    async fn delete_window(
        &self,
        table: &str,
        start_ts: Option<DateTime<Utc>>,
        end_ts: DateTime<Utc>,
    ) -> anyhow::Result<u64>;

    /// Bulk-insert one batch of typed value rows; returns the number of rows
    /// the driver reports as written.
    async fn insert_values(
        &self,
        table: &str,
        dimensions: &[String],
        rows: &[ValueRow],
    ) -> anyhow::Result<u64>;
}
