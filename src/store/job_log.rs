//! Durable record of completed schedule executions.
//!
//! The job log is what makes executions idempotent across controller
//! restarts: checkpoint-driven schedules resume from their last completion
//! and every other schedule derives its next due date from it.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{JobLogRecord, KpiStore};
use crate::error::CoreError;

pub struct JobLog {
    store: Arc<dyn KpiStore>,
    table: String,
    object_type: String,
    object_name: String,
}

impl JobLog {
    /// Bind the log to its table, creating the table when absent. A store
    /// that cannot provide the table makes the whole job unusable.
    pub async fn ensure(
        store: Arc<dyn KpiStore>,
        table: impl Into<String>,
        object_type: impl Into<String>,
        object_name: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let table = table.into();
        store
            .ensure_job_log(&table)
            .await
            .map_err(|source| CoreError::JobLogUnavailable { source })?;
        Ok(Self {
            store,
            table,
            object_type: object_type.into(),
            object_name: object_name.into(),
        })
    }

    pub async fn last_execution(
        &self,
        schedule: &str,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        self.store
            .last_execution(&self.table, &self.object_type, &self.object_name, schedule)
            .await
            .context("failed to read last execution date from the job log")
    }

    pub async fn record_completion(
        &self,
        schedule: &str,
        timestamp: DateTime<Utc>,
        trace: Option<String>,
    ) -> anyhow::Result<()> {
        self.store
            .record_completion(
                &self.table,
                &JobLogRecord {
                    object_type: self.object_type.clone(),
                    object_name: self.object_name.clone(),
                    schedule: schedule.to_string(),
                    last_update: timestamp,
                    trace,
                },
            )
            .await
            .context("failed to append to the job log")?;
        debug!(
            job = %self.object_name,
            schedule,
            %timestamp,
            "completed execution recorded in the job log"
        );
        Ok(())
    }
}
