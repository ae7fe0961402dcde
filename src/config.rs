//! Controller settings.
//!
//! Everything has a sensible default so an embedder can pass
//! `Settings::default()`; `from_env` overlays the `KPI_*` environment
//! variables for deployments that configure the worker that way.

use std::env;

use chrono::Duration;
use thiserror::Error;

use crate::store::writer::DEFAULT_BATCH_ROWS;
use crate::util::freq::parse_freq;

pub const DEFAULT_JOB_LOG_TABLE: &str = "job_log";
pub const DEFAULT_CHUNK_SIZE: &str = "7d";
pub const DEFAULT_MAX_RESOLVER_PASSES: usize = 99;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    keep_alive: Option<Duration>,
    job_log_table: String,
    chunk_size: Duration,
    write_batch_rows: usize,
    max_resolver_passes: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            keep_alive: None,
            job_log_table: DEFAULT_JOB_LOG_TABLE.to_string(),
            chunk_size: Duration::days(7),
            write_batch_rows: DEFAULT_BATCH_ROWS,
            max_resolver_passes: DEFAULT_MAX_RESOLVER_PASSES,
        }
    }
}

impl Settings {
    /// Read settings from the environment, falling back to defaults for
    /// anything unset.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when a variable is present but unparsable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        if let Some(value) = read_env("KPI_KEEP_ALIVE") {
            settings.keep_alive = Some(parse_duration_var("KPI_KEEP_ALIVE", &value)?);
        }
        if let Some(value) = read_env("KPI_JOB_LOG_TABLE") {
            settings.job_log_table = value;
        }
        if let Some(value) = read_env("KPI_CHUNK_SIZE") {
            settings.chunk_size = parse_duration_var("KPI_CHUNK_SIZE", &value)?;
        }
        if let Some(value) = read_env("KPI_WRITE_BATCH_ROWS") {
            settings.write_batch_rows = parse_usize_var("KPI_WRITE_BATCH_ROWS", &value)?;
        }
        if let Some(value) = read_env("KPI_MAX_RESOLVER_PASSES") {
            settings.max_resolver_passes =
                parse_usize_var("KPI_MAX_RESOLVER_PASSES", &value)?;
        }
        Ok(settings)
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_job_log_table(mut self, table: impl Into<String>) -> Self {
        self.job_log_table = table.into();
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: Duration) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[must_use]
    pub fn with_write_batch_rows(mut self, rows: usize) -> Self {
        self.write_batch_rows = rows;
        self
    }

    #[must_use]
    pub fn with_max_resolver_passes(mut self, passes: usize) -> Self {
        self.max_resolver_passes = passes;
        self
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive
    }

    pub fn job_log_table(&self) -> &str {
        &self.job_log_table
    }

    /// Fallback chunk size when the payload does not provide one.
    pub fn chunk_size(&self) -> Duration {
        self.chunk_size
    }

    pub fn write_batch_rows(&self) -> usize {
        self.write_batch_rows
    }

    pub fn max_resolver_passes(&self) -> usize {
        self.max_resolver_passes
    }
}

fn read_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_duration_var(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_freq(value).map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

fn parse_usize_var(name: &'static str, value: &str) -> Result<usize, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}
