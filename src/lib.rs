#![warn(clippy::all, clippy::pedantic)]
#![allow(
    // Acceptable for trait naming consistency (e.g., KpiStore, PgKpiStore)
    clippy::module_name_repetitions,

    // Error context via anyhow::Context already provides sufficient documentation
    clippy::missing_errors_doc,

    // Panic paths are invariant checks (column lengths), not part of normal flow
    clippy::missing_panics_doc,

    // Technical identifiers (e.g., KPI, VALUE_N, DB2) don't need markdown formatting
    clippy::doc_markdown,

    // Too noisy: many accessors return useful values but aren't always used
    clippy::must_use_candidate,

    // Named format args reduce readability for long messages with many placeholders
    clippy::uninlined_format_args
)]

//! Embedded KPI job controller.
//!
//! The controller drives an externally supplied *payload* (a bundle of
//! data-producing and data-transforming stages plus metadata) through
//! scheduled, chunked, idempotent executions: evaluate which schedules are
//! due, build a per-run job spec by dependency resolution, retrieve source
//! data in bounded time chunks, auto-merge stage outputs into a growing
//! frame, aggregate per granularity and persist typed values through a
//! delete-then-insert writer, recording completions in a durable job log.

pub mod config;
pub mod error;
pub mod frame;
pub mod payload;
pub mod pipeline;
pub mod scheduler;
pub mod stage;
pub mod store;
pub mod util;

#[cfg(test)]
pub(crate) mod testkit;

pub use config::Settings;
pub use error::CoreError;
pub use payload::Payload;
pub use scheduler::JobController;
