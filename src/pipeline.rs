//! Per-run pipeline machinery: job-spec building, aggregation collapse and
//! stage execution with auto-merge.

pub mod aggregate;
pub mod executor;
pub mod spec;

pub use spec::{JobSpec, SpecStage, INPUT_LEVEL_PHASE};
