//! Error taxonomy for the job controller core.
//!
//! Construction-time failures (`PayloadMetadataMissing`, `JobLogUnavailable`)
//! abort the job. Spec-build failures abort the schedule. Merge and write
//! failures are fatal for the chunk in flight only; the controller logs them
//! and moves on to the next chunk.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(
        "the payload does not provide any stage metadata; a stage catalog \
         with at least one entry is required to build job specs"
    )]
    PayloadMetadataMissing,

    #[error(
        "simple aggregator {stage} must take exactly one input item and \
         produce exactly one output item (inputs: {inputs:?}, outputs: {outputs:?})"
    )]
    BadAggregatorShape {
        stage: String,
        inputs: Vec<String>,
        outputs: Vec<String>,
    },

    #[error(
        "cannot auto-merge a mapping value; convert it to a frame or series \
         with named index parts before returning it from a stage"
    )]
    UnsupportedMergeInput,

    #[error(
        "no merge strategy applies: incoming index names {actual:?} do not \
         match the frame index names {expected:?}, and are not a single-part \
         lookup key present in the frame"
    )]
    UnmergeableShape {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error(
        "cannot shape a {rows}x{cols} array onto a frame with {frame_rows} \
         rows and {expected} target columns"
    )]
    GridShapeMismatch {
        rows: usize,
        cols: usize,
        frame_rows: usize,
        expected: usize,
    },

    #[error("merge postcondition failed: columns {missing:?} were promised but are absent after merge")]
    MergePostconditionFailed { missing: Vec<String> },

    #[error("failed writing derived values to table {table}")]
    WriteFailed {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("job log is unavailable")]
    JobLogUnavailable {
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid frequency string {value:?}")]
    InvalidFrequency { value: String },
}
