//! Per-session execution pipeline.
//!
//! Data flow:
//! ```text
//! session stdin  → subprocess stdin          (background task)
//! subprocess stderr → session diagnostics    (background task)
//! subprocess stdout → session stdout         (pipeline task, awaited)
//! ```

pub mod copy;
pub mod executor;
pub mod types;

pub use copy::{RelayOutcome, StreamDirection, StreamEnd, copy_stream};
pub use executor::{Executor, INTERACTIVE_REJECTION};
pub use types::{
    Completion, ExecOutcome, ExecSession, ExitStatusPolicy, FAILURE_STATUS, InvocationState,
    PipelineConfig,
};
