//! Run-level error taxonomy.
//!
//! Validation fails fast before a run does any work; gate errors affect only
//! the deciding caller; step execution failures are fatal to their run; item
//! failures stay inside the batch aggregate unless the step is marked
//! all-or-nothing.

use miette::Diagnostic;
use thiserror::Error;

use crate::approval::GateError;
use crate::workflow::definition::ValidationError;
use crate::workflow::step::StepError;

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Gate(#[from] GateError),

    /// A step's external operation failed. Fatal to the run.
    #[error("step {step} failed: {source}")]
    #[diagnostic(code(greenlight::engine::step_execution))]
    StepExecution {
        step: String,
        #[source]
        source: StepError,
    },

    /// An all-or-nothing batch settled with failures.
    #[error("step {step} batch failed: {failed} of {total} items")]
    #[diagnostic(
        code(greenlight::engine::batch_failed),
        help("Per-item errors are in the batch aggregate published before this failure.")
    )]
    BatchFailed {
        step: String,
        failed: usize,
        total: usize,
    },

    /// A gated step's decision did not arrive within the configured wait.
    #[error("step {step} timed out waiting for approval")]
    #[diagnostic(code(greenlight::engine::approval_timeout))]
    ApprovalTimeout { step: String },

    /// The run task itself died (panic or forced shutdown).
    #[error("run task failed: {0}")]
    #[diagnostic(code(greenlight::engine::runtime))]
    Runtime(String),
}
