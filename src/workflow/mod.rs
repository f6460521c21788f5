//! Workflow definitions, step operations, run state, and the controller
//! that drives a run through them.

pub mod definition;
pub mod state;
pub mod step;

pub(crate) mod controller;

pub use definition::{
    InputBinding, StepMode, StepRegistry, StepSpec, ValidationError, WorkflowBuilder,
    WorkflowDefinition,
};
pub use state::{RunState, RunStatus};
pub use step::{OperationContext, OperationContextError, StepError, StepOperation, decode_arguments};
