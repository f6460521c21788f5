//! Step execution framework.
//!
//! External generation operations implement [`StepOperation`]; the engine
//! never sees provider APIs, only this trait and its error type.

use async_trait::async_trait;
use miette::Diagnostic;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::event::RunEvent;

/// One unit of external work performed by a step or a batch item.
///
/// Operations receive the already resolved step arguments and return the
/// step's output. They should be stateless; the context is the only channel
/// back into the run.
///
/// # Error Handling
///
/// Returning `Err` from a single step fails the run. Inside a fan-out batch
/// the same `Err` becomes one failed segment result and siblings proceed.
#[async_trait]
pub trait StepOperation: Send + Sync {
    async fn perform(&self, arguments: Value, ctx: OperationContext)
        -> Result<Value, StepError>;
}

/// Execution context passed to step operations.
///
/// Identifies the run, step, and (for batch items) the item being worked
/// on, and carries the channel for emitting progress onto the run's stream.
#[derive(Clone, Debug)]
pub struct OperationContext {
    pub run_id: String,
    pub step: String,
    /// Set only when the operation runs as one item of a fan-out batch.
    pub item_id: Option<String>,
    pub(crate) event_sender: flume::Sender<RunEvent>,
}

impl OperationContext {
    pub(crate) fn new(
        run_id: impl Into<String>,
        step: impl Into<String>,
        item_id: Option<String>,
        event_sender: flume::Sender<RunEvent>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            step: step.into(),
            item_id,
            event_sender,
        }
    }

    /// Emit a log event enriched with this context's run and step.
    pub fn emit(
        &self,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), OperationContextError> {
        self.event_sender
            .send(RunEvent::log(
                self.run_id.clone(),
                Some(self.step.clone()),
                scope,
                message,
            ))
            .map_err(|_| OperationContextError::StreamUnavailable)
    }
}

/// Decode step arguments into a typed payload, once, at the boundary.
///
/// Operations call this on entry so downstream code works with typed data
/// instead of re-parsing JSON.
pub fn decode_arguments<T: DeserializeOwned>(arguments: &Value) -> Result<T, StepError> {
    serde_json::from_value(arguments.clone()).map_err(StepError::from)
}

/// Errors that can occur when using OperationContext methods.
#[derive(Debug, Error, Diagnostic)]
pub enum OperationContextError {
    /// Event could not be sent because the run's stream is gone.
    #[error("failed to emit event: run stream unavailable")]
    #[diagnostic(
        code(greenlight::step::stream_unavailable),
        help("The run's publisher has shut down. The run may already be terminal.")
    )]
    StreamUnavailable,
}

/// Errors raised by step operations.
///
/// Fatal for a single step; isolated to one segment inside a batch.
#[derive(Debug, Error, Diagnostic)]
pub enum StepError {
    /// Expected input data is missing from the resolved arguments.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(greenlight::step::missing_input),
        help("Check that the chained step produced the required field.")
    )]
    MissingInput { what: &'static str },

    /// External provider or service error.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(greenlight::step::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    #[diagnostic(code(greenlight::step::serde_json))]
    Serde(#[from] serde_json::Error),

    /// Arguments were structurally valid JSON but semantically unusable.
    #[error("invalid arguments: {0}")]
    #[diagnostic(code(greenlight::step::invalid_arguments))]
    InvalidArguments(String),

    /// Run stream communication error.
    #[error("event stream error: {0}")]
    #[diagnostic(code(greenlight::step::event_stream))]
    Emit(#[from] OperationContextError),
}
