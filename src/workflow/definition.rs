//! Workflow definitions: the ordered step list a run executes, plus the
//! registry binding step names to their operations.
//!
//! Definitions are declarative and validated once at build time, before any
//! run starts or any event is emitted.

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::state::RunState;
use super::step::StepOperation;
use crate::fanout::SegmentTask;

/// Where a step's arguments come from.
///
/// Chaining is explicit: a step names the prior step and field it consumes,
/// and a missing source fails the run loudly instead of falling back to a
/// guessed value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum InputBinding {
    /// The run's initial input, unchanged.
    RunInput,
    /// A field of a named prior step's output, addressed by JSON pointer.
    /// An empty pointer selects the whole output.
    Output { step: String, pointer: String },
    /// Object mapping every prior step name to its full output.
    AllOutputs,
}

/// How a step executes: one operation call, or one call per item of an
/// input array with isolated failures.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StepMode {
    Single,
    Batch {
        /// Escalate to a run failure when any item fails after the batch
        /// settles. Without it, partial failure is reported in the
        /// aggregate and the run continues.
        all_or_nothing: bool,
    },
}

/// Description of one step of a workflow.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepSpec {
    pub name: String,
    pub requires_approval: bool,
    pub mode: StepMode,
    pub input: InputBinding,
}

impl StepSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires_approval: false,
            mode: StepMode::Single,
            input: InputBinding::RunInput,
        }
    }

    /// Require a human decision before this step executes.
    #[must_use]
    pub fn gated(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Run this step as a fan-out batch over an input array.
    #[must_use]
    pub fn batch(mut self, all_or_nothing: bool) -> Self {
        self.mode = StepMode::Batch { all_or_nothing };
        self
    }

    #[must_use]
    pub fn with_input(mut self, input: InputBinding) -> Self {
        self.input = input;
        self
    }

    /// Convenience for chaining onto a prior step's output field.
    #[must_use]
    pub fn chained(self, step: impl Into<String>, pointer: impl Into<String>) -> Self {
        self.with_input(InputBinding::Output {
            step: step.into(),
            pointer: pointer.into(),
        })
    }

    /// Resolve this step's arguments from the run input and prior outputs.
    pub fn resolve_input(
        &self,
        run_input: &Value,
        state: &RunState,
    ) -> Result<Value, ValidationError> {
        match &self.input {
            InputBinding::RunInput => Ok(run_input.clone()),
            InputBinding::Output { step, pointer } => {
                let output =
                    state
                        .output(step)
                        .ok_or_else(|| ValidationError::MissingChainedOutput {
                            step: self.name.clone(),
                            source: step.clone(),
                        })?;
                output
                    .pointer(pointer)
                    .cloned()
                    .ok_or_else(|| ValidationError::MissingChainedField {
                        step: self.name.clone(),
                        source: step.clone(),
                        pointer: pointer.clone(),
                    })
            }
            InputBinding::AllOutputs => {
                let mut map = Map::new();
                for (name, output) in state.outputs() {
                    map.insert(name.to_string(), output.clone());
                }
                Ok(Value::Object(map))
            }
        }
    }

    /// Split resolved batch arguments into segment tasks.
    ///
    /// Item ids come from each element's `"id"` string field when present,
    /// falling back to the element's index.
    pub fn segment_tasks(&self, arguments: &Value) -> Result<Vec<SegmentTask>, ValidationError> {
        let items = arguments
            .as_array()
            .ok_or_else(|| ValidationError::BatchInputNotArray {
                step: self.name.clone(),
            })?;
        Ok(items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let item_id = item
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| index.to_string());
                SegmentTask::new(item_id, item.clone())
            })
            .collect())
    }
}

/// Ordered, validated list of steps.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowDefinition {
    pub name: String,
    steps: Vec<StepSpec>,
}

impl WorkflowDefinition {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }
}

/// Builder validating the definition before it can be run.
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<StepSpec>,
}

impl WorkflowBuilder {
    #[must_use]
    pub fn step(mut self, spec: StepSpec) -> Self {
        self.steps.push(spec);
        self
    }

    /// Validate and freeze the definition.
    ///
    /// Checks that the workflow is non-empty, step names are unique, and
    /// every chained binding references a step defined earlier in the list.
    pub fn build(self) -> Result<WorkflowDefinition, ValidationError> {
        if self.steps.is_empty() {
            return Err(ValidationError::EmptyWorkflow {
                workflow: self.name,
            });
        }

        let mut seen: Vec<&str> = Vec::with_capacity(self.steps.len());
        for spec in &self.steps {
            if seen.contains(&spec.name.as_str()) {
                return Err(ValidationError::DuplicateStep {
                    step: spec.name.clone(),
                });
            }
            if let InputBinding::Output { step: source, .. } = &spec.input {
                if !seen.contains(&source.as_str()) {
                    return Err(ValidationError::ChainedStepNotPrior {
                        step: spec.name.clone(),
                        source: source.clone(),
                    });
                }
            }
            seen.push(&spec.name);
        }

        Ok(WorkflowDefinition {
            name: self.name,
            steps: self.steps,
        })
    }
}

/// Registry binding step names to the operations that perform them.
#[derive(Clone, Default)]
pub struct StepRegistry {
    operations: FxHashMap<String, Arc<dyn StepOperation>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(
        mut self,
        name: impl Into<String>,
        operation: Arc<dyn StepOperation>,
    ) -> Self {
        self.operations.insert(name.into(), operation);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepOperation>> {
        self.operations.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }
}

/// Definition and input-shape failures, raised before or during argument
/// resolution and always before the affected step performs external work.
#[derive(Debug, Error, Diagnostic)]
pub enum ValidationError {
    #[error("workflow {workflow} has no steps")]
    #[diagnostic(code(greenlight::definition::empty_workflow))]
    EmptyWorkflow { workflow: String },

    #[error("duplicate step name: {step}")]
    #[diagnostic(code(greenlight::definition::duplicate_step))]
    DuplicateStep { step: String },

    #[error("step {step} has no registered operation")]
    #[diagnostic(
        code(greenlight::definition::unknown_operation),
        help("Register an operation under this name before starting the run.")
    )]
    UnknownOperation { step: String },

    #[error("step {step} chains from {source}, which is not an earlier step")]
    #[diagnostic(
        code(greenlight::definition::chained_step_not_prior),
        help("A step may only consume output from steps defined before it.")
    )]
    ChainedStepNotPrior { step: String, r#source: String },

    #[error("step {step} needs output of {source}, which has not produced any")]
    #[diagnostic(code(greenlight::definition::missing_chained_output))]
    MissingChainedOutput { step: String, r#source: String },

    #[error("step {step} needs field {pointer} of {source}'s output, which is absent")]
    #[diagnostic(
        code(greenlight::definition::missing_chained_field),
        help("The upstream step settled without the expected field. There is no fallback.")
    )]
    MissingChainedField {
        step: String,
        r#source: String,
        pointer: String,
    },

    #[error("step {step} is a batch step but its resolved input is not an array")]
    #[diagnostic(code(greenlight::definition::batch_input_not_array))]
    BatchInputNotArray { step: String },
}
