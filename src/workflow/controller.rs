//! The per-run state machine.
//!
//! A controller owns exactly one run: it walks the definition's steps in
//! order, consults the approval gate before gated steps, delegates batch
//! steps to the fan-out executor, and publishes every transition on the
//! run's stream. Macro-steps are strictly sequential; concurrency exists
//! only inside a batch.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::instrument;

use super::definition::{StepMode, StepRegistry, StepSpec, ValidationError, WorkflowDefinition};
use super::state::{RunState, RunStatus};
use super::step::{OperationContext, StepOperation};
use crate::approval::{ApprovalGate, Decision};
use crate::audit::AuditSink;
use crate::config::ApprovalWaitPolicy;
use crate::error::EngineError;
use crate::event::{RunEmitter, RunEvent, RunPublisher, TerminalStatus};
use crate::fanout::{self, FanOutOptions};

pub(crate) struct RunController {
    pub(crate) run_id: String,
    pub(crate) definition: Arc<WorkflowDefinition>,
    pub(crate) registry: Arc<StepRegistry>,
    pub(crate) gate: Arc<ApprovalGate>,
    pub(crate) publisher: RunPublisher,
    pub(crate) emitter: RunEmitter,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) status_board: Arc<Mutex<FxHashMap<String, RunStatus>>>,
    pub(crate) wait_policy: ApprovalWaitPolicy,
    pub(crate) concurrency_limit: Option<usize>,
    pub(crate) cancel_rx: watch::Receiver<bool>,
}

enum GateOutcome {
    Proceed(Value),
    Rejected,
    Cancelled,
    Fail(EngineError),
}

enum StepOutcome {
    Output(Value),
    Cancelled,
    Fail(EngineError),
}

impl RunController {
    /// Drive the run to its terminal state.
    ///
    /// Exactly one terminal event is published on every exit path, after
    /// which the stream closes and nothing more is registered or emitted
    /// for this run.
    #[instrument(
        skip_all,
        fields(run_id = %self.run_id, workflow = %self.definition.name)
    )]
    pub(crate) async fn run(
        self,
        input: Value,
        auth_context: Value,
    ) -> Result<RunState, EngineError> {
        let mut state = RunState::new(self.run_id.clone());
        tracing::info!(steps = self.definition.steps().len(), "run started");

        for index in 0..self.definition.steps().len() {
            let spec = &self.definition.steps()[index];

            if self.should_stop() {
                return Ok(self.finalize_cancelled(state, index).await);
            }
            self.update_status(&mut state, RunStatus::Running { step: index });

            let arguments = match spec.resolve_input(&input, &state) {
                Ok(arguments) => arguments,
                Err(err) => {
                    return Err(self
                        .finalize_failed(state, index, Some(&spec.name), err.into())
                        .await);
                }
            };

            let arguments = if spec.requires_approval {
                match self
                    .consult_gate(&mut state, index, spec, arguments, &auth_context)
                    .await
                {
                    GateOutcome::Proceed(arguments) => arguments,
                    GateOutcome::Rejected => {
                        return Ok(self.finalize_rejected(state, index, &spec.name).await);
                    }
                    GateOutcome::Cancelled => {
                        return Ok(self.finalize_cancelled(state, index).await);
                    }
                    GateOutcome::Fail(err) => {
                        return Err(self
                            .finalize_failed(state, index, Some(&spec.name), err)
                            .await);
                    }
                }
            } else {
                arguments
            };

            let output = match self.execute_step(spec, arguments).await {
                StepOutcome::Output(output) => output,
                StepOutcome::Cancelled => {
                    return Ok(self.finalize_cancelled(state, index).await);
                }
                StepOutcome::Fail(err) => {
                    return Err(self
                        .finalize_failed(state, index, Some(&spec.name), err)
                        .await);
                }
            };

            state.record_output(&spec.name, output.clone());
            if let Err(err) = self
                .audit
                .record_step_output(&self.run_id, &spec.name, &output)
                .await
            {
                tracing::warn!(step = %spec.name, error = %err, "audit sink failed");
            }
            self.emit(RunEvent::step_result(&self.run_id, &spec.name, output));
            tracing::debug!(step = %spec.name, "step completed");
        }

        Ok(self.finalize_completed(state).await)
    }

    /// Register the step with the gate, suspend, and wait for the decision.
    async fn consult_gate(
        &self,
        state: &mut RunState,
        index: usize,
        spec: &StepSpec,
        arguments: Value,
        auth_context: &Value,
    ) -> GateOutcome {
        let request = match self.gate.register(
            &self.run_id,
            &spec.name,
            arguments.clone(),
            auth_context.clone(),
        ) {
            Ok(request) => request,
            Err(err) => return GateOutcome::Fail(err.into()),
        };

        self.emit(RunEvent::approval_required(
            &self.run_id,
            &request.id,
            &spec.name,
            arguments,
        ));
        self.update_status(&mut *state, RunStatus::AwaitingApproval {
            step: index,
            approval_id: request.id.clone(),
        });
        tracing::info!(
            step = %spec.name,
            approval_id = %request.id,
            "run suspended awaiting approval"
        );

        let mut cancel = self.cancel_rx.clone();
        let decision = tokio::select! {
            decision = self.wait_for_decision(&request.id, &spec.name) => decision,
            _ = cancelled(&mut cancel) => {
                self.gate.remove(&request.id);
                return GateOutcome::Cancelled;
            }
        };

        match decision {
            Ok(Decision::Approved { arguments }) => GateOutcome::Proceed(arguments),
            Ok(Decision::Rejected) => GateOutcome::Rejected,
            Err(err) => {
                // Timed-out requests are consumed; nothing will wait on
                // them again.
                self.gate.remove(&request.id);
                GateOutcome::Fail(err)
            }
        }
    }

    async fn wait_for_decision(
        &self,
        approval_id: &str,
        step: &str,
    ) -> Result<Decision, EngineError> {
        match self.wait_policy {
            ApprovalWaitPolicy::KeepWaiting => self
                .gate
                .await_decision(approval_id)
                .await
                .map_err(EngineError::from),
            ApprovalWaitPolicy::FailAfter(limit) => {
                match tokio::time::timeout(limit, self.gate.await_decision(approval_id)).await {
                    Ok(decision) => decision.map_err(EngineError::from),
                    Err(_) => Err(EngineError::ApprovalTimeout {
                        step: step.to_string(),
                    }),
                }
            }
        }
    }

    async fn execute_step(&self, spec: &StepSpec, arguments: Value) -> StepOutcome {
        let Some(operation) = self.registry.get(&spec.name) else {
            return StepOutcome::Fail(
                ValidationError::UnknownOperation {
                    step: spec.name.clone(),
                }
                .into(),
            );
        };

        match spec.mode {
            StepMode::Single => self.execute_single(spec, operation, arguments).await,
            StepMode::Batch { all_or_nothing } => {
                self.execute_batch(spec, operation, arguments, all_or_nothing)
                    .await
            }
        }
    }

    async fn execute_single(
        &self,
        spec: &StepSpec,
        operation: Arc<dyn StepOperation>,
        arguments: Value,
    ) -> StepOutcome {
        let ctx = OperationContext::new(
            self.run_id.clone(),
            spec.name.clone(),
            None,
            self.emitter.sender(),
        );
        // Spawned so that cancellation leaves the dispatched call to settle
        // on its own; its result is then ignored.
        let mut task = tokio::spawn(async move { operation.perform(arguments, ctx).await });
        let mut cancel = self.cancel_rx.clone();

        tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(output)) => StepOutcome::Output(output),
                Ok(Err(err)) => StepOutcome::Fail(EngineError::StepExecution {
                    step: spec.name.clone(),
                    source: err,
                }),
                Err(join_err) => StepOutcome::Fail(EngineError::Runtime(join_err.to_string())),
            },
            _ = cancelled(&mut cancel) => StepOutcome::Cancelled,
        }
    }

    async fn execute_batch(
        &self,
        spec: &StepSpec,
        operation: Arc<dyn StepOperation>,
        arguments: Value,
        all_or_nothing: bool,
    ) -> StepOutcome {
        let tasks = match spec.segment_tasks(&arguments) {
            Ok(tasks) => tasks,
            Err(err) => return StepOutcome::Fail(err.into()),
        };
        tracing::debug!(step = %spec.name, items = tasks.len(), "fan-out started");

        let options = FanOutOptions {
            run_id: self.run_id.clone(),
            step: spec.name.clone(),
            concurrency_limit: self.concurrency_limit,
            emitter: self.emitter.clone(),
        };
        let mut cancel = self.cancel_rx.clone();
        let batch = tokio::select! {
            batch = fanout::execute(tasks, operation, options) => batch,
            _ = cancelled(&mut cancel) => return StepOutcome::Cancelled,
        };

        for result in &batch.results {
            if let Err(err) = self
                .audit
                .record_batch_item(&self.run_id, &spec.name, &result.item_id, &result.to_value())
                .await
            {
                tracing::warn!(
                    step = %spec.name,
                    item = %result.item_id,
                    error = %err,
                    "audit sink failed"
                );
            }
        }

        if all_or_nothing && batch.failed > 0 {
            return StepOutcome::Fail(EngineError::BatchFailed {
                step: spec.name.clone(),
                failed: batch.failed,
                total: batch.total,
            });
        }
        StepOutcome::Output(batch.to_value())
    }

    fn should_stop(&self) -> bool {
        *self.cancel_rx.borrow() || !self.publisher.subscriber_connected()
    }

    fn update_status(&self, state: &mut RunState, status: RunStatus) {
        state.status = status.clone();
        self.status_board
            .lock()
            .expect("status board poisoned")
            .insert(self.run_id.clone(), status);
    }

    fn emit(&self, event: RunEvent) {
        if let Err(err) = self.publisher.publish(event) {
            tracing::debug!(error = %err, "event dropped after publisher close");
        }
    }

    async fn finalize_completed(&self, mut state: RunState) -> RunState {
        let steps = state.steps_completed();
        self.update_status(&mut state, RunStatus::Completed);
        self.emit(RunEvent::completed(
            &self.run_id,
            TerminalStatus::Completed,
            steps,
        ));
        self.publisher.close().await;
        tracing::info!(steps, "run completed");
        state
    }

    async fn finalize_rejected(&self, mut state: RunState, index: usize, step: &str) -> RunState {
        self.emit(RunEvent::log(
            &self.run_id,
            Some(step.to_string()),
            "approval",
            format!("step {step} was rejected; run stops here"),
        ));
        let steps = state.steps_completed();
        self.update_status(&mut state, RunStatus::Rejected { step: index });
        self.emit(RunEvent::completed(
            &self.run_id,
            TerminalStatus::Rejected,
            steps,
        ));
        self.publisher.close().await;
        tracing::info!(step, "run rejected");
        state
    }

    async fn finalize_cancelled(&self, mut state: RunState, index: usize) -> RunState {
        let steps = state.steps_completed();
        self.update_status(&mut state, RunStatus::Cancelled { step: index });
        self.emit(RunEvent::completed(
            &self.run_id,
            TerminalStatus::Cancelled,
            steps,
        ));
        self.publisher.close().await;
        tracing::info!(step = index, "run cancelled");
        state
    }

    async fn finalize_failed(
        &self,
        mut state: RunState,
        index: usize,
        step: Option<&str>,
        err: EngineError,
    ) -> EngineError {
        self.update_status(&mut state, RunStatus::Failed {
            step: index,
            error: err.to_string(),
        });
        self.emit(RunEvent::error(
            &self.run_id,
            step.map(str::to_string),
            err.to_string(),
        ));
        self.publisher.close().await;
        tracing::warn!(step = ?step, error = %err, "run failed");
        err
    }
}

/// Resolves when cooperative cancellation is requested. Never resolves if
/// the cancel sender is gone, since a detached run simply keeps going.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
