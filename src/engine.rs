//! Engine facade.
//!
//! An [`Engine`] owns the approval gate, the step registry, and a board of
//! run statuses, all constructor-injected. Each started run gets its own
//! publisher, event stream, and controller task; the only state shared
//! between runs is the gate and the status board.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::approval::{ApprovalGate, ApprovalRequest, GateError};
use crate::audit::{AuditSink, NoopAudit};
use crate::config::{EngineConfig, SinkConfig};
use crate::error::EngineError;
use crate::event::{EventSink, RunEventStream, RunPublisher, StdOutSink};
use crate::workflow::controller::RunController;
use crate::workflow::definition::{StepRegistry, ValidationError, WorkflowDefinition};
use crate::workflow::state::{RunState, RunStatus};

#[derive(Clone)]
pub struct Engine {
    gate: Arc<ApprovalGate>,
    registry: Arc<StepRegistry>,
    audit: Arc<dyn AuditSink>,
    config: EngineConfig,
    runs: Arc<Mutex<FxHashMap<String, RunStatus>>>,
}

impl Engine {
    pub fn new(registry: StepRegistry) -> Self {
        Self {
            gate: Arc::new(ApprovalGate::new()),
            registry: Arc::new(registry),
            audit: Arc::new(NoopAudit),
            config: EngineConfig::default(),
            runs: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Start a run of `definition` and return its handle.
    ///
    /// Validation happens here, before the run task spawns: an unregistered
    /// step name fails fast and no event is ever published for the run.
    pub fn start_run(
        &self,
        definition: WorkflowDefinition,
        input: Value,
        auth_context: Value,
    ) -> Result<RunHandle, EngineError> {
        self.start_run_with_sinks(definition, input, auth_context, Vec::new())
    }

    /// Like [`Engine::start_run`], attaching extra sinks to this run's
    /// stream alongside the subscriber.
    pub fn start_run_with_sinks(
        &self,
        definition: WorkflowDefinition,
        input: Value,
        auth_context: Value,
        extra_sinks: Vec<Box<dyn EventSink>>,
    ) -> Result<RunHandle, EngineError> {
        for spec in definition.steps() {
            if !self.registry.contains(&spec.name) {
                return Err(ValidationError::UnknownOperation {
                    step: spec.name.clone(),
                }
                .into());
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let mut sinks = self.configured_sinks();
        sinks.extend(extra_sinks);
        let (publisher, events) = RunPublisher::open(sinks);
        let emitter = publisher.emitter();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        self.runs
            .lock()
            .expect("run board poisoned")
            .insert(run_id.clone(), RunStatus::Running { step: 0 });

        tracing::info!(run_id = %run_id, workflow = %definition.name, "starting run");
        let controller = RunController {
            run_id: run_id.clone(),
            definition: Arc::new(definition),
            registry: self.registry.clone(),
            gate: self.gate.clone(),
            publisher,
            emitter,
            audit: self.audit.clone(),
            status_board: self.runs.clone(),
            wait_policy: self.config.approval_wait,
            concurrency_limit: self.config.default_concurrency_limit,
            cancel_rx,
        };
        let join = tokio::spawn(controller.run(input, auth_context));

        Ok(RunHandle {
            run_id,
            events: Some(events),
            join,
            cancel: cancel_tx,
        })
    }

    /// Resolve a pending approval. The waiting run wakes immediately.
    pub fn decide(
        &self,
        approval_id: &str,
        approved: bool,
        extra_arguments: Option<Value>,
    ) -> Result<ApprovalRequest, GateError> {
        self.gate.decide(approval_id, approved, extra_arguments)
    }

    pub fn list_pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.gate.list_pending()
    }

    pub fn get_approval_request(&self, approval_id: &str) -> Option<ApprovalRequest> {
        self.gate.get(approval_id)
    }

    /// Remove resolved approval requests older than `max_age`.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let removed = self.gate.sweep(max_age);
        if removed > 0 {
            tracing::debug!(removed, "swept resolved approval requests");
        }
        removed
    }

    /// Ids and statuses of every run this engine has started.
    pub fn list_runs(&self) -> Vec<(String, RunStatus)> {
        self.runs
            .lock()
            .expect("run board poisoned")
            .iter()
            .map(|(id, status)| (id.clone(), status.clone()))
            .collect()
    }

    pub fn run_status(&self, run_id: &str) -> Option<RunStatus> {
        self.runs
            .lock()
            .expect("run board poisoned")
            .get(run_id)
            .cloned()
    }

    fn configured_sinks(&self) -> Vec<Box<dyn EventSink>> {
        self.config
            .sinks
            .iter()
            .map(|sink| match sink {
                SinkConfig::StdOut => Box::new(StdOutSink::default()) as Box<dyn EventSink>,
            })
            .collect()
    }
}

/// Handle to one started run.
///
/// Exposes the run's event stream (once, via [`RunHandle::take_events`]),
/// cooperative cancellation, and the final state through
/// [`RunHandle::join`].
pub struct RunHandle {
    run_id: String,
    events: Option<RunEventStream>,
    join: JoinHandle<Result<RunState, EngineError>>,
    cancel: watch::Sender<bool>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Take the run's event stream. Returns `None` after the first call;
    /// each run has exactly one subscriber.
    pub fn take_events(&mut self) -> Option<RunEventStream> {
        self.events.take()
    }

    /// Request cooperative cancellation.
    ///
    /// The run stops pulling steps at the next suspension point, publishes
    /// its terminal event, and lets already dispatched operations settle
    /// with their results ignored.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the run's terminal state.
    pub async fn join(self) -> Result<RunState, EngineError> {
        match self.join.await {
            Ok(result) => result,
            Err(join_err) => Err(EngineError::Runtime(join_err.to_string())),
        }
    }
}
