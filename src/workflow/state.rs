use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Position of a run in its lifecycle.
///
/// `Completed`, `Rejected`, `Failed`, and `Cancelled` are terminal: a run
/// never leaves them, registers nothing with the gate, and emits no further
/// events.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Running { step: usize },
    AwaitingApproval { step: usize, approval_id: String },
    Completed,
    Rejected { step: usize },
    Failed { step: usize, error: String },
    Cancelled { step: usize },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            RunStatus::Running { .. } | RunStatus::AwaitingApproval { .. }
        )
    }
}

/// Accumulated state of one run: its identity, position, and the outputs of
/// every completed step.
///
/// Outputs grow monotonically and are keyed by step name; a recorded output
/// is never overwritten.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub run_id: String,
    pub status: RunStatus,
    outputs: Vec<(String, Value)>,
    pub started_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Running { step: 0 },
            outputs: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Record a step's output. Outputs are append-only; a second record for
    /// the same step name is ignored.
    pub fn record_output(&mut self, step: impl Into<String>, output: Value) {
        let step = step.into();
        if self.outputs.iter().any(|(name, _)| *name == step) {
            debug_assert!(false, "step output recorded twice: {step}");
            return;
        }
        self.outputs.push((step, output));
    }

    pub fn output(&self, step: &str) -> Option<&Value> {
        self.outputs
            .iter()
            .find(|(name, _)| name == step)
            .map(|(_, output)| output)
    }

    /// Outputs in execution order.
    pub fn outputs(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.outputs
            .iter()
            .map(|(name, output)| (name.as_str(), output))
    }

    pub fn steps_completed(&self) -> usize {
        self.outputs.len()
    }

    /// Output of the last completed step, if any.
    pub fn final_output(&self) -> Option<&Value> {
        self.outputs.last().map(|(_, output)| output)
    }
}
