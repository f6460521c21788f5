use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal outcome carried by the final `completed` event of a run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Completed,
    Rejected,
    Cancelled,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Completed => "completed",
            TerminalStatus::Rejected => "rejected",
            TerminalStatus::Cancelled => "cancelled",
        }
    }
}

/// Typed progress event published on a run's stream.
///
/// Exactly one terminal event ([`RunEvent::Error`] or [`RunEvent::Completed`])
/// ends every stream; no event follows it for that run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunEvent {
    Log(LogEvent),
    ApprovalRequired(ApprovalRequiredEvent),
    StepResult(StepResultEvent),
    Error(RunErrorEvent),
    Completed(CompletedEvent),
}

impl RunEvent {
    pub fn log(
        run_id: impl Into<String>,
        step: Option<String>,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        RunEvent::Log(LogEvent {
            run_id: run_id.into(),
            step,
            scope: scope.into(),
            message: message.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn approval_required(
        run_id: impl Into<String>,
        approval_id: impl Into<String>,
        step: impl Into<String>,
        arguments: Value,
    ) -> Self {
        RunEvent::ApprovalRequired(ApprovalRequiredEvent {
            run_id: run_id.into(),
            approval_id: approval_id.into(),
            step: step.into(),
            arguments,
            timestamp: Utc::now(),
        })
    }

    pub fn step_result(run_id: impl Into<String>, step: impl Into<String>, output: Value) -> Self {
        RunEvent::StepResult(StepResultEvent {
            run_id: run_id.into(),
            step: step.into(),
            item_id: None,
            output,
            timestamp: Utc::now(),
        })
    }

    /// Result event for a single settled item of a fan-out batch.
    pub fn item_result(
        run_id: impl Into<String>,
        step: impl Into<String>,
        item_id: impl Into<String>,
        output: Value,
    ) -> Self {
        RunEvent::StepResult(StepResultEvent {
            run_id: run_id.into(),
            step: step.into(),
            item_id: Some(item_id.into()),
            output,
            timestamp: Utc::now(),
        })
    }

    pub fn error(run_id: impl Into<String>, step: Option<String>, message: impl Into<String>) -> Self {
        RunEvent::Error(RunErrorEvent {
            run_id: run_id.into(),
            step,
            message: message.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn completed(
        run_id: impl Into<String>,
        status: TerminalStatus,
        steps_completed: usize,
    ) -> Self {
        RunEvent::Completed(CompletedEvent {
            run_id: run_id.into(),
            status,
            steps_completed,
            timestamp: Utc::now(),
        })
    }

    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::Log(e) => &e.run_id,
            RunEvent::ApprovalRequired(e) => &e.run_id,
            RunEvent::StepResult(e) => &e.run_id,
            RunEvent::Error(e) => &e.run_id,
            RunEvent::Completed(e) => &e.run_id,
        }
    }

    /// Wire-level discriminator for the `type` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            RunEvent::Log(_) => "log",
            RunEvent::ApprovalRequired(_) => "approval_required",
            RunEvent::StepResult(_) => "result",
            RunEvent::Error(_) => "error",
            RunEvent::Completed(_) => "completed",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            RunEvent::Log(e) => e.timestamp,
            RunEvent::ApprovalRequired(e) => e.timestamp,
            RunEvent::StepResult(e) => e.timestamp,
            RunEvent::Error(e) => e.timestamp,
            RunEvent::Completed(e) => e.timestamp,
        }
    }

    /// True for the two event kinds that end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Error(_) | RunEvent::Completed(_))
    }

    /// Convert the event to its transport framing.
    ///
    /// Returns a JSON object of the shape:
    /// ```json
    /// {
    ///   "type": "log" | "approval_required" | "result" | "error" | "completed",
    ///   "data": { /* variant-specific fields */ },
    ///   "timestamp": "2025-11-03T12:34:56.789Z"
    /// }
    /// ```
    ///
    /// # Example
    ///
    /// ```
    /// use greenlight::event::RunEvent;
    /// use serde_json::json;
    ///
    /// let event = RunEvent::step_result("run-1", "concept", json!({"title": "draft"}));
    /// let wire = event.to_json_value();
    ///
    /// assert_eq!(wire["type"], "result");
    /// assert_eq!(wire["data"]["step"], "concept");
    /// assert_eq!(wire["data"]["output"]["title"], "draft");
    /// ```
    pub fn to_json_value(&self) -> Value {
        use serde_json::json;

        let data = match self {
            RunEvent::Log(e) => json!({
                "run_id": e.run_id,
                "step": e.step,
                "scope": e.scope,
                "message": e.message,
            }),
            RunEvent::ApprovalRequired(e) => json!({
                "run_id": e.run_id,
                "approval_id": e.approval_id,
                "step": e.step,
                "arguments": e.arguments,
            }),
            RunEvent::StepResult(e) => {
                let mut map = serde_json::Map::new();
                map.insert("run_id".into(), json!(e.run_id));
                map.insert("step".into(), json!(e.step));
                if let Some(item_id) = &e.item_id {
                    map.insert("item_id".into(), json!(item_id));
                }
                map.insert("output".into(), e.output.clone());
                Value::Object(map)
            }
            RunEvent::Error(e) => json!({
                "run_id": e.run_id,
                "step": e.step,
                "message": e.message,
            }),
            RunEvent::Completed(e) => json!({
                "run_id": e.run_id,
                "status": e.status.as_str(),
                "steps_completed": e.steps_completed,
            }),
        };

        json!({
            "type": self.event_type(),
            "data": data,
            "timestamp": self.timestamp().to_rfc3339(),
        })
    }

    /// Compact JSON string of the wire framing.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_json_value())
    }
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunEvent::Log(e) => match &e.step {
                Some(step) => write!(f, "[{}@{step}] {}", e.run_id, e.message),
                None => write!(f, "[{}] {}", e.run_id, e.message),
            },
            RunEvent::ApprovalRequired(e) => {
                write!(f, "[{}@{}] approval required: {}", e.run_id, e.step, e.approval_id)
            }
            RunEvent::StepResult(e) => match &e.item_id {
                Some(item) => write!(f, "[{}@{}] item {item} settled", e.run_id, e.step),
                None => write!(f, "[{}@{}] result", e.run_id, e.step),
            },
            RunEvent::Error(e) => match &e.step {
                Some(step) => write!(f, "[{}@{step}] error: {}", e.run_id, e.message),
                None => write!(f, "[{}] error: {}", e.run_id, e.message),
            },
            RunEvent::Completed(e) => write!(
                f,
                "[{}] {} after {} steps",
                e.run_id,
                e.status.as_str(),
                e.steps_completed
            ),
        }
    }
}

/// Informational progress note scoped to a run, optionally to a step.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEvent {
    pub run_id: String,
    pub step: Option<String>,
    pub scope: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when a gated step registers a pending approval and suspends.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalRequiredEvent {
    pub run_id: String,
    pub approval_id: String,
    pub step: String,
    pub arguments: Value,
    pub timestamp: DateTime<Utc>,
}

/// Output of a completed step, or of one settled batch item when `item_id`
/// is present.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepResultEvent {
    pub run_id: String,
    pub step: String,
    pub item_id: Option<String>,
    pub output: Value,
    pub timestamp: DateTime<Utc>,
}

/// Run-level fatal error. Terminal: the stream closes after this event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunErrorEvent {
    pub run_id: String,
    pub step: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Normal end of a run. Terminal: the stream closes after this event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletedEvent {
    pub run_id: String,
    pub status: TerminalStatus,
    pub steps_completed: usize,
    pub timestamp: DateTime<Utc>,
}
