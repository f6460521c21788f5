use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of an approval request. Pending is the only mutable state:
/// once approved or rejected the status never changes again.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, ApprovalStatus::Pending)
    }
}

/// A pending or resolved request for human approval of one gated step.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub id: String,
    pub run_id: String,
    pub step: String,
    /// Arguments the gated step will execute with if approved.
    pub arguments: Value,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    /// Caller identity captured at registration, passed through for audit.
    pub auth_context: Value,
}

/// Outcome delivered to a run waiting on its approval request.
///
/// `Approved` carries the step arguments with any extra arguments from the
/// decision merged in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Approved { arguments: Value },
    Rejected,
}
