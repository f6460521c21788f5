use std::sync::Mutex;

use chrono::Utc;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use super::request::{ApprovalRequest, ApprovalStatus, Decision};

/// Registry of approval requests keyed by approval id.
///
/// The gate is the one structure shared between run controllers and the
/// deciding caller. Per-key access is serialized through the registry lock,
/// so `decide` and `await_decision` never race: a waiter either observes the
/// pending status and parks on the watch channel, or observes the decision
/// already stored.
///
/// Waiting is signal-driven. Each entry carries a [`watch`] channel that
/// `decide` writes exactly once; `await_decision` parks on it without
/// polling.
#[derive(Debug, Default)]
pub struct ApprovalGate {
    entries: Mutex<FxHashMap<String, GateEntry>>,
}

#[derive(Debug)]
struct GateEntry {
    request: ApprovalRequest,
    notify: watch::Sender<Option<Decision>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request for a gated step and return it.
    ///
    /// At most one pending request may exist per (run, step) pair; a second
    /// registration while the first is unresolved is a protocol error.
    pub fn register(
        &self,
        run_id: impl Into<String>,
        step: impl Into<String>,
        arguments: Value,
        auth_context: Value,
    ) -> Result<ApprovalRequest, GateError> {
        let run_id = run_id.into();
        let step = step.into();

        let mut entries = self.entries.lock().expect("gate poisoned");
        let duplicate = entries.values().any(|entry| {
            entry.request.status.is_pending()
                && entry.request.run_id == run_id
                && entry.request.step == step
        });
        if duplicate {
            return Err(GateError::AlreadyPending { run_id, step });
        }

        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            run_id,
            step,
            arguments,
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            auth_context,
        };
        let (notify, _) = watch::channel(None);
        entries.insert(request.id.clone(), GateEntry {
            request: request.clone(),
            notify,
        });
        Ok(request)
    }

    /// Resolve a pending request and wake its waiter.
    ///
    /// `extra_arguments` are shallow-merged over the registered arguments,
    /// but only on approval; a rejection discards them. Deciding an unknown
    /// id or an already resolved request fails without touching the stored
    /// status.
    pub fn decide(
        &self,
        approval_id: &str,
        approved: bool,
        extra_arguments: Option<Value>,
    ) -> Result<ApprovalRequest, GateError> {
        let mut entries = self.entries.lock().expect("gate poisoned");
        let entry = entries
            .get_mut(approval_id)
            .ok_or_else(|| GateError::NotFound {
                id: approval_id.to_string(),
            })?;
        if !entry.request.status.is_pending() {
            return Err(GateError::AlreadyDecided {
                id: approval_id.to_string(),
            });
        }

        let decision = if approved {
            entry.request.status = ApprovalStatus::Approved;
            Decision::Approved {
                arguments: merge_arguments(&entry.request.arguments, extra_arguments),
            }
        } else {
            entry.request.status = ApprovalStatus::Rejected;
            Decision::Rejected
        };
        entry.notify.send_replace(Some(decision));
        Ok(entry.request.clone())
    }

    /// Wait for the decision on a request, without polling.
    ///
    /// Returns immediately if the request is already resolved; otherwise
    /// parks until `decide` signals the entry's channel.
    pub async fn await_decision(&self, approval_id: &str) -> Result<Decision, GateError> {
        let mut rx = {
            let entries = self.entries.lock().expect("gate poisoned");
            let entry = entries.get(approval_id).ok_or_else(|| GateError::NotFound {
                id: approval_id.to_string(),
            })?;
            entry.notify.subscribe()
        };

        loop {
            if let Some(decision) = (*rx.borrow_and_update()).clone() {
                return Ok(decision);
            }
            if rx.changed().await.is_err() {
                return Err(GateError::Closed {
                    id: approval_id.to_string(),
                });
            }
        }
    }

    /// Snapshot of all currently pending requests, oldest first.
    pub fn list_pending(&self) -> Vec<ApprovalRequest> {
        let entries = self.entries.lock().expect("gate poisoned");
        let mut pending: Vec<ApprovalRequest> = entries
            .values()
            .filter(|entry| entry.request.status.is_pending())
            .map(|entry| entry.request.clone())
            .collect();
        pending.sort_by_key(|request| request.created_at);
        pending
    }

    pub fn get(&self, approval_id: &str) -> Option<ApprovalRequest> {
        let entries = self.entries.lock().expect("gate poisoned");
        entries
            .get(approval_id)
            .map(|entry| entry.request.clone())
    }

    /// Drop a resolved entry once its decision has been consumed.
    pub(crate) fn remove(&self, approval_id: &str) -> Option<ApprovalRequest> {
        let mut entries = self.entries.lock().expect("gate poisoned");
        entries.remove(approval_id).map(|entry| entry.request)
    }

    /// Remove resolved requests older than `max_age`; returns how many were
    /// removed. Pending requests are never swept regardless of age, since a
    /// run is still parked on them.
    pub fn sweep(&self, max_age: std::time::Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        {
            Some(cutoff) => cutoff,
            // A max_age beyond the representable range means nothing
            // qualifies as stale.
            None => return 0,
        };
        let mut entries = self.entries.lock().expect("gate poisoned");
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.request.status.is_pending() || entry.request.created_at > cutoff
        });
        before - entries.len()
    }
}

fn merge_arguments(base: &Value, extra: Option<Value>) -> Value {
    match (base, extra) {
        (Value::Object(base_map), Some(Value::Object(extra_map))) => {
            let mut merged = base_map.clone();
            for (key, value) in extra_map {
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (_, Some(extra)) if !extra.is_null() => extra,
        (base, _) => base.clone(),
    }
}

/// Approval protocol failures. These affect only the deciding caller, never
/// the run parked on the request.
#[derive(Debug, Error, Diagnostic)]
pub enum GateError {
    #[error("approval request not found: {id}")]
    #[diagnostic(
        code(greenlight::gate::not_found),
        help("The request may have been swept or the id is stale. List pending approvals to see live requests.")
    )]
    NotFound { id: String },

    #[error("approval request already decided: {id}")]
    #[diagnostic(
        code(greenlight::gate::already_decided),
        help("Decisions are final. The stored status is unchanged.")
    )]
    AlreadyDecided { id: String },

    #[error("run {run_id} already has a pending approval for step {step}")]
    #[diagnostic(code(greenlight::gate::already_pending))]
    AlreadyPending { run_id: String, step: String },

    #[error("approval request removed while waiting: {id}")]
    #[diagnostic(code(greenlight::gate::closed))]
    Closed { id: String },
}
