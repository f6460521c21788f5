//! Segment fan-out executor.
//!
//! Applies one operation to many independent items concurrently, collecting
//! per-item outcomes behind an all-settled barrier. One item failing never
//! aborts its siblings; complete failure is a valid batch outcome, reported
//! in the aggregate rather than raised as an error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::event::{RunEmitter, RunEvent};
use crate::workflow::step::{OperationContext, StepOperation};

/// One independent unit of batch work.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentTask {
    pub item_id: String,
    pub input: Value,
}

impl SegmentTask {
    pub fn new(item_id: impl Into<String>, input: Value) -> Self {
        Self {
            item_id: item_id.into(),
            input,
        }
    }
}

/// Settled outcome of one segment.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SegmentOutcome {
    Success { data: Value },
    Failed { error: String },
}

/// Per-item result, preserved in submission order in the aggregate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentResult {
    pub item_id: String,
    #[serde(flatten)]
    pub outcome: SegmentOutcome,
}

impl SegmentResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SegmentOutcome::Success { .. })
    }

    pub fn to_value(&self) -> Value {
        match &self.outcome {
            SegmentOutcome::Success { data } => json!({
                "item_id": self.item_id,
                "status": "success",
                "data": data,
            }),
            SegmentOutcome::Failed { error } => json!({
                "item_id": self.item_id,
                "status": "failed",
                "error": error,
            }),
        }
    }
}

/// Aggregate of a settled batch. `total == succeeded + failed` always holds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<SegmentResult>,
}

impl BatchResult {
    pub fn overall_success(&self) -> bool {
        self.failed == 0
    }

    pub fn to_value(&self) -> Value {
        json!({
            "total": self.total,
            "succeeded": self.succeeded,
            "failed": self.failed,
            "overall_success": self.overall_success(),
            "results": self.results.iter().map(SegmentResult::to_value).collect::<Vec<_>>(),
        })
    }

    fn from_results(results: Vec<SegmentResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
        }
    }
}

/// Execution parameters for one batch.
#[derive(Clone, Debug)]
pub struct FanOutOptions {
    pub run_id: String,
    pub step: String,
    /// Upper bound on in-flight operations. `None` is unbounded.
    pub concurrency_limit: Option<usize>,
    pub emitter: RunEmitter,
}

/// Run every task through `operation`, all-settled.
///
/// Each item runs in its own task; an `Err` (or panic) becomes a failed
/// [`SegmentResult`] without crossing the fan-in barrier. A `result` event
/// is published the moment each item settles, so observers see incremental
/// progress before the aggregate lands. Results come back re-sorted to
/// submission order regardless of completion order.
pub async fn execute(
    tasks: Vec<SegmentTask>,
    operation: Arc<dyn StepOperation>,
    options: FanOutOptions,
) -> BatchResult {
    if tasks.is_empty() {
        return BatchResult::from_results(Vec::new());
    }

    let semaphore = options
        .concurrency_limit
        .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
    let sender = options.emitter.sender();

    let mut item_ids = Vec::with_capacity(tasks.len());
    let mut handles: Vec<JoinHandle<SegmentResult>> = Vec::with_capacity(tasks.len());

    for task in tasks {
        item_ids.push(task.item_id.clone());

        let operation = operation.clone();
        let semaphore = semaphore.clone();
        let sender = sender.clone();
        let run_id = options.run_id.clone();
        let step = options.step.clone();

        handles.push(tokio::spawn(async move {
            let _permit = match semaphore {
                Some(semaphore) => Some(
                    semaphore
                        .acquire_owned()
                        .await
                        .expect("fan-out semaphore closed"),
                ),
                None => None,
            };

            let ctx = OperationContext::new(
                run_id.clone(),
                step.clone(),
                Some(task.item_id.clone()),
                sender.clone(),
            );
            let outcome = match operation.perform(task.input, ctx).await {
                Ok(data) => SegmentOutcome::Success { data },
                Err(err) => SegmentOutcome::Failed {
                    error: err.to_string(),
                },
            };
            let result = SegmentResult {
                item_id: task.item_id,
                outcome,
            };

            // A torn-down run no longer consumes events; that is fine, the
            // result still flows back through the join.
            let _ = sender.send(RunEvent::item_result(
                run_id,
                step,
                result.item_id.clone(),
                result.to_value(),
            ));

            result
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (handle, item_id) in handles.into_iter().zip(item_ids) {
        match handle.await {
            Ok(result) => results.push(result),
            Err(join_err) => {
                tracing::warn!(item = %item_id, error = %join_err, "segment task aborted");
                results.push(SegmentResult {
                    item_id,
                    outcome: SegmentOutcome::Failed {
                        error: format!("segment task aborted: {join_err}"),
                    },
                });
            }
        }
    }

    BatchResult::from_results(results)
}
