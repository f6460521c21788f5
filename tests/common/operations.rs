use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use greenlight::audit::{AuditError, AuditSink};
use greenlight::workflow::{OperationContext, StepError, StepOperation};
use serde_json::{Value, json};

/// Wraps its arguments so tests can see exactly what a step received.
#[derive(Debug, Clone)]
pub struct EchoOp;

#[async_trait]
impl StepOperation for EchoOp {
    async fn perform(&self, arguments: Value, _ctx: OperationContext) -> Result<Value, StepError> {
        Ok(json!({ "echo": arguments }))
    }
}

/// Produces a fixed field other steps can chain from.
#[derive(Debug, Clone)]
pub struct TitleOp {
    pub title: &'static str,
}

#[async_trait]
impl StepOperation for TitleOp {
    async fn perform(&self, arguments: Value, _ctx: OperationContext) -> Result<Value, StepError> {
        Ok(json!({ "title": self.title, "input": arguments }))
    }
}

/// Always fails with a provider error.
#[derive(Debug, Clone)]
pub struct FailingOp {
    pub message: &'static str,
}

#[async_trait]
impl StepOperation for FailingOp {
    async fn perform(&self, _arguments: Value, _ctx: OperationContext) -> Result<Value, StepError> {
        Err(StepError::Provider {
            provider: "test",
            message: self.message.to_string(),
        })
    }
}

/// Batch operation failing only for one item id.
#[derive(Debug, Clone)]
pub struct FailOnId {
    pub bad_id: &'static str,
}

#[async_trait]
impl StepOperation for FailOnId {
    async fn perform(&self, _arguments: Value, ctx: OperationContext) -> Result<Value, StepError> {
        match ctx.item_id.as_deref() {
            Some(id) if id == self.bad_id => Err(StepError::Provider {
                provider: "test",
                message: format!("item {id} refused"),
            }),
            other => Ok(json!({ "rendered": other })),
        }
    }
}

/// Fails when the item's `fail` flag is set; used by the aggregate
/// arithmetic property.
#[derive(Debug, Clone)]
pub struct FailOnFlag;

#[async_trait]
impl StepOperation for FailOnFlag {
    async fn perform(&self, arguments: Value, _ctx: OperationContext) -> Result<Value, StepError> {
        if arguments.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            Err(StepError::Provider {
                provider: "test",
                message: "flagged".to_string(),
            })
        } else {
            Ok(json!({ "ok": true }))
        }
    }
}

/// Panics for one item id; everything else succeeds.
#[derive(Debug, Clone)]
pub struct PanicOnId {
    pub bad_id: &'static str,
}

#[async_trait]
impl StepOperation for PanicOnId {
    async fn perform(&self, _arguments: Value, ctx: OperationContext) -> Result<Value, StepError> {
        if ctx.item_id.as_deref() == Some(self.bad_id) {
            panic!("poisoned item");
        }
        Ok(json!({ "ok": true }))
    }
}

/// Sleeps before succeeding, for cancellation and ordering tests.
#[derive(Debug, Clone)]
pub struct SleepOp {
    pub millis: u64,
}

#[async_trait]
impl StepOperation for SleepOp {
    async fn perform(&self, arguments: Value, _ctx: OperationContext) -> Result<Value, StepError> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(json!({ "slept": self.millis, "input": arguments }))
    }
}

/// Sleeps longer for lower item indices so completion order inverts
/// submission order.
#[derive(Debug, Clone)]
pub struct InverseSleepOp;

#[async_trait]
impl StepOperation for InverseSleepOp {
    async fn perform(&self, arguments: Value, ctx: OperationContext) -> Result<Value, StepError> {
        let index: u64 = ctx
            .item_id
            .as_deref()
            .and_then(|id| id.parse().ok())
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(40u64.saturating_sub(index * 10))).await;
        Ok(json!({ "input": arguments }))
    }
}

/// Tracks the peak number of concurrently running invocations.
#[derive(Debug, Clone)]
pub struct TrackingOp {
    pub current: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl TrackingOp {
    pub fn new() -> Self {
        Self {
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl StepOperation for TrackingOp {
    async fn perform(&self, _arguments: Value, _ctx: OperationContext) -> Result<Value, StepError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "ok": true }))
    }
}

/// Audit sink recording every call for assertions.
#[derive(Clone, Default)]
pub struct RecordingAudit {
    pub steps: Arc<Mutex<Vec<(String, String)>>>,
    pub items: Arc<Mutex<Vec<(String, String, String)>>>,
}

impl RecordingAudit {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn record_step_output(
        &self,
        run_id: &str,
        step: &str,
        _output: &Value,
    ) -> Result<(), AuditError> {
        self.steps
            .lock()
            .unwrap()
            .push((run_id.to_string(), step.to_string()));
        Ok(())
    }

    async fn record_batch_item(
        &self,
        run_id: &str,
        step: &str,
        item_id: &str,
        _result: &Value,
    ) -> Result<(), AuditError> {
        self.items.lock().unwrap().push((
            run_id.to_string(),
            step.to_string(),
            item_id.to_string(),
        ));
        Ok(())
    }
}

/// Audit sink that always fails, to prove failures never propagate.
#[derive(Clone, Copy, Debug, Default)]
pub struct BrokenAudit;

#[async_trait]
impl AuditSink for BrokenAudit {
    async fn record_step_output(&self, _: &str, _: &str, _: &Value) -> Result<(), AuditError> {
        Err(AuditError("audit backend down".to_string()))
    }

    async fn record_batch_item(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: &Value,
    ) -> Result<(), AuditError> {
        Err(AuditError("audit backend down".to_string()))
    }
}
