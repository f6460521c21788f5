//! Optional audit collaborators.
//!
//! Audit sinks observe step and batch-item outputs for external recording.
//! They are best-effort: a failing sink is logged and never affects the run.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("audit sink error: {0}")]
pub struct AuditError(pub String);

/// External recorder of run outputs.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_step_output(
        &self,
        run_id: &str,
        step: &str,
        output: &Value,
    ) -> Result<(), AuditError>;

    async fn record_batch_item(
        &self,
        run_id: &str,
        step: &str,
        item_id: &str,
        result: &Value,
    ) -> Result<(), AuditError>;
}

/// Default sink that records nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAudit;

#[async_trait]
impl AuditSink for NoopAudit {
    async fn record_step_output(&self, _: &str, _: &str, _: &Value) -> Result<(), AuditError> {
        Ok(())
    }

    async fn record_batch_item(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: &Value,
    ) -> Result<(), AuditError> {
        Ok(())
    }
}
