//! # Approval Stream Demo
//!
//! Runs a three-step pipeline (research → concept → render) where the
//! concept step is gated on human approval and the render step fans out
//! over the concept's segments. A background task stands in for the
//! reviewer and approves the pending request after a short delay, with
//! an argument override merged into the gated step's input.
//!
//! ## Run This Demo
//!
//! ```bash
//! cargo run --example approval_stream
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use greenlight::engine::Engine;
use greenlight::workflow::{
    OperationContext, StepError, StepOperation, StepRegistry, StepSpec, WorkflowDefinition,
};

/// Collects background material and splits it into segments.
#[derive(Debug, Clone)]
struct ResearchOp;

#[async_trait]
impl StepOperation for ResearchOp {
    async fn perform(&self, arguments: Value, ctx: OperationContext) -> Result<Value, StepError> {
        let topic = arguments
            .get("topic")
            .and_then(Value::as_str)
            .ok_or(StepError::MissingInput { what: "topic" })?;
        ctx.emit("research", format!("collecting sources on {topic}"))?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(json!({
            "topic": topic,
            "summary": format!("three findings about {topic}"),
            "segments": [
                { "id": "intro", "text": format!("why {topic} matters") },
                { "id": "body", "text": format!("how {topic} works") },
                { "id": "outro", "text": format!("where {topic} goes next") },
            ],
        }))
    }
}

/// Turns research into a concept brief. Gated: runs only after approval,
/// with any reviewer overrides merged into its arguments.
#[derive(Debug, Clone)]
struct ConceptOp;

#[async_trait]
impl StepOperation for ConceptOp {
    async fn perform(&self, arguments: Value, ctx: OperationContext) -> Result<Value, StepError> {
        let style = arguments
            .get("style")
            .and_then(Value::as_str)
            .unwrap_or("plain");
        ctx.emit("concept", format!("drafting a {style} concept"))?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(json!({
            "brief": format!("a {style} piece based on {}", arguments["summary"]),
            "segments": arguments["segments"],
        }))
    }
}

/// Renders one segment. Runs once per item of the fan-out batch.
#[derive(Debug, Clone)]
struct RenderOp;

#[async_trait]
impl StepOperation for RenderOp {
    async fn perform(&self, arguments: Value, ctx: OperationContext) -> Result<Value, StepError> {
        let item = ctx.item_id.as_deref().unwrap_or("?");
        ctx.emit("render", format!("rendering segment {item}"))?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(json!({ "rendered": arguments["text"] }))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,greenlight=debug"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(ErrorLayer::default())
        .init();
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    init_tracing();
    miette::set_panic_hook();

    let registry = StepRegistry::new()
        .register("research", Arc::new(ResearchOp))
        .register("concept", Arc::new(ConceptOp))
        .register("render", Arc::new(RenderOp));

    let definition = WorkflowDefinition::builder("approval-stream-demo")
        .step(StepSpec::new("research"))
        .step(StepSpec::new("concept").gated().chained("research", ""))
        .step(
            StepSpec::new("render")
                .batch(false)
                .chained("concept", "/segments"),
        )
        .build()?;

    let engine = Engine::new(registry);

    // Stand-in reviewer: approves the first pending request it sees and
    // overrides the concept style.
    let reviewer = engine.clone();
    tokio::spawn(async move {
        loop {
            if let Some(request) = reviewer.list_pending_approvals().into_iter().next() {
                info!(step = %request.step, approval_id = %request.id, "reviewer approving");
                let _ = reviewer.decide(&request.id, true, Some(json!({"style": "cinematic"})));
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    let mut handle = engine.start_run(
        definition,
        json!({ "topic": "tidal power" }),
        json!({ "user": "demo" }),
    )?;
    info!(run_id = %handle.run_id(), "run started");

    let mut events = handle.take_events().expect("first take");
    while let Some(event) = events.recv().await {
        info!("{event}");
    }

    let state = handle.join().await?;
    info!(status = ?state.status, steps = state.steps_completed(), "run finished");

    let aggregate = state.output("render").expect("render aggregate");
    info!(
        total = %aggregate["total"],
        succeeded = %aggregate["succeeded"],
        "render batch settled"
    );

    let swept = engine.sweep_stale(Duration::ZERO);
    info!(swept, "cleaned up resolved approvals");
    Ok(())
}
