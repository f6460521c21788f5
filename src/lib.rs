//! # Greenlight: Approval-gated Streaming Workflow Engine
//!
//! Greenlight runs multi-step generation pipelines that pause for human
//! approval before costly or irreversible steps, resume deterministically
//! once a decision arrives, and stream typed progress events to a single
//! observer throughout. Batch steps fan out over independent items with
//! per-item failure isolation.
//!
//! ## Core Concepts
//!
//! - **Workflow definition**: an ordered, validated list of steps with
//!   explicit input chaining
//! - **Step operations**: async units of external work bound to step names
//!   through a registry
//! - **Approval gate**: pending decisions that suspend a run until a caller
//!   approves or rejects, signal-driven rather than polled
//! - **Run stream**: a per-run, totally ordered event sequence ending in
//!   exactly one terminal event
//! - **Fan-out**: all-settled concurrent execution of batch items, one
//!   result event per settled item
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use greenlight::engine::Engine;
//! use greenlight::workflow::{
//!     OperationContext, StepError, StepOperation, StepRegistry, StepSpec, WorkflowDefinition,
//! };
//! use serde_json::{Value, json};
//!
//! struct Research;
//!
//! #[async_trait]
//! impl StepOperation for Research {
//!     async fn perform(
//!         &self,
//!         arguments: Value,
//!         ctx: OperationContext,
//!     ) -> Result<Value, StepError> {
//!         ctx.emit("research", "collecting sources")?;
//!         Ok(json!({ "summary": "findings", "input": arguments }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = StepRegistry::new().register("research", Arc::new(Research));
//!     let definition = WorkflowDefinition::builder("demo")
//!         .step(StepSpec::new("research"))
//!         .build()?;
//!
//!     let engine = Engine::new(registry);
//!     let mut handle =
//!         engine.start_run(definition, json!({"topic": "penguins"}), json!({"user": "demo"}))?;
//!
//!     let mut events = handle.take_events().expect("first take");
//!     while let Some(event) = events.recv().await {
//!         println!("{event}");
//!     }
//!
//!     let state = handle.join().await?;
//!     println!("finished: {:?}", state.status);
//!     Ok(())
//! }
//! ```
//!
//! Gated steps are built with [`workflow::StepSpec::gated`]; while a run is
//! suspended, resolve its request through [`engine::Engine::decide`] and the
//! run resumes with the decision's merged arguments.
//!
//! ## Module Guide
//!
//! - [`workflow`] - definitions, step operations, run state, chaining
//! - [`approval`] - the approval gate and request lifecycle
//! - [`event`] - run events, sinks, and the per-run stream publisher
//! - [`fanout`] - the segment fan-out executor and batch aggregates
//! - [`engine`] - the facade tying it all together
//! - [`audit`] - optional best-effort output recorders
//! - [`config`] - engine configuration and wait policies

pub mod approval;
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod fanout;
pub mod workflow;

pub use engine::{Engine, RunHandle};
pub use error::EngineError;
