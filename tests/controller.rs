mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use greenlight::config::{ApprovalWaitPolicy, EngineConfig};
use greenlight::engine::Engine;
use greenlight::error::EngineError;
use greenlight::event::{RunEvent, TerminalStatus};
use greenlight::workflow::{
    RunStatus, StepRegistry, StepSpec, ValidationError, WorkflowDefinition,
};
use serde_json::json;

fn patient_engine(registry: StepRegistry) -> Engine {
    Engine::new(registry).with_config(
        EngineConfig::default().with_approval_wait(ApprovalWaitPolicy::KeepWaiting),
    )
}

#[tokio::test]
async fn ungated_run_streams_results_then_completed() {
    let registry = StepRegistry::new()
        .register("concept", Arc::new(TitleOp { title: "Draft" }))
        .register("render", Arc::new(EchoOp));
    let definition = WorkflowDefinition::builder("plain")
        .step(StepSpec::new("concept"))
        .step(StepSpec::new("render").chained("concept", "/title"))
        .build()
        .expect("valid definition");

    let engine = patient_engine(registry);
    let mut handle = engine
        .start_run(definition, json!({"topic": "penguins"}), json!({}))
        .expect("start");
    let events = handle.take_events().expect("first take");
    let run_id = handle.run_id().to_string();

    let state = handle.join().await.expect("run succeeds");
    let seen = events.collect_remaining().await;

    assert_eq!(event_types(&seen), ["result", "result", "completed"]);
    assert_single_terminal(&seen);

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.steps_completed(), 2);
    assert_eq!(state.output("concept").expect("concept output")["title"], "Draft");
    assert_eq!(
        state.final_output().expect("render output")["echo"],
        json!("Draft")
    );
    assert_eq!(engine.run_status(&run_id), Some(RunStatus::Completed));
}

#[tokio::test]
async fn gated_run_suspends_then_resumes_with_merged_arguments() {
    let registry = StepRegistry::new().register("generate", Arc::new(EchoOp));
    let definition = WorkflowDefinition::builder("gated")
        .step(StepSpec::new("generate").gated())
        .build()
        .expect("valid definition");

    let engine = patient_engine(registry);
    let mut handle = engine
        .start_run(definition, json!({"budget": 5, "style": "plain"}), json!({"user": "u1"}))
        .expect("start");
    let mut events = handle.take_events().expect("first take");
    let run_id = handle.run_id().to_string();

    let (approval_id, before) = read_until_approval(&mut events).await;
    assert_eq!(event_types(&before), ["approval_required"]);

    // The suspended run has registered exactly one pending request.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let pending = engine.list_pending_approvals();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].run_id, run_id);
    assert!(matches!(
        engine.run_status(&run_id),
        Some(RunStatus::AwaitingApproval { step: 0, .. })
    ));

    engine
        .decide(&approval_id, true, Some(json!({"style": "vivid"})))
        .expect("decide");

    let state = handle.join().await.expect("run succeeds");
    let rest = events.collect_remaining().await;
    assert_eq!(event_types(&rest), ["result", "completed"]);

    let echoed = &state.final_output().expect("output")["echo"];
    assert_eq!(echoed["budget"], 5);
    assert_eq!(echoed["style"], "vivid");
    assert_eq!(state.status, RunStatus::Completed);
}

#[tokio::test]
async fn rejection_ends_the_run_without_executing_the_step() {
    let registry = StepRegistry::new().register("generate", Arc::new(EchoOp));
    let definition = WorkflowDefinition::builder("gated")
        .step(StepSpec::new("generate").gated())
        .build()
        .expect("valid definition");

    let engine = patient_engine(registry);
    let mut handle = engine
        .start_run(definition, json!({"budget": 5}), json!({}))
        .expect("start");
    let mut events = handle.take_events().expect("first take");

    let (approval_id, _) = read_until_approval(&mut events).await;
    engine.decide(&approval_id, false, None).expect("decide");

    let state = handle.join().await.expect("rejection is not an error");
    assert_eq!(state.status, RunStatus::Rejected { step: 0 });
    assert_eq!(state.steps_completed(), 0);
    assert!(state.final_output().is_none());

    let rest = events.collect_remaining().await;
    assert_eq!(event_types(&rest), ["log", "completed"]);
    match rest.last() {
        Some(RunEvent::Completed(e)) => {
            assert_eq!(e.status, TerminalStatus::Rejected);
            assert_eq!(e.steps_completed, 0);
        }
        other => panic!("expected completed terminal, got {other:?}"),
    }
}

#[tokio::test]
async fn failing_step_ends_the_stream_with_an_error_event() {
    let registry = StepRegistry::new().register("generate", Arc::new(FailingOp {
        message: "quota exhausted",
    }));
    let definition = WorkflowDefinition::builder("doomed")
        .step(StepSpec::new("generate"))
        .build()
        .expect("valid definition");

    let engine = patient_engine(registry);
    let mut handle = engine
        .start_run(definition, json!({}), json!({}))
        .expect("start");
    let events = handle.take_events().expect("first take");

    let err = handle.join().await.expect_err("run fails");
    assert!(matches!(err, EngineError::StepExecution { .. }));
    assert!(err.to_string().contains("quota exhausted"));

    let seen = events.collect_remaining().await;
    assert_eq!(event_types(&seen), ["error"]);
    assert_single_terminal(&seen);
    match &seen[0] {
        RunEvent::Error(e) => {
            assert_eq!(e.step.as_deref(), Some("generate"));
            assert!(e.message.contains("quota exhausted"));
        }
        other => panic!("expected error event, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_chained_field_fails_before_the_step_runs() {
    let registry = StepRegistry::new()
        .register("concept", Arc::new(TitleOp { title: "Draft" }))
        .register("render", Arc::new(EchoOp));
    let definition = WorkflowDefinition::builder("chained")
        .step(StepSpec::new("concept"))
        .step(StepSpec::new("render").chained("concept", "/no_such_field"))
        .build()
        .expect("valid definition");

    let engine = patient_engine(registry);
    let mut handle = engine
        .start_run(definition, json!({}), json!({}))
        .expect("start");
    let events = handle.take_events().expect("first take");

    let err = handle.join().await.expect_err("run fails");
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::MissingChainedField { .. })
    ));

    // The first step completed; the chain break surfaces on the second.
    let seen = events.collect_remaining().await;
    assert_eq!(event_types(&seen), ["result", "error"]);
    assert_single_terminal(&seen);
}

#[tokio::test]
async fn batch_partial_failure_is_reported_and_the_run_continues() {
    let registry = StepRegistry::new().register("render", Arc::new(FailOnId { bad_id: "b" }));
    let definition = WorkflowDefinition::builder("batch")
        .step(StepSpec::new("render").batch(false))
        .build()
        .expect("valid definition");

    let engine = patient_engine(registry);
    let mut handle = engine
        .start_run(
            definition,
            json!([{"id": "a"}, {"id": "b"}, {"id": "c"}]),
            json!({}),
        )
        .expect("start");
    let events = handle.take_events().expect("first take");

    let state = handle.join().await.expect("partial failure still completes");
    assert_eq!(state.status, RunStatus::Completed);

    let aggregate = state.output("render").expect("aggregate");
    assert_eq!(aggregate["total"], 3);
    assert_eq!(aggregate["succeeded"], 2);
    assert_eq!(aggregate["failed"], 1);
    assert_eq!(aggregate["overall_success"], false);
    assert_eq!(aggregate["results"][1]["item_id"], "b");
    assert_eq!(aggregate["results"][1]["status"], "failed");

    let seen = events.collect_remaining().await;
    let item_events = seen
        .iter()
        .filter(|event| matches!(event, RunEvent::StepResult(e) if e.item_id.is_some()))
        .count();
    assert_eq!(item_events, 3, "one result event per settled item");
    assert_single_terminal(&seen);
}

#[tokio::test]
async fn all_or_nothing_batch_escalates_to_a_run_failure() {
    let registry = StepRegistry::new().register("render", Arc::new(FailOnId { bad_id: "b" }));
    let definition = WorkflowDefinition::builder("strict-batch")
        .step(StepSpec::new("render").batch(true))
        .build()
        .expect("valid definition");

    let engine = patient_engine(registry);
    let mut handle = engine
        .start_run(
            definition,
            json!([{"id": "a"}, {"id": "b"}, {"id": "c"}]),
            json!({}),
        )
        .expect("start");
    let events = handle.take_events().expect("first take");

    let err = handle.join().await.expect_err("run fails");
    match err {
        EngineError::BatchFailed { failed, total, .. } => {
            assert_eq!(failed, 1);
            assert_eq!(total, 3);
        }
        other => panic!("expected batch failure, got {other}"),
    }

    // All items still settled and reported before the escalation.
    let seen = events.collect_remaining().await;
    let item_events = seen
        .iter()
        .filter(|event| matches!(event, RunEvent::StepResult(e) if e.item_id.is_some()))
        .count();
    assert_eq!(item_events, 3);
    assert_single_terminal(&seen);
    assert!(seen.last().is_some_and(|e| e.event_type() == "error"));
}

#[tokio::test]
async fn cancellation_ends_a_running_step_with_a_cancelled_terminal() {
    let registry = StepRegistry::new().register("slow", Arc::new(SleepOp { millis: 5_000 }));
    let definition = WorkflowDefinition::builder("cancellable")
        .step(StepSpec::new("slow"))
        .build()
        .expect("valid definition");

    let engine = patient_engine(registry);
    let mut handle = engine
        .start_run(definition, json!({}), json!({}))
        .expect("start");
    let events = handle.take_events().expect("first take");

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let state = handle.join().await.expect("cancellation is not an error");
    assert_eq!(state.status, RunStatus::Cancelled { step: 0 });
    assert_eq!(state.steps_completed(), 0);

    let seen = events.collect_remaining().await;
    assert_eq!(event_types(&seen), ["completed"]);
    match &seen[0] {
        RunEvent::Completed(e) => assert_eq!(e.status, TerminalStatus::Cancelled),
        other => panic!("expected completed terminal, got {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_while_suspended_withdraws_the_pending_request() {
    let registry = StepRegistry::new().register("generate", Arc::new(EchoOp));
    let definition = WorkflowDefinition::builder("gated")
        .step(StepSpec::new("generate").gated())
        .build()
        .expect("valid definition");

    let engine = patient_engine(registry);
    let mut handle = engine
        .start_run(definition, json!({}), json!({}))
        .expect("start");
    let mut events = handle.take_events().expect("first take");

    let (approval_id, _) = read_until_approval(&mut events).await;
    handle.cancel();

    let state = handle.join().await.expect("cancellation is not an error");
    assert_eq!(state.status, RunStatus::Cancelled { step: 0 });
    assert!(
        engine.get_approval_request(&approval_id).is_none(),
        "withdrawn request must not linger in the gate"
    );

    let rest = events.collect_remaining().await;
    assert_eq!(event_types(&rest), ["completed"]);
}

#[tokio::test]
async fn approval_timeout_fails_the_run_and_consumes_the_request() {
    let registry = StepRegistry::new().register("generate", Arc::new(EchoOp));
    let definition = WorkflowDefinition::builder("gated")
        .step(StepSpec::new("generate").gated())
        .build()
        .expect("valid definition");

    let engine = Engine::new(registry).with_config(
        EngineConfig::default()
            .with_approval_wait(ApprovalWaitPolicy::FailAfter(Duration::from_millis(50))),
    );
    let mut handle = engine
        .start_run(definition, json!({}), json!({}))
        .expect("start");
    let mut events = handle.take_events().expect("first take");

    let (approval_id, _) = read_until_approval(&mut events).await;

    let err = handle.join().await.expect_err("run fails");
    assert!(matches!(err, EngineError::ApprovalTimeout { .. }));
    assert!(
        engine.get_approval_request(&approval_id).is_none(),
        "timed-out request must not accept a late decision"
    );

    let rest = events.collect_remaining().await;
    assert_eq!(event_types(&rest), ["error"]);
}

#[tokio::test]
async fn second_decision_is_rejected_and_the_run_advances_once() {
    let registry = StepRegistry::new().register("generate", Arc::new(EchoOp));
    let definition = WorkflowDefinition::builder("gated")
        .step(StepSpec::new("generate").gated())
        .build()
        .expect("valid definition");

    let engine = patient_engine(registry);
    let mut handle = engine
        .start_run(definition, json!({"n": 1}), json!({}))
        .expect("start");
    let mut events = handle.take_events().expect("first take");

    let (approval_id, _) = read_until_approval(&mut events).await;
    engine.decide(&approval_id, true, None).expect("first decision");
    let second = engine.decide(&approval_id, false, None);
    assert!(second.is_err(), "a decision is final");

    let state = handle.join().await.expect("run succeeds");
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.steps_completed(), 1);

    let rest = events.collect_remaining().await;
    let results = rest
        .iter()
        .filter(|event| event.event_type() == "result")
        .count();
    assert_eq!(results, 1, "the gated step executed exactly once");
    assert_single_terminal(&rest);
}
