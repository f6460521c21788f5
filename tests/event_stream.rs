mod common;

use std::time::Duration;

use common::*;
use chrono::DateTime;
use futures_util::StreamExt;
use greenlight::event::{
    ChannelSink, MemorySink, RunEvent, RunPublisher, TerminalStatus,
};
use serde_json::json;
use tokio::sync::mpsc;

fn sample_events() -> Vec<RunEvent> {
    vec![
        RunEvent::log("run-1", None, "setup", "starting"),
        RunEvent::step_result("run-1", "concept", json!({"title": "draft"})),
        RunEvent::completed("run-1", TerminalStatus::Completed, 1),
    ]
}

#[tokio::test]
async fn events_arrive_in_publish_order() {
    let sink = MemorySink::new();
    let snapshot = sink.clone();
    let (publisher, events) = RunPublisher::open(vec![Box::new(sink)]);

    for event in sample_events() {
        publisher.publish(event).expect("publish");
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    publisher.close().await;

    let seen = events.collect_remaining().await;
    assert_eq!(event_types(&seen), ["log", "result", "completed"]);
    assert_single_terminal(&seen);

    // Attached sinks observe the same sequence as the subscriber.
    assert_eq!(event_types(&snapshot.snapshot()), ["log", "result", "completed"]);
}

#[tokio::test]
async fn close_flushes_events_published_just_before() {
    let (publisher, events) = RunPublisher::open(Vec::new());

    for event in sample_events() {
        publisher.publish(event).expect("publish");
    }
    // No sleep: close must drain what was already published.
    publisher.close().await;

    let seen = events.collect_remaining().await;
    assert_eq!(seen.len(), 3);
    assert_single_terminal(&seen);
}

#[tokio::test]
async fn close_is_idempotent() {
    let (publisher, events) = RunPublisher::open(Vec::new());
    publisher
        .publish(RunEvent::completed("run-1", TerminalStatus::Completed, 0))
        .expect("publish");

    publisher.close().await;
    publisher.close().await;

    let seen = events.collect_remaining().await;
    assert_eq!(seen.len(), 1);
}

#[tokio::test]
async fn closing_without_events_is_a_noop() {
    let (publisher, events) = RunPublisher::open(Vec::new());
    publisher.close().await;
    assert!(events.collect_remaining().await.is_empty());
}

#[tokio::test]
async fn subscriber_disconnect_is_observed() {
    let (publisher, events) = RunPublisher::open(Vec::new());
    assert!(publisher.subscriber_connected());

    drop(events);
    publisher
        .publish(RunEvent::log("run-1", None, "work", "still going"))
        .expect("publish");
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(
        !publisher.subscriber_connected(),
        "a dropped subscriber must be detected on the next dispatch"
    );
    publisher.close().await;
}

#[tokio::test]
async fn channel_sink_forwards_every_event() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (publisher, _events) = RunPublisher::open(vec![Box::new(ChannelSink::new(tx))]);

    for event in sample_events() {
        publisher.publish(event).expect("publish");
    }
    publisher.close().await;

    let mut forwarded = Vec::new();
    while let Ok(event) = rx.try_recv() {
        forwarded.push(event);
    }
    assert_eq!(event_types(&forwarded), ["log", "result", "completed"]);
}

#[tokio::test]
async fn async_stream_adapter_yields_the_same_sequence() {
    let (publisher, events) = RunPublisher::open(Vec::new());

    for event in sample_events() {
        publisher.publish(event).expect("publish");
    }
    publisher.close().await;

    let collected: Vec<RunEvent> = events.into_async_stream().collect().await;
    assert_eq!(event_types(&collected), ["log", "result", "completed"]);
}

#[tokio::test]
async fn next_timeout_returns_none_when_nothing_arrives() {
    let (publisher, mut events) = RunPublisher::open(Vec::new());

    let got = events.next_timeout(Duration::from_millis(20)).await;
    assert!(got.is_none());

    publisher
        .publish(RunEvent::log("run-1", None, "late", "finally"))
        .expect("publish");
    let got = events
        .next_timeout(Duration::from_millis(200))
        .await
        .expect("event arrives within the deadline");
    assert_eq!(got.event_type(), "log");
    publisher.close().await;
}

#[test]
fn wire_framing_carries_type_data_and_timestamp() {
    let event = RunEvent::approval_required(
        "run-1",
        "appr-1",
        "concept",
        json!({"budget": 5}),
    );
    let wire = event.to_json_value();

    assert_eq!(wire["type"], "approval_required");
    assert_eq!(wire["data"]["approval_id"], "appr-1");
    assert_eq!(wire["data"]["step"], "concept");
    assert_eq!(wire["data"]["arguments"]["budget"], 5);
    let stamp = wire["timestamp"].as_str().expect("timestamp string");
    DateTime::parse_from_rfc3339(stamp).expect("RFC-3339 timestamp");
}

#[test]
fn wire_framing_for_terminal_events() {
    let error = RunEvent::error("run-1", Some("render".to_string()), "provider refused");
    let wire = error.to_json_value();
    assert_eq!(wire["type"], "error");
    assert_eq!(wire["data"]["step"], "render");
    assert_eq!(wire["data"]["message"], "provider refused");

    let completed = RunEvent::completed("run-1", TerminalStatus::Rejected, 2);
    let wire = completed.to_json_value();
    assert_eq!(wire["type"], "completed");
    assert_eq!(wire["data"]["status"], "rejected");
    assert_eq!(wire["data"]["steps_completed"], 2);

    let item = RunEvent::item_result("run-1", "render", "seg-1", json!({"ok": true}));
    let wire = item.to_json_value();
    assert_eq!(wire["type"], "result");
    assert_eq!(wire["data"]["item_id"], "seg-1");
}
