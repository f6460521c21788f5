use greenlight::event::{RunEvent, RunEventStream};

/// Wire-level types of the events in order.
pub fn event_types(events: &[RunEvent]) -> Vec<&'static str> {
    events.iter().map(RunEvent::event_type).collect()
}

/// Every stream ends with exactly one terminal event, in last position.
pub fn assert_single_terminal(events: &[RunEvent]) {
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(
        terminals,
        1,
        "expected exactly one terminal event, got {terminals} in {:?}",
        event_types(events)
    );
    assert!(
        events.last().is_some_and(RunEvent::is_terminal),
        "terminal event must be last, got {:?}",
        event_types(events)
    );
}

/// Read events until the first `approval_required`, returning its approval
/// id and everything read so far (inclusive).
pub async fn read_until_approval(events: &mut RunEventStream) -> (String, Vec<RunEvent>) {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        let found = match &event {
            RunEvent::ApprovalRequired(e) => Some(e.approval_id.clone()),
            _ => None,
        };
        seen.push(event);
        if let Some(approval_id) = found {
            return (approval_id, seen);
        }
    }
    panic!(
        "stream ended without approval_required, saw {:?}",
        event_types(&seen)
    );
}
