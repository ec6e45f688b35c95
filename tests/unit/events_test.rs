//! Tests for notification event sinks

use commons_match::core::{build_event, ChannelEventSink, EventKind, EventSink, InMemoryEventSink};

#[test]
fn test_in_memory_event_sink() {
    let sink = InMemoryEventSink::new(10);
    sink.emit(build_event(EventKind::Queued, 4, "alice", Some(9), Some(2)));

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Queued);
    assert_eq!(events[0].resource_id, 4);
    assert_eq!(events[0].requester_id, "alice");
    assert_eq!(events[0].entry_id, Some(9));
    assert_eq!(events[0].position, Some(2));
    assert!(!events[0].event_id.is_empty());
}

#[test]
fn test_event_sink_overflow_drops_oldest() {
    let sink = InMemoryEventSink::new(2);
    for requester in ["a", "b", "c"] {
        sink.emit(build_event(EventKind::Allocated, 1, requester, None, None));
    }
    let requesters: Vec<_> = sink.events().into_iter().map(|e| e.requester_id).collect();
    assert_eq!(requesters, vec!["b", "c"]);
}

#[test]
fn test_event_ids_unique() {
    let a = build_event(EventKind::Expired, 1, "a", Some(1), None);
    let b = build_event(EventKind::Expired, 1, "a", Some(1), None);
    assert_ne!(a.event_id, b.event_id);
}

#[test]
fn test_channel_sink_counts_drops() {
    let (sink, rx) = ChannelEventSink::bounded(1);
    sink.emit(build_event(EventKind::Cancelled, 1, "a", Some(1), None));
    sink.emit(build_event(EventKind::Cancelled, 1, "b", Some(2), None));
    assert_eq!(sink.dropped(), 1);
    assert_eq!(rx.try_recv().unwrap().requester_id, "a");
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_event_serializes_snake_case() {
    let event = build_event(EventKind::PositionChanged, 2, "a", Some(3), Some(1));
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["kind"], "position_changed");
}
