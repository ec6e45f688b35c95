//! Notification events.
//!
//! The engine emits events for the notification service to deliver; delivery
//! and retry belong to that service. Sinks receive events after the resource
//! lock has been released.

use std::collections::VecDeque;
#[cfg(not(target_arch = "wasm32"))]
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::util::clock::now_ms;
use crate::util::serde::{EntryId, RequesterId, ResourceId};

/// What happened to a requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A unit was granted (immediately or from the waitlist).
    Allocated,
    /// The requester joined a waitlist.
    Queued,
    /// The requester's waitlist position changed.
    PositionChanged,
    /// The entry was cancelled.
    Cancelled,
    /// The entry waited too long.
    Expired,
}

/// Event delivered to the notification service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEvent {
    /// Unique event identifier.
    pub event_id: String,
    /// Event kind.
    pub kind: EventKind,
    /// Resource concerned.
    pub resource_id: ResourceId,
    /// Requester to notify.
    pub requester_id: RequesterId,
    /// Waitlist entry, absent for immediate allocations.
    pub entry_id: Option<EntryId>,
    /// 1-based waitlist position for `Queued`/`PositionChanged`.
    pub position: Option<usize>,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
}

/// Event sink abstraction.
pub trait EventSink: Send + Sync {
    /// Deliver an event. Must not block.
    fn emit(&self, event: MatchEvent);
}

/// In-memory sink with a bounded buffer; the oldest events are dropped first.
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<MatchEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Create a new in-memory sink with a bounded buffer.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(4096))),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    pub fn events(&self) -> Vec<MatchEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Stored events of one kind.
    pub fn events_of(&self, kind: EventKind) -> Vec<MatchEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Drop all stored events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for InMemoryEventSink {
    fn emit(&self, event: MatchEvent) {
        if self.max_events == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Forwards events into a bounded crossbeam channel without blocking.
#[cfg(not(target_arch = "wasm32"))]
pub struct ChannelEventSink {
    tx: crossbeam_channel::Sender<MatchEvent>,
    dropped: AtomicU64,
}

#[cfg(not(target_arch = "wasm32"))]
impl ChannelEventSink {
    /// Create a sink and the receiver the notification service drains.
    pub fn bounded(capacity: usize) -> (Self, crossbeam_channel::Receiver<MatchEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events dropped because the channel was full or disconnected.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl EventSink for ChannelEventSink {
    fn emit(&self, event: MatchEvent) {
        if let Err(err) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let event = err.into_inner();
            tracing::warn!(
                kind = ?event.kind,
                resource_id = event.resource_id,
                dropped,
                "notification event dropped"
            );
        }
    }
}

/// Helper to build an event stamped with a fresh id and the current time.
pub fn build_event(
    kind: EventKind,
    resource_id: ResourceId,
    requester_id: impl Into<RequesterId>,
    entry_id: Option<EntryId>,
    position: Option<usize>,
) -> MatchEvent {
    MatchEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        kind,
        resource_id,
        requester_id: requester_id.into(),
        entry_id,
        position,
        created_at_ms: now_ms(),
    }
}
