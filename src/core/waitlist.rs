//! Per-resource waitlists and unit accounting.
//!
//! Every resource owns a ledger behind its own `parking_lot::Mutex`.
//! The ledger holds the unit counts together with the ordered pending queue,
//! so every read-modify-write on one resource is serialized by that single
//! lock while different resources proceed in parallel. No call ever holds two
//! ledger locks.
//!
//! Queue order is `(priority desc, enqueued_at asc, arrival asc)` with
//! unscored entries after every scored one. The queue is kept sorted on
//! insertion (binary search), so positions are always current.
//!
//! Notification events are collected while the lock is held and handed to the
//! sink after it is released.
//!
//! Status changes are reported to the [`StatusObserver`] while the ledger
//! lock is still held, so an observer never sees them out of order.
//!
//! Each resource keeps its newest `max_retained_terminal` terminal entries;
//! older ones are forgotten and look up as `UnknownEntry`.
//!
//! Lock order: ledger mutex, then the observer, then the entry index. Nothing
//! takes the entry index and then a ledger.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::core::events::{build_event, EventKind, EventSink, MatchEvent};
use crate::core::MatchError;
use crate::util::serde::{EntryId, EntryStatus, RequesterId, ResourceId, ResourceStatus};

/// Waitlist configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitlistConfig {
    /// Pending entries older than this are expired by the sweeper.
    pub max_wait_secs: u64,
    /// Maximum pending entries per resource.
    pub max_depth: usize,
    /// Terminal entries kept per resource for lookup.
    pub max_retained_terminal: usize,
}

impl Default for WaitlistConfig {
    fn default() -> Self {
        Self {
            max_wait_secs: 14 * 24 * 60 * 60,
            max_depth: 1024,
            max_retained_terminal: 1024,
        }
    }
}

impl WaitlistConfig {
    /// Validate values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_wait_secs == 0 {
            return Err("max_wait_secs must be greater than 0".into());
        }
        if self.max_depth == 0 {
            return Err("max_depth must be greater than 0".into());
        }
        if self.max_retained_terminal == 0 {
            return Err("max_retained_terminal must be greater than 0".into());
        }
        Ok(())
    }

    const fn max_wait_ms(&self) -> u128 {
        self.max_wait_secs as u128 * 1000
    }
}

/// A requester's place on a resource's waitlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    /// Entry identifier, never reused.
    pub id: EntryId,
    /// Resource waited on.
    pub resource_id: ResourceId,
    /// Requester waiting.
    pub requester_id: RequesterId,
    /// Priority score; `None` until scored.
    pub priority: Option<f64>,
    /// When the entry was enqueued.
    pub enqueued_at_ms: u128,
    /// Arrival order within the resource; breaks timestamp ties.
    pub arrival: u64,
    /// Lifecycle status.
    pub status: EntryStatus,
}

/// A pending entry with its 1-based queue position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEntry {
    /// The entry.
    pub entry: WaitlistEntry,
    /// Position at the time of the call; 1 is next in line.
    pub position: usize,
}

/// Outcome of [`WaitlistManager::admit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Admission {
    /// A unit was free and has been granted.
    Allocated {
        /// Units granted.
        units_granted: u32,
    },
    /// No unit was free; the requester was queued.
    Queued(QueuedEntry),
}

/// Point-in-time unit and status figures for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Resource identifier.
    pub resource_id: ResourceId,
    /// Total units offered.
    pub total: u32,
    /// Units free right now.
    pub available: u32,
    /// Units currently held by requesters.
    pub outstanding: u32,
    /// Resource status.
    pub status: ResourceStatus,
    /// Pending entries.
    pub waitlist_len: usize,
}

/// Aggregate waitlist statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitlistStats {
    /// Registered resources.
    pub resources: usize,
    /// Resources with status `Exhausted`.
    pub exhausted_resources: usize,
    /// Resources with status `Withdrawn`.
    pub withdrawn_resources: usize,
    /// Pending entries across all resources.
    pub pending_entries: usize,
    /// Admission decisions taken.
    pub admissions: u64,
    /// Units granted on admission.
    pub immediate_allocations: u64,
    /// Units granted to waitlist entries.
    pub waitlist_allocations: u64,
    /// Entries created.
    pub enqueued: u64,
    /// Entries cancelled (including by withdrawal).
    pub cancelled: u64,
    /// Entries expired.
    pub expired: u64,
    /// Enqueue attempts rejected as duplicates.
    pub duplicates_rejected: u64,
    /// Share of admissions that found no free unit.
    pub exhaustion_rate: f64,
}

impl WaitlistStats {
    /// Units granted in total.
    pub const fn allocations(&self) -> u64 {
        self.immediate_allocations + self.waitlist_allocations
    }
}

/// Internal counters for waitlist statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct WaitlistCounters {
    pub admissions: AtomicU64,
    pub exhausted_admissions: AtomicU64,
    pub immediate_allocations: AtomicU64,
    pub waitlist_allocations: AtomicU64,
    pub enqueued: AtomicU64,
    pub cancelled: AtomicU64,
    pub expired: AtomicU64,
    pub duplicates_rejected: AtomicU64,
}

impl WaitlistCounters {
    fn bump(counter: &AtomicU64, by: usize) {
        counter.fetch_add(by as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of the counters; resource figures are filled by the caller.
    pub fn snapshot(&self) -> WaitlistStats {
        let admissions = self.admissions.load(Ordering::Relaxed);
        let exhausted = self.exhausted_admissions.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let exhaustion_rate = if admissions == 0 {
            0.0
        } else {
            exhausted as f64 / admissions as f64
        };
        WaitlistStats {
            admissions,
            immediate_allocations: self.immediate_allocations.load(Ordering::Relaxed),
            waitlist_allocations: self.waitlist_allocations.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            duplicates_rejected: self.duplicates_rejected.load(Ordering::Relaxed),
            exhaustion_rate,
            ..WaitlistStats::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct QueueKey {
    priority: Option<f64>,
    enqueued_at_ms: u128,
    arrival: u64,
    entry_id: EntryId,
}

impl QueueKey {
    const fn of(entry: &WaitlistEntry) -> Self {
        Self {
            priority: entry.priority,
            enqueued_at_ms: entry.enqueued_at_ms,
            arrival: entry.arrival,
            entry_id: entry.id,
        }
    }

    fn cmp_order(&self, other: &Self) -> CmpOrdering {
        let by_priority = match (self.priority, other.priority) {
            (Some(a), Some(b)) => b.total_cmp(&a),
            (Some(_), None) => CmpOrdering::Less,
            (None, Some(_)) => CmpOrdering::Greater,
            (None, None) => CmpOrdering::Equal,
        };
        by_priority
            .then(self.enqueued_at_ms.cmp(&other.enqueued_at_ms))
            .then(self.arrival.cmp(&other.arrival))
    }
}

/// Unit counts, status and pending queue of one resource.
struct ResourceLedger {
    resource_id: ResourceId,
    total: u32,
    available: u32,
    outstanding: u32,
    status: ResourceStatus,
    queue: VecDeque<QueueKey>,
    entries: HashMap<EntryId, WaitlistEntry>,
    pending_by_requester: HashMap<RequesterId, EntryId>,
    /// Terminal entries, oldest first.
    terminal: VecDeque<EntryId>,
    next_arrival: u64,
}

impl ResourceLedger {
    fn new(resource_id: ResourceId, total: u32) -> Self {
        Self {
            resource_id,
            total,
            available: total,
            outstanding: 0,
            status: ResourceStatus::Active,
            queue: VecDeque::new(),
            entries: HashMap::new(),
            pending_by_requester: HashMap::new(),
            terminal: VecDeque::new(),
            next_arrival: 0,
        }
    }

    fn violation(&self, detail: impl Into<String>) -> MatchError {
        let detail = detail.into();
        tracing::error!(resource_id = self.resource_id, %detail, "capacity invariant violated");
        if cfg!(debug_assertions) {
            panic!("capacity invariant violated on resource {}: {detail}", self.resource_id);
        }
        MatchError::CapacityInvariantViolation {
            resource_id: self.resource_id,
            detail,
        }
    }

    fn check(&self) -> Result<(), MatchError> {
        if self.available > self.total {
            return Err(self.violation(format!(
                "available {} exceeds total {}",
                self.available, self.total
            )));
        }
        if self.available.checked_add(self.outstanding) != Some(self.total) {
            return Err(self.violation(format!(
                "available {} + outstanding {} != total {}",
                self.available, self.outstanding, self.total
            )));
        }
        if self.queue.len() != self.pending_by_requester.len() {
            return Err(self.violation(format!(
                "{} queued entries but {} pending requesters",
                self.queue.len(),
                self.pending_by_requester.len()
            )));
        }
        Ok(())
    }

    fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            resource_id: self.resource_id,
            total: self.total,
            available: self.available,
            outstanding: self.outstanding,
            status: self.status,
            waitlist_len: self.queue.len(),
        }
    }

    fn queue_index(&self, key: &QueueKey) -> Option<usize> {
        self.queue
            .binary_search_by(|k| k.cmp_order(key))
            .ok()
            .filter(|&i| self.queue[i].entry_id == key.entry_id)
    }

    fn notify_positions(&self, range: std::ops::Range<usize>, events: &mut Vec<MatchEvent>) {
        for (i, key) in self.queue.iter().enumerate().take(range.end).skip(range.start) {
            if let Some(entry) = self.entries.get(&key.entry_id) {
                events.push(build_event(
                    EventKind::PositionChanged,
                    self.resource_id,
                    entry.requester_id.clone(),
                    Some(entry.id),
                    Some(i + 1),
                ));
            }
        }
    }

    /// Insert a new pending entry; returns its 1-based position.
    fn insert_pending(&mut self, entry: WaitlistEntry, events: &mut Vec<MatchEvent>) -> usize {
        let key = QueueKey::of(&entry);
        let idx = self
            .queue
            .partition_point(|k| k.cmp_order(&key) == CmpOrdering::Less);
        self.queue.insert(idx, key);
        self.pending_by_requester
            .insert(entry.requester_id.clone(), entry.id);
        events.push(build_event(
            EventKind::Queued,
            self.resource_id,
            entry.requester_id.clone(),
            Some(entry.id),
            Some(idx + 1),
        ));
        self.entries.insert(entry.id, entry);
        self.notify_positions(idx + 1..self.queue.len(), events);
        idx + 1
    }

    /// Move a pending entry to a terminal status other than `Allocated`.
    fn take_pending(
        &mut self,
        entry_id: EntryId,
        status: EntryStatus,
        events: &mut Vec<MatchEvent>,
    ) -> Result<WaitlistEntry, MatchError> {
        let kind = match status {
            EntryStatus::Expired => EventKind::Expired,
            EntryStatus::Cancelled => EventKind::Cancelled,
            EntryStatus::Pending | EntryStatus::Allocated => {
                return Err(self.violation(format!(
                    "entry {entry_id} cannot leave the queue as {status:?}"
                )));
            }
        };
        let key = match self.entries.get(&entry_id) {
            None => return Err(MatchError::UnknownEntry(entry_id)),
            Some(e) if e.status.is_terminal() => {
                return Err(MatchError::AlreadyTerminal {
                    entry_id,
                    status: e.status,
                })
            }
            Some(e) => QueueKey::of(e),
        };
        let Some(idx) = self.queue_index(&key) else {
            return Err(self.violation(format!("pending entry {entry_id} missing from queue")));
        };
        self.queue.remove(idx);
        let Some(entry) = self.entries.get_mut(&entry_id) else {
            return Err(MatchError::UnknownEntry(entry_id));
        };
        entry.status = status;
        let done = entry.clone();
        self.pending_by_requester.remove(&done.requester_id);
        self.terminal.push_back(entry_id);

        events.push(build_event(
            kind,
            self.resource_id,
            done.requester_id.clone(),
            Some(entry_id),
            None,
        ));
        self.notify_positions(idx..self.queue.len(), events);
        Ok(done)
    }

    /// Grant one unit to each head entry while `budget` and free units last.
    fn grant_heads(
        &mut self,
        mut budget: u32,
        events: &mut Vec<MatchEvent>,
    ) -> Result<Vec<WaitlistEntry>, MatchError> {
        let mut granted = Vec::new();
        while budget > 0 && self.available > 0 {
            let Some(key) = self.queue.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&key.entry_id) else {
                return Err(self.violation(format!("queued entry {} has no record", key.entry_id)));
            };
            entry.status = EntryStatus::Allocated;
            let entry = entry.clone();
            self.pending_by_requester.remove(&entry.requester_id);
            self.terminal.push_back(entry.id);
            budget -= 1;
            self.available -= 1;
            self.outstanding += 1;
            events.push(build_event(
                EventKind::Allocated,
                self.resource_id,
                entry.requester_id.clone(),
                Some(entry.id),
                None,
            ));
            granted.push(entry);
        }
        if !granted.is_empty() {
            self.notify_positions(0..self.queue.len(), events);
        }
        Ok(granted)
    }

    /// Take one free unit for an immediate allocation.
    fn allocate_now(&mut self) -> Result<(), MatchError> {
        if self.available == 0 {
            return Err(self.violation("immediate allocation with no free unit"));
        }
        self.available -= 1;
        self.outstanding += 1;
        Ok(())
    }

    /// Forget the oldest terminal entries beyond `keep`. Returns their ids.
    fn prune_terminal(&mut self, keep: usize) -> Vec<EntryId> {
        let excess = self.terminal.len().saturating_sub(keep);
        let evicted: Vec<EntryId> = self.terminal.drain(..excess).collect();
        for entry_id in &evicted {
            self.entries.remove(entry_id);
        }
        evicted
    }

    fn ordered_pending(&self) -> Vec<WaitlistEntry> {
        self.queue
            .iter()
            .filter_map(|k| self.entries.get(&k.entry_id).cloned())
            .collect()
    }
}

/// Reject requester ids that are empty or only whitespace.
pub fn validate_requester(requester_id: &str) -> Result<(), MatchError> {
    if requester_id.trim().is_empty() {
        return Err(MatchError::InvalidRequester(format!("{requester_id:?}")));
    }
    Ok(())
}

/// Lock-free mirror of a ledger for read-only aggregate queries.
#[derive(Default)]
struct LedgerMirror {
    total: AtomicU32,
    available: AtomicU32,
    outstanding: AtomicU32,
    pending: AtomicUsize,
    status: AtomicU8,
    requests: AtomicU64,
}

const fn status_code(status: ResourceStatus) -> u8 {
    match status {
        ResourceStatus::Active => 0,
        ResourceStatus::Exhausted => 1,
        ResourceStatus::Withdrawn => 2,
    }
}

const fn status_from_code(code: u8) -> ResourceStatus {
    match code {
        0 => ResourceStatus::Active,
        1 => ResourceStatus::Exhausted,
        _ => ResourceStatus::Withdrawn,
    }
}

impl LedgerMirror {
    fn publish(&self, ledger: &ResourceLedger) {
        self.total.store(ledger.total, Ordering::Release);
        self.available.store(ledger.available, Ordering::Release);
        self.outstanding.store(ledger.outstanding, Ordering::Release);
        self.pending.store(ledger.queue.len(), Ordering::Release);
        self.status.store(status_code(ledger.status), Ordering::Release);
    }

    fn read(&self, resource_id: ResourceId) -> LedgerSnapshot {
        LedgerSnapshot {
            resource_id,
            total: self.total.load(Ordering::Acquire),
            available: self.available.load(Ordering::Acquire),
            outstanding: self.outstanding.load(Ordering::Acquire),
            status: status_from_code(self.status.load(Ordering::Acquire)),
            waitlist_len: self.pending.load(Ordering::Acquire),
        }
    }
}

struct ResourceSlot {
    ledger: Mutex<ResourceLedger>,
    mirror: LedgerMirror,
}

/// Receives resource status changes.
///
/// Called with the resource's ledger lock held: implementations must not call
/// back into the [`WaitlistManager`].
pub trait StatusObserver: Send + Sync {
    /// `resource_id` is now `status`.
    fn status_changed(&self, resource_id: ResourceId, status: ResourceStatus);
}

/// Owner of every resource ledger and waitlist.
pub struct WaitlistManager {
    config: WaitlistConfig,
    slots: RwLock<HashMap<ResourceId, Arc<ResourceSlot>>>,
    entry_index: RwLock<HashMap<EntryId, ResourceId>>,
    next_entry_id: AtomicU64,
    counters: WaitlistCounters,
    requester_activity: Mutex<HashMap<RequesterId, u64>>,
    events: Option<Arc<dyn EventSink>>,
    observer: OnceLock<Arc<dyn StatusObserver>>,
}

impl WaitlistManager {
    /// Create a manager with no resources.
    pub fn new(config: WaitlistConfig) -> Self {
        Self {
            config,
            slots: RwLock::new(HashMap::new()),
            entry_index: RwLock::new(HashMap::new()),
            next_entry_id: AtomicU64::new(1),
            counters: WaitlistCounters::default(),
            requester_activity: Mutex::new(HashMap::new()),
            events: None,
            observer: OnceLock::new(),
        }
    }

    /// Attach a notification sink.
    #[must_use]
    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Attach the status observer. Returns false if one is already attached.
    pub fn set_status_observer(&self, observer: Arc<dyn StatusObserver>) -> bool {
        let attached = self.observer.set(observer).is_ok();
        if !attached {
            tracing::warn!("status observer already attached");
        }
        attached
    }

    /// Configuration in use.
    pub const fn config(&self) -> &WaitlistConfig {
        &self.config
    }

    fn slot(&self, resource_id: ResourceId) -> Result<Arc<ResourceSlot>, MatchError> {
        self.slots
            .read()
            .get(&resource_id)
            .cloned()
            .ok_or(MatchError::UnknownResource(resource_id))
    }

    fn resource_of(&self, entry_id: EntryId) -> Result<ResourceId, MatchError> {
        self.entry_index
            .read()
            .get(&entry_id)
            .copied()
            .ok_or(MatchError::UnknownEntry(entry_id))
    }

    fn emit_all(&self, events: Vec<MatchEvent>) {
        if let Some(sink) = &self.events {
            for event in events {
                sink.emit(event);
            }
        }
    }

    /// Run `f` under the resource's lock, then verify the ledger, report a
    /// status change, prune old terminal entries and refresh the mirror. The
    /// collected events are emitted once the lock is released.
    fn mutate<R>(
        &self,
        slot: &ResourceSlot,
        f: impl FnOnce(&mut ResourceLedger, &mut Vec<MatchEvent>) -> Result<R, MatchError>,
    ) -> Result<R, MatchError> {
        let mut events = Vec::new();
        let result = {
            let mut ledger = slot.ledger.lock();
            let before = ledger.status;
            let result = f(&mut *ledger, &mut events).and_then(|r| ledger.check().map(|()| r));
            if ledger.status != before {
                if let Some(observer) = self.observer.get() {
                    observer.status_changed(ledger.resource_id, ledger.status);
                }
            }
            let evicted = ledger.prune_terminal(self.config.max_retained_terminal);
            if !evicted.is_empty() {
                let mut index = self.entry_index.write();
                for entry_id in &evicted {
                    index.remove(entry_id);
                }
            }
            slot.mirror.publish(&*ledger);
            result
        };
        if result.is_ok() {
            self.emit_all(events);
        }
        result
    }

    fn with_ledger<R>(
        &self,
        resource_id: ResourceId,
        f: impl FnOnce(&mut ResourceLedger, &mut Vec<MatchEvent>) -> Result<R, MatchError>,
    ) -> Result<R, MatchError> {
        let slot = self.slot(resource_id)?;
        self.mutate(&slot, f)
    }

    /// Run `f` with the resource's current status while holding its lock, so
    /// no status change can interleave with `f`.
    pub fn with_status<R>(
        &self,
        resource_id: ResourceId,
        f: impl FnOnce(ResourceStatus) -> Result<R, MatchError>,
    ) -> Result<R, MatchError> {
        let slot = self.slot(resource_id)?;
        let ledger = slot.ledger.lock();
        f(ledger.status)
    }

    /// Register a resource offering `total` units.
    pub fn register(&self, resource_id: ResourceId, total: u32) -> Result<LedgerSnapshot, MatchError> {
        if total == 0 {
            return Err(MatchError::InvalidUnits {
                resource_id,
                detail: "a resource needs at least one unit".into(),
            });
        }
        let mut slots = self.slots.write();
        if slots.contains_key(&resource_id) {
            return Err(MatchError::ResourceExists(resource_id));
        }
        let ledger = ResourceLedger::new(resource_id, total);
        let snapshot = ledger.snapshot();
        let slot = ResourceSlot {
            mirror: LedgerMirror::default(),
            ledger: Mutex::new(ledger),
        };
        slot.mirror.publish(&slot.ledger.lock());
        slots.insert(resource_id, Arc::new(slot));
        tracing::info!(resource_id, total, "resource registered");
        Ok(snapshot)
    }

    fn new_entry(
        &self,
        ledger: &mut ResourceLedger,
        requester_id: &str,
        priority: Option<f64>,
        now_ms: u128,
    ) -> WaitlistEntry {
        let id = self.next_entry_id.fetch_add(1, Ordering::Relaxed);
        let arrival = ledger.next_arrival;
        ledger.next_arrival += 1;
        let priority = priority.filter(|p| {
            let finite = p.is_finite();
            if !finite {
                tracing::debug!(entry_id = id, "non-finite priority treated as unscored");
            }
            finite
        });
        WaitlistEntry {
            id,
            resource_id: ledger.resource_id,
            requester_id: requester_id.to_string(),
            priority,
            enqueued_at_ms: now_ms,
            arrival,
            status: EntryStatus::Pending,
        }
    }

    fn check_admissible(
        &self,
        ledger: &ResourceLedger,
        requester_id: &str,
    ) -> Result<(), MatchError> {
        validate_requester(requester_id)?;
        if ledger.pending_by_requester.contains_key(requester_id) {
            self.counters.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(MatchError::DuplicatePending {
                resource_id: ledger.resource_id,
                requester_id: requester_id.to_string(),
            });
        }
        Ok(())
    }

    fn push_entry(
        &self,
        ledger: &mut ResourceLedger,
        requester_id: &str,
        priority: Option<f64>,
        now_ms: u128,
        events: &mut Vec<MatchEvent>,
    ) -> Result<QueuedEntry, MatchError> {
        if ledger.queue.len() >= self.config.max_depth {
            tracing::warn!(
                resource_id = ledger.resource_id,
                depth = ledger.queue.len(),
                "waitlist full"
            );
            return Err(MatchError::WaitlistFull {
                resource_id: ledger.resource_id,
                max_depth: self.config.max_depth,
            });
        }
        let entry = self.new_entry(ledger, requester_id, priority, now_ms);
        self.entry_index.write().insert(entry.id, ledger.resource_id);
        let position = ledger.insert_pending(entry.clone(), events);
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            resource_id = ledger.resource_id,
            entry_id = entry.id,
            position,
            "requester queued"
        );
        Ok(QueuedEntry { entry, position })
    }

    /// Put a requester on a resource's waitlist.
    ///
    /// Fails with `DuplicatePending` if the requester already waits on this
    /// resource. Free units are not consulted; see [`Self::admit`].
    pub fn enqueue(
        &self,
        resource_id: ResourceId,
        requester_id: &str,
        priority: Option<f64>,
        now_ms: u128,
    ) -> Result<QueuedEntry, MatchError> {
        let slot = self.slot(resource_id)?;
        let queued = self.mutate(&slot, |ledger, events| {
            if ledger.status == ResourceStatus::Withdrawn {
                return Err(MatchError::ResourceInactive {
                    resource_id,
                    status: ledger.status,
                });
            }
            self.check_admissible(ledger, requester_id)?;
            self.push_entry(ledger, requester_id, priority, now_ms, events)
        })?;
        slot.mirror.requests.fetch_add(1, Ordering::Relaxed);
        self.record_activity(requester_id);
        Ok(queued)
    }

    /// Allocate a free unit or, failing that, enqueue; one lock acquisition.
    ///
    /// Free units are first settled onto existing waitlist heads so that a
    /// newcomer never overtakes someone already waiting.
    pub fn admit(
        &self,
        resource_id: ResourceId,
        requester_id: &str,
        priority: Option<f64>,
        now_ms: u128,
    ) -> Result<Admission, MatchError> {
        let slot = self.slot(resource_id)?;
        let admission = self.mutate(&slot, |ledger, events| {
            if !ledger.status.is_searchable() {
                return Err(MatchError::ResourceInactive {
                    resource_id,
                    status: ledger.status,
                });
            }
            self.check_admissible(ledger, requester_id)?;

            let settled = ledger.grant_heads(u32::MAX, events)?;
            WaitlistCounters::bump(&self.counters.waitlist_allocations, settled.len());

            if ledger.available > 0 {
                ledger.allocate_now()?;
                events.push(build_event(
                    EventKind::Allocated,
                    resource_id,
                    requester_id,
                    None,
                    None,
                ));
                self.counters.immediate_allocations.fetch_add(1, Ordering::Relaxed);
                tracing::info!(resource_id, requester_id, "unit allocated");
                return Ok(Admission::Allocated { units_granted: 1 });
            }
            let queued = self.push_entry(ledger, requester_id, priority, now_ms, events)?;
            self.counters
                .exhausted_admissions
                .fetch_add(1, Ordering::Relaxed);
            Ok(Admission::Queued(queued))
        })?;
        self.counters.admissions.fetch_add(1, Ordering::Relaxed);
        slot.mirror.requests.fetch_add(1, Ordering::Relaxed);
        self.record_activity(requester_id);
        Ok(admission)
    }

    fn record_activity(&self, requester_id: &str) {
        let mut activity = self.requester_activity.lock();
        if let Some(count) = activity.get_mut(requester_id) {
            *count += 1;
        } else {
            activity.insert(requester_id.to_string(), 1);
        }
    }

    /// Cancel a pending entry.
    ///
    /// Cancelling a terminal entry fails with `AlreadyTerminal` and changes nothing.
    pub fn cancel(&self, entry_id: EntryId) -> Result<WaitlistEntry, MatchError> {
        let resource_id = self.resource_of(entry_id)?;
        let entry = self.with_ledger(resource_id, |ledger, events| {
            ledger.take_pending(entry_id, EntryStatus::Cancelled, events)
        })?;
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::info!(resource_id, entry_id, "entry cancelled");
        Ok(entry)
    }

    /// Units came back from holders: free them and grant up to `units_freed`
    /// head entries, one unit each. Returns the entries allocated, in order.
    pub fn try_allocate(
        &self,
        resource_id: ResourceId,
        units_freed: u32,
    ) -> Result<Vec<WaitlistEntry>, MatchError> {
        let granted = self.with_ledger(resource_id, |ledger, events| {
            if units_freed > ledger.outstanding {
                return Err(MatchError::InvalidUnits {
                    resource_id,
                    detail: format!(
                        "{units_freed} units returned but only {} outstanding",
                        ledger.outstanding
                    ),
                });
            }
            ledger.outstanding -= units_freed;
            ledger.available += units_freed;
            ledger.grant_heads(units_freed, events)
        })?;
        WaitlistCounters::bump(&self.counters.waitlist_allocations, granted.len());
        if !granted.is_empty() {
            tracing::info!(resource_id, granted = granted.len(), "waitlist allocation");
        }
        Ok(granted)
    }

    fn add_units(
        ledger: &mut ResourceLedger,
        units: u32,
        events: &mut Vec<MatchEvent>,
    ) -> Result<Vec<WaitlistEntry>, MatchError> {
        let resource_id = ledger.resource_id;
        if ledger.status == ResourceStatus::Withdrawn {
            return Err(MatchError::ResourceInactive {
                resource_id,
                status: ledger.status,
            });
        }
        let Some(total) = ledger.total.checked_add(units) else {
            return Err(MatchError::InvalidUnits {
                resource_id,
                detail: "unit count overflow".into(),
            });
        };
        ledger.total = total;
        ledger.available += units;
        if ledger.status == ResourceStatus::Exhausted {
            ledger.status = ResourceStatus::Active;
            tracing::info!(resource_id, "resource re-activated");
        }
        ledger.grant_heads(units, events)
    }

    /// Add new stock. Re-activates an exhausted resource and grants the new
    /// units to waiting entries.
    pub fn restock(
        &self,
        resource_id: ResourceId,
        units: u32,
    ) -> Result<Vec<WaitlistEntry>, MatchError> {
        if units == 0 {
            return Err(MatchError::InvalidUnits {
                resource_id,
                detail: "restock needs at least one unit".into(),
            });
        }
        let granted =
            self.with_ledger(resource_id, |ledger, events| Self::add_units(ledger, units, events))?;
        WaitlistCounters::bump(&self.counters.waitlist_allocations, granted.len());
        tracing::info!(resource_id, units, granted = granted.len(), "resource restocked");
        Ok(granted)
    }

    /// Set the total unit count.
    ///
    /// Raising behaves like [`Self::restock`]. Lowering removes free units
    /// only and fails when units on loan would exceed the new total. A total
    /// of zero marks the resource `Exhausted`.
    pub fn adjust_total(
        &self,
        resource_id: ResourceId,
        new_total: u32,
    ) -> Result<Vec<WaitlistEntry>, MatchError> {
        let granted = self.with_ledger(resource_id, |ledger, events| {
            if new_total > ledger.total {
                return Self::add_units(ledger, new_total - ledger.total, events);
            }
            if ledger.status == ResourceStatus::Withdrawn {
                return Err(MatchError::ResourceInactive {
                    resource_id,
                    status: ledger.status,
                });
            }
            if new_total < ledger.outstanding {
                return Err(MatchError::InvalidUnits {
                    resource_id,
                    detail: format!(
                        "cannot shrink to {new_total}: {} units on loan",
                        ledger.outstanding
                    ),
                });
            }
            ledger.available -= ledger.total - new_total;
            ledger.total = new_total;
            if new_total == 0 && ledger.status == ResourceStatus::Active {
                ledger.status = ResourceStatus::Exhausted;
                tracing::info!(resource_id, "resource exhausted");
            }
            Ok(Vec::new())
        })?;
        WaitlistCounters::bump(&self.counters.waitlist_allocations, granted.len());
        Ok(granted)
    }

    /// Soft-delete a resource: status `Withdrawn`, every pending entry cancelled.
    /// Returns the cancelled entries; a repeat call returns none.
    pub fn withdraw(&self, resource_id: ResourceId) -> Result<Vec<WaitlistEntry>, MatchError> {
        let cancelled = self.with_ledger(resource_id, |ledger, events| {
            ledger.status = ResourceStatus::Withdrawn;
            let mut cancelled = Vec::with_capacity(ledger.queue.len());
            while let Some(key) = ledger.queue.pop_front() {
                if let Some(entry) = ledger.entries.get_mut(&key.entry_id) {
                    entry.status = EntryStatus::Cancelled;
                    ledger.terminal.push_back(key.entry_id);
                    events.push(build_event(
                        EventKind::Cancelled,
                        resource_id,
                        entry.requester_id.clone(),
                        Some(entry.id),
                        None,
                    ));
                    cancelled.push(entry.clone());
                }
            }
            ledger.pending_by_requester.clear();
            Ok(cancelled)
        })?;
        WaitlistCounters::bump(&self.counters.cancelled, cancelled.len());
        tracing::info!(resource_id, cancelled = cancelled.len(), "resource withdrawn");
        Ok(cancelled)
    }

    /// Expire an entry that has waited longer than the configured maximum.
    ///
    /// Returns `Ok(false)` (no-op) when the entry is no longer pending or not
    /// yet overdue.
    pub fn expire(&self, entry_id: EntryId, now_ms: u128) -> Result<bool, MatchError> {
        let resource_id = self.resource_of(entry_id)?;
        let max_wait_ms = self.config.max_wait_ms();
        let expired = self.with_ledger(resource_id, |ledger, events| {
            let overdue = ledger.entries.get(&entry_id).is_some_and(|e| {
                e.status == EntryStatus::Pending
                    && now_ms.saturating_sub(e.enqueued_at_ms) > max_wait_ms
            });
            if !overdue {
                return Ok(false);
            }
            ledger.take_pending(entry_id, EntryStatus::Expired, events)?;
            Ok(true)
        })?;
        if expired {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(resource_id, entry_id, "entry expired");
        }
        Ok(expired)
    }

    /// Expire every overdue entry, one resource at a time. Returns the count.
    pub fn expire_overdue(&self, now_ms: u128) -> usize {
        let slots: Vec<Arc<ResourceSlot>> = self.slots.read().values().cloned().collect();
        let max_wait_ms = self.config.max_wait_ms();
        let mut total = 0;
        for slot in slots {
            let result = self.mutate(&slot, |ledger, events| {
                let overdue: Vec<EntryId> = ledger
                    .queue
                    .iter()
                    .filter(|k| now_ms.saturating_sub(k.enqueued_at_ms) > max_wait_ms)
                    .map(|k| k.entry_id)
                    .collect();
                for entry_id in &overdue {
                    ledger.take_pending(*entry_id, EntryStatus::Expired, events)?;
                }
                Ok((ledger.resource_id, overdue.len()))
            });
            match result {
                Ok((_, 0)) => {}
                Ok((resource_id, n)) => {
                    total += n;
                    tracing::warn!(resource_id, expired = n, "overdue entries expired");
                }
                Err(e) => tracing::error!(error = %e, "expiry sweep failed"),
            }
        }
        WaitlistCounters::bump(&self.counters.expired, total);
        total
    }

    /// Change an entry's priority and move it to its new place. Returns the
    /// new position.
    pub fn rescore(&self, entry_id: EntryId, priority: Option<f64>) -> Result<usize, MatchError> {
        let resource_id = self.resource_of(entry_id)?;
        self.with_ledger(resource_id, |ledger, events| {
            let old_key = match ledger.entries.get(&entry_id) {
                None => return Err(MatchError::UnknownEntry(entry_id)),
                Some(e) if e.status.is_terminal() => {
                    return Err(MatchError::AlreadyTerminal {
                        entry_id,
                        status: e.status,
                    })
                }
                Some(e) => QueueKey::of(e),
            };
            let Some(old_idx) = ledger.queue_index(&old_key) else {
                return Err(ledger.violation(format!("pending entry {entry_id} missing from queue")));
            };
            ledger.queue.remove(old_idx);
            let priority = priority.filter(|p| p.is_finite());
            if let Some(entry) = ledger.entries.get_mut(&entry_id) {
                entry.priority = priority;
            }
            let new_key = QueueKey {
                priority,
                ..old_key
            };
            let new_idx = ledger
                .queue
                .partition_point(|k| k.cmp_order(&new_key) == CmpOrdering::Less);
            ledger.queue.insert(new_idx, new_key);
            if new_idx != old_idx {
                let lo = old_idx.min(new_idx);
                let hi = old_idx.max(new_idx);
                ledger.notify_positions(lo..hi + 1, events);
            }
            Ok(new_idx + 1)
        })
    }

    /// Current 1-based position of a pending entry.
    pub fn position(&self, entry_id: EntryId) -> Result<usize, MatchError> {
        let resource_id = self.resource_of(entry_id)?;
        let slot = self.slot(resource_id)?;
        let ledger = slot.ledger.lock();
        match ledger.entries.get(&entry_id) {
            None => Err(MatchError::UnknownEntry(entry_id)),
            Some(e) if e.status.is_terminal() => Err(MatchError::AlreadyTerminal {
                entry_id,
                status: e.status,
            }),
            Some(e) => ledger
                .queue_index(&QueueKey::of(e))
                .map(|i| i + 1)
                .ok_or(MatchError::UnknownEntry(entry_id)),
        }
    }

    /// Look up an entry in any state.
    pub fn entry(&self, entry_id: EntryId) -> Option<WaitlistEntry> {
        let resource_id = self.resource_of(entry_id).ok()?;
        let slot = self.slot(resource_id).ok()?;
        let ledger = slot.ledger.lock();
        ledger.entries.get(&entry_id).cloned()
    }

    /// Pending entries of a resource in queue order.
    pub fn pending(&self, resource_id: ResourceId) -> Result<Vec<WaitlistEntry>, MatchError> {
        let slot = self.slot(resource_id)?;
        let ledger = slot.ledger.lock();
        Ok(ledger.ordered_pending())
    }

    /// Consistent snapshot taken under the resource lock.
    pub fn ledger(&self, resource_id: ResourceId) -> Result<LedgerSnapshot, MatchError> {
        let slot = self.slot(resource_id)?;
        let ledger = slot.ledger.lock();
        Ok(ledger.snapshot())
    }

    /// Lock-free snapshot; individual figures may be from adjacent updates.
    pub fn snapshot(&self, resource_id: ResourceId) -> Option<LedgerSnapshot> {
        self.slots
            .read()
            .get(&resource_id)
            .map(|slot| slot.mirror.read(resource_id))
    }

    /// Pending entries on a resource (0 when unknown). Lock-free.
    pub fn waitlist_len(&self, resource_id: ResourceId) -> usize {
        self.slots
            .read()
            .get(&resource_id)
            .map_or(0, |slot| slot.mirror.pending.load(Ordering::Acquire))
    }

    /// Aggregate statistics from counters and ledger mirrors.
    pub fn stats(&self) -> WaitlistStats {
        let mut stats = self.counters.snapshot();
        let slots = self.slots.read();
        stats.resources = slots.len();
        for slot in slots.values() {
            stats.pending_entries += slot.mirror.pending.load(Ordering::Acquire);
            match status_from_code(slot.mirror.status.load(Ordering::Acquire)) {
                ResourceStatus::Active => {}
                ResourceStatus::Exhausted => stats.exhausted_resources += 1,
                ResourceStatus::Withdrawn => stats.withdrawn_resources += 1,
            }
        }
        stats
    }

    /// The `n` most requested resources with their request counts,
    /// most requested first and ties by id.
    pub fn popular(&self, n: usize) -> Vec<(ResourceId, u64)> {
        let mut counts: Vec<(ResourceId, u64)> = self
            .slots
            .read()
            .iter()
            .map(|(id, slot)| (*id, slot.mirror.requests.load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        counts.truncate(n);
        counts
    }

    /// The `n` requesters with the most accepted requests, most active first
    /// and ties by id.
    pub fn active_requesters(&self, n: usize) -> Vec<(RequesterId, u64)> {
        let mut counts: Vec<(RequesterId, u64)> = self
            .requester_activity
            .lock()
            .iter()
            .map(|(id, count)| (id.clone(), *count))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts.truncate(n);
        counts
    }

    /// Re-derive the queue order from stored entries and compare it with the
    /// maintained order.
    pub fn verify_order(&self, resource_id: ResourceId) -> Result<bool, MatchError> {
        let slot = self.slot(resource_id)?;
        let ledger = slot.ledger.lock();
        let mut derived: Vec<&WaitlistEntry> = ledger
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Pending)
            .collect();
        derived.sort_by(|a, b| QueueKey::of(a).cmp_order(&QueueKey::of(b)));
        let maintained = ledger.queue.iter().map(|k| k.entry_id);
        Ok(derived.len() == ledger.queue.len()
            && derived.iter().map(|e| e.id).eq(maintained))
    }
}
