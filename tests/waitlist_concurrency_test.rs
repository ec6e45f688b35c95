//! Concurrency tests for the waitlist manager.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use commons_match::core::{Admission, MatchError, WaitlistConfig, WaitlistManager};
use commons_match::util::serde::EntryStatus;

const THREADS: usize = 16;

fn manager() -> Arc<WaitlistManager> {
    Arc::new(WaitlistManager::new(WaitlistConfig::default()))
}

#[test]
fn test_concurrent_enqueue_positions_are_gap_free() {
    let manager = manager();
    manager.register(1, 1).unwrap();
    manager.admit(1, "holder", None, 0).unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager
                    .enqueue(1, &format!("requester-{i}"), None, 100)
                    .unwrap()
            })
        })
        .collect();

    let mut positions: Vec<usize> = handles
        .into_iter()
        .map(|h| h.join().unwrap().position)
        .collect();
    positions.sort_unstable();
    assert_eq!(positions, (1..=THREADS).collect::<Vec<_>>());

    let pending = manager.pending(1).unwrap();
    for (idx, entry) in pending.iter().enumerate() {
        assert_eq!(entry.arrival as usize, idx);
        assert_eq!(manager.position(entry.id).unwrap(), idx + 1);
    }
    assert!(manager.verify_order(1).unwrap());
}

#[test]
fn test_concurrent_admits_never_over_allocate() {
    const UNITS: u32 = 5;
    let manager = manager();
    manager.register(7, UNITS).unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.admit(7, &format!("r{i}"), None, 0).unwrap()
            })
        })
        .collect();

    let admissions: Vec<Admission> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let allocated = admissions
        .iter()
        .filter(|a| matches!(a, Admission::Allocated { .. }))
        .count();
    assert_eq!(allocated, UNITS as usize);

    let mut positions: Vec<usize> = admissions
        .iter()
        .filter_map(|a| match a {
            Admission::Queued(q) => Some(q.position),
            Admission::Allocated { .. } => None,
        })
        .collect();
    positions.sort_unstable();
    assert_eq!(positions, (1..=THREADS - UNITS as usize).collect::<Vec<_>>());

    let ledger = manager.ledger(7).unwrap();
    assert_eq!(ledger.available, 0);
    assert_eq!(ledger.outstanding, UNITS);
}

#[test]
fn test_same_requester_racing_gets_one_entry() {
    let manager = manager();
    manager.register(3, 1).unwrap();
    manager.admit(3, "holder", None, 0).unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.enqueue(3, "same", None, 0)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, MatchError::DuplicatePending { .. })));
    assert_eq!(manager.waitlist_len(3), 1);
}

#[test]
fn test_cancel_races_allocation() {
    for round in 0..50u64 {
        let manager = manager();
        manager.register(round, 1).unwrap();
        manager.admit(round, "holder", None, 0).unwrap();
        let entry = manager.enqueue(round, "waiter", None, 0).unwrap().entry;
        let barrier = Arc::new(Barrier::new(2));

        let canceller = {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.cancel(entry.id)
            })
        };
        let allocator = {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.try_allocate(round, 1).unwrap()
            })
        };

        let cancelled = canceller.join().unwrap();
        let granted = allocator.join().unwrap();
        let final_status = manager.entry(entry.id).unwrap().status;
        let ledger = manager.ledger(round).unwrap();

        match cancelled {
            Ok(_) => {
                assert!(granted.is_empty());
                assert_eq!(final_status, EntryStatus::Cancelled);
                assert_eq!(ledger.available, 1);
            }
            Err(MatchError::AlreadyTerminal { status, .. }) => {
                assert_eq!(status, EntryStatus::Allocated);
                assert_eq!(granted.len(), 1);
                assert_eq!(final_status, EntryStatus::Allocated);
                assert_eq!(ledger.available, 0);
            }
            Err(e) => panic!("unexpected cancel error: {e}"),
        }
        assert_eq!(ledger.waitlist_len, 0);
    }
}

#[test]
fn test_double_cancel_from_two_threads() {
    let manager = manager();
    manager.register(1, 1).unwrap();
    manager.admit(1, "holder", None, 0).unwrap();
    let entry_id = manager.enqueue(1, "w", None, 0).unwrap().entry.id;
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.cancel(entry_id).is_ok()
            })
        })
        .collect();
    let oks = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(oks, 1);
    assert_eq!(manager.stats().cancelled, 1);
}

#[test]
fn test_independent_resources_progress_in_parallel() {
    let manager = manager();
    for id in 0..8u64 {
        manager.register(id, 2).unwrap();
    }

    thread::scope(|scope| {
        for id in 0..8u64 {
            let manager = &manager;
            scope.spawn(move || {
                for i in 0..20 {
                    manager.admit(id, &format!("{id}-{i}"), None, 0).unwrap();
                }
            });
        }
    });

    let mut seen = HashSet::new();
    for id in 0..8u64 {
        let ledger = manager.ledger(id).unwrap();
        assert_eq!(ledger.outstanding, 2);
        assert_eq!(ledger.waitlist_len, 18);
        for entry in manager.pending(id).unwrap() {
            assert!(seen.insert(entry.id));
        }
    }
    assert_eq!(manager.stats().immediate_allocations, 16);
}
