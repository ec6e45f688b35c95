//! Tests for shared utilities

use commons_match::util::clock::{days_between, now_ms};
use commons_match::util::serde::{
    Category, Condition, EntryStatus, RequesterContext, ResourceStatus,
};
use commons_match::util::telemetry::init_tracing;

#[test]
fn test_now_ms_monotonic_enough() {
    let a = now_ms();
    let b = now_ms();
    assert!(b >= a);
}

#[test]
fn test_days_between() {
    assert_eq!(days_between(0, 86_400_000 * 2), 2);
    assert_eq!(days_between(86_400_000, 0), 0);
}

#[test]
fn test_entry_status_terminality() {
    assert!(!EntryStatus::Pending.is_terminal());
    assert!(EntryStatus::Allocated.is_terminal());
    assert!(EntryStatus::Cancelled.is_terminal());
    assert!(EntryStatus::Expired.is_terminal());
}

#[test]
fn test_only_active_is_searchable() {
    assert!(ResourceStatus::Active.is_searchable());
    assert!(!ResourceStatus::Exhausted.is_searchable());
    assert!(!ResourceStatus::Withdrawn.is_searchable());
}

#[test]
fn test_category_labels() {
    assert_eq!(Category::ALL.len(), 14);
    assert_eq!(Category::MusicalInstruments.to_string(), "Musical Instruments");
    assert_eq!(Condition::Fair.to_string(), "Fair");
    let json = serde_json::to_string(&Category::MusicalInstruments).unwrap();
    assert_eq!(json, "\"musical_instruments\"");
}

#[test]
fn test_requester_context_builder() {
    let ctx = RequesterContext::new("alice")
        .with_trust_tier(2)
        .with_feature("past_borrows", 11.0);
    assert_eq!(ctx.trust_tier, 2);
    assert_eq!(ctx.features.get("past_borrows"), Some(&11.0));

    let parsed: RequesterContext = serde_json::from_str(r#"{ "requester_id": "bob" }"#).unwrap();
    assert_eq!(parsed, RequesterContext::new("bob"));
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
}
