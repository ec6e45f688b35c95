//! Tests for error types

use commons_match::core::MatchError;
use commons_match::util::serde::{EntryStatus, ResourceStatus};

#[test]
fn test_dimension_mismatch_display() {
    let err = MatchError::DimensionMismatch {
        expected: 384,
        got: 3,
    };
    assert_eq!(format!("{err}"), "dimension mismatch: expected 384, got 3");
}

#[test]
fn test_duplicate_pending_display() {
    let err = MatchError::DuplicatePending {
        resource_id: 7,
        requester_id: "alice".into(),
    };
    assert_eq!(
        format!("{err}"),
        "duplicate pending entry for `alice` on resource 7"
    );
}

#[test]
fn test_already_terminal_display() {
    let err = MatchError::AlreadyTerminal {
        entry_id: 3,
        status: EntryStatus::Cancelled,
    };
    assert_eq!(format!("{err}"), "entry 3 is already terminal (Cancelled)");
}

#[test]
fn test_no_viable_match_display() {
    assert_eq!(format!("{}", MatchError::NoViableMatch), "no viable match");
}

#[test]
fn test_invalid_requester_display() {
    let err = MatchError::InvalidRequester(format!("{:?}", "  "));
    assert_eq!(format!("{err}"), "invalid requester id \"  \"");
}

#[test]
fn test_recoverable_classification() {
    let recoverable = [
        MatchError::NoViableMatch,
        MatchError::ModelUnavailable("timeout".into()),
        MatchError::WaitlistFull {
            resource_id: 1,
            max_depth: 8,
        },
        MatchError::ResourceInactive {
            resource_id: 1,
            status: ResourceStatus::Exhausted,
        },
    ];
    assert!(recoverable.iter().all(MatchError::is_recoverable));

    let fatal = [
        MatchError::CapacityInvariantViolation {
            resource_id: 1,
            detail: "available would go negative".into(),
        },
        MatchError::DimensionMismatch {
            expected: 2,
            got: 3,
        },
        MatchError::InvalidConfig("dimension".into()),
    ];
    assert!(fatal.iter().all(|e| !e.is_recoverable()));
}

#[test]
fn test_error_is_std_error() {
    fn takes_error(_: &dyn std::error::Error) {}
    takes_error(&MatchError::UnknownResource(5));
}
