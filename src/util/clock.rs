//! Wall-clock helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Returns 0 if the system clock is before the epoch.
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Whole days between two millisecond timestamps, clamped at zero.
pub fn days_between(start_ms: u128, end_ms: u128) -> u64 {
    const DAY_MS: u128 = 24 * 60 * 60 * 1000;
    u64::try_from(end_ms.saturating_sub(start_ms) / DAY_MS).unwrap_or(u64::MAX)
}
