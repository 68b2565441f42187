//! Wall-clock helpers. Timestamps are microseconds since the Unix epoch.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Microseconds in one second.
pub const US_PER_SEC: u64 = 1_000_000;

/// Microseconds in one minute.
pub const US_PER_MIN: u64 = 60 * US_PER_SEC;
