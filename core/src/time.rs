//! Millisecond wall-clock stamps for channel liveness and timeout reports.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch. Used for `last_read`/`last_write`
/// channel stamps and human-readable timeout messages; deadlines use
/// `Instant` instead.
#[inline]
pub fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(_) => 0,
    }
}
