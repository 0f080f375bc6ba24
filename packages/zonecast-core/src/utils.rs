//! General utilities shared across the crate.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Milliseconds elapsed on the monotonic clock since `since`.
///
/// Uses the tokio clock so paused-time tests observe virtual time.
#[must_use]
pub fn elapsed_millis(since: Instant) -> u64 {
    Instant::now().saturating_duration_since(since).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn now_millis_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_millis_follows_virtual_clock() {
        let start = Instant::now();
        tokio::time::advance(Duration::from_millis(1250)).await;
        assert_eq!(elapsed_millis(start), 1250);
    }
}
