//! Time windows that keep the three zone producers from fighting each other.

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::types::ZoneId;
use crate::zones::cache::StatusUpdate;

// ─────────────────────────────────────────────────────────────────────────────
// Manual Pins
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pin {
    pub stream_enabled: bool,
    pub is_playing: bool,
    pub until: Instant,
}

/// Per-zone pins of the volatile fields set by a manual panel action.
///
/// While a pin is live, non-manual updates for that zone have
/// `stream_enabled`/`is_playing` replaced by the pinned values, so a stale
/// asynchronous update cannot revert a fresh operator toggle.
#[derive(Debug)]
pub struct ManualPins {
    window: Duration,
    pins: DashMap<ZoneId, Pin>,
}

impl ManualPins {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pins: DashMap::new(),
        }
    }

    /// Pins a zone for the configured window starting now.
    pub fn pin(&self, zone: ZoneId, stream_enabled: bool, is_playing: bool) {
        self.pins.insert(
            zone,
            Pin {
                stream_enabled,
                is_playing,
                until: Instant::now() + self.window,
            },
        );
    }

    /// Returns the live pin for `zone`, dropping it if expired.
    pub fn active(&self, zone: ZoneId) -> Option<Pin> {
        let pin = *self.pins.get(&zone)?;
        if Instant::now() < pin.until {
            Some(pin)
        } else {
            self.pins.remove_if(&zone, |_, p| p.until == pin.until);
            None
        }
    }

    /// Overwrites the volatile fields of `update` with a live pin, if any.
    /// Returns true when the update was altered.
    pub fn enforce(&self, zone: ZoneId, update: &mut StatusUpdate) -> bool {
        let Some(pin) = self.active(zone) else {
            return false;
        };
        let before = *update;
        if update.stream_enabled.is_some() {
            update.stream_enabled = Some(pin.stream_enabled);
        }
        if update.is_playing.is_some() {
            update.is_playing = Some(pin.is_playing);
        }
        before != *update
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// All-Zones Block Window
// ─────────────────────────────────────────────────────────────────────────────

/// Window opened by an "all zones" command during which per-zone serial
/// re-syncs are suppressed (the bulk write already covered them).
#[derive(Debug)]
pub struct BlockWindow {
    window: Duration,
    open_until: Mutex<Option<Instant>>,
}

impl BlockWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            open_until: Mutex::new(None),
        }
    }

    pub fn open(&self) {
        *self.open_until.lock() = Some(Instant::now() + self.window);
    }

    pub fn is_open(&self) -> bool {
        self.open_until
            .lock()
            .is_some_and(|until| Instant::now() < until)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serial Rate Limiter
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    Send,
    /// Byte-identical to the previous write.
    SkipDuplicate,
    /// Different from the previous write, but too soon after it.
    SkipTooSoon,
}

#[derive(Debug)]
struct LastWrite {
    frame: String,
    at: Instant,
}

/// Gate in front of the single serial write channel.
///
/// Skipped writes are never retried.
#[derive(Debug)]
pub struct SerialRateLimiter {
    min_interval: Duration,
    echo_window: Duration,
    last: Mutex<Option<LastWrite>>,
}

impl SerialRateLimiter {
    pub fn new(min_interval: Duration, echo_window: Duration) -> Self {
        Self {
            min_interval,
            echo_window,
            last: Mutex::new(None),
        }
    }

    /// Decides whether `frame` may be written now and, if so, records it as
    /// the last write.
    pub fn admit(&self, frame: &str) -> WriteDecision {
        let now = Instant::now();
        let mut last = self.last.lock();
        if let Some(prev) = last.as_ref() {
            if prev.frame == frame {
                return WriteDecision::SkipDuplicate;
            }
            if now.saturating_duration_since(prev.at) < self.min_interval {
                return WriteDecision::SkipTooSoon;
            }
        }
        *last = Some(LastWrite {
            frame: frame.to_string(),
            at: now,
        });
        WriteDecision::Send
    }

    /// Whether an inbound frame is the echo of our own last write.
    pub fn is_echo(&self, frame: &str) -> bool {
        self.last.lock().as_ref().is_some_and(|prev| {
            prev.frame == frame && Instant::now().saturating_duration_since(prev.at) <= self.echo_window
        })
    }

    /// Forgets the last write once the hardware has moved on without us, so
    /// re-sending the same frame later is not mistaken for a duplicate.
    pub fn forget(&self) {
        *self.last.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pin_overrides_until_window_expires() {
        let pins = ManualPins::new(Duration::from_secs(5));
        pins.pin(2, true, false);

        tokio::time::advance(Duration::from_secs(3)).await;
        let mut update = StatusUpdate::stream(false);
        assert!(pins.enforce(2, &mut update));
        assert_eq!(update.stream_enabled, Some(true));

        tokio::time::advance(Duration::from_secs(3)).await;
        let mut update = StatusUpdate::stream(false);
        assert!(!pins.enforce(2, &mut update));
        assert_eq!(update.stream_enabled, Some(false));
        assert!(pins.active(2).is_none());
    }

    #[test]
    fn pin_leaves_volume_alone() {
        let pins = ManualPins::new(Duration::from_secs(5));
        pins.pin(1, false, false);
        let mut update = StatusUpdate::volume(12);
        assert!(!pins.enforce(1, &mut update));
        assert_eq!(update.volume, Some(12));
    }

    #[tokio::test(start_paused = true)]
    async fn block_window_closes_after_duration() {
        let block = BlockWindow::new(Duration::from_secs(5));
        assert!(!block.is_open());
        block.open();
        tokio::time::advance(Duration::from_millis(4_900)).await;
        assert!(block.is_open());
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!block.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn identical_writes_are_skipped() {
        let limiter = SerialRateLimiter::new(Duration::from_millis(300), Duration::from_secs(1));
        assert_eq!(limiter.admit("$S0001Y$"), WriteDecision::Send);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(limiter.admit("$S0001Y$"), WriteDecision::SkipDuplicate);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.admit("$S0001Y$"), WriteDecision::SkipDuplicate);
    }

    #[tokio::test(start_paused = true)]
    async fn different_writes_need_min_interval() {
        let limiter = SerialRateLimiter::new(Duration::from_millis(300), Duration::from_secs(1));
        assert_eq!(limiter.admit("$S0001Y$"), WriteDecision::Send);
        tokio::time::advance(Duration::from_millis(299)).await;
        assert_eq!(limiter.admit("$S0002Y$"), WriteDecision::SkipTooSoon);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(limiter.admit("$S0002Y$"), WriteDecision::Send);
    }

    #[tokio::test(start_paused = true)]
    async fn echo_detection_is_time_boxed() {
        let limiter = SerialRateLimiter::new(Duration::from_millis(300), Duration::from_secs(1));
        limiter.admit("$S0003N$");
        assert!(limiter.is_echo("$S0003N$"));
        assert!(!limiter.is_echo("$S0003Y$"));
        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert!(!limiter.is_echo("$S0003N$"));

        limiter.forget();
        assert_eq!(limiter.admit("$S0003N$"), WriteDecision::Send);
    }
}
