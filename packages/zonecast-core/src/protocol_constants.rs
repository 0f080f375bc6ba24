//! Fixed protocol and timing constants.
//!
//! Wire-format values are defined by the amplifier controller and the broker
//! topic layout; changing them breaks interoperability with deployed hardware.
//! Timing values are the defaults used by [`crate::state::Config`].

// ─────────────────────────────────────────────────────────────────────────────
// Serial Protocol (hardware amplifier controller)
// ─────────────────────────────────────────────────────────────────────────────

/// Delimiter framing every addressed serial command (`$S0001Y$`).
pub const FRAME_DELIMITER: u8 = b'$';

/// Width of the zero-padded zone number in serial frames.
pub const ZONE_DIGITS: usize = 4;

/// Highest volume level the amplifier accepts.
pub const MAX_VOLUME: u8 = 21;

/// Largest frame the decoder will buffer before discarding garbage (bytes).
pub const MAX_SERIAL_FRAME_LEN: usize = 4096;

// ─────────────────────────────────────────────────────────────────────────────
// Broker Topics
// ─────────────────────────────────────────────────────────────────────────────

/// Topic carrying raw bulk scan vectors (one `Y`/`N` per zone).
pub const BULK_SCAN_TOPIC: &str = "bulk/test";

/// Prefix for every per-zone topic (`zone12/status`).
pub const ZONE_TOPIC_PREFIX: &str = "zone";

// ─────────────────────────────────────────────────────────────────────────────
// Zone Synchronization Timing
// ─────────────────────────────────────────────────────────────────────────────

/// Window after an "all zones" command during which per-zone re-syncs are suppressed.
pub const ALL_ZONES_BLOCK_MS: u64 = 5_000;

/// How long a manual panel action pins a zone's volatile fields.
pub const MANUAL_DEBOUNCE_MS: u64 = 5_000;

/// Minimum spacing between two different serial writes.
pub const SERIAL_MIN_INTERVAL_MS: u64 = 300;

/// A serial RX frame equal to our own last write within this window is an echo.
pub const SERIAL_ECHO_WINDOW_MS: u64 = 1_000;

/// Interval between offline watchdog sweeps.
pub const WATCHDOG_INTERVAL_SECS: u64 = 10;

/// Silence after which a zone is flagged offline.
pub const OFFLINE_AFTER_SECS: u64 = 35;

/// Deadline for a pending zone status request.
pub const STATUS_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Interval between telemetry buffer flushes.
pub const TELEMETRY_FLUSH_MS: u64 = 500;

/// Interval between full zone snapshots written to the store.
pub const SNAPSHOT_INTERVAL_SECS: u64 = 30;

// ─────────────────────────────────────────────────────────────────────────────
// Playback Timing
// ─────────────────────────────────────────────────────────────────────────────

/// Grace period after preempting other sources before the mic claims the encoder.
pub const MIC_PREEMPT_GRACE_MS: u64 = 1_000;

/// Delay between graceful terminate and forced kill of the encoder.
pub const ENCODER_KILL_TIMEOUT_MS: u64 = 800;

/// Pause after a track ends before the next one starts (relay buffer drain).
pub const TRACK_SETTLE_DELAY_MS: u64 = 1_500;

/// Delay before retrying a crashed remote-media session.
pub const REMOTE_RETRY_DELAY_MS: u64 = 2_000;

/// Retry budget for a crashed remote-media session.
pub const REMOTE_MAX_RETRIES: u32 = 5;

/// Healthy run time after which a crashed session gets a fresh retry budget.
pub const RETRY_RESET_AFTER_SECS: u64 = 60;

/// How long a mic start waits for an in-flight start to settle.
pub const START_WAIT_MS: u64 = 3_000;

/// Lookahead before a minute boundary at which schedules are prefetched.
pub const SCHEDULE_LOOKAHEAD_MS: u64 = 500;

// ─────────────────────────────────────────────────────────────────────────────
// Audio / Encoder
// ─────────────────────────────────────────────────────────────────────────────

/// Default live-audio sample rate (Hz).
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Default live-audio channel count.
pub const DEFAULT_CHANNELS: u16 = 2;

/// Capacity of the live-input feed (chunks) before backpressure is signalled.
pub const LIVE_INPUT_CAPACITY: usize = 32;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity / Channels
// ─────────────────────────────────────────────────────────────────────────────

/// Service identifier reported by the health endpoint.
pub const SERVICE_ID: &str = "zonecast";

/// Capacity of the event broadcast channel for realtime subscribers.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the outbound broker bridge channel.
pub const BROKER_CHANNEL_CAPACITY: usize = 256;

/// WebSocket heartbeat timeout (seconds).
pub const WS_HEARTBEAT_TIMEOUT_SECS: u64 = 30;

/// Interval between WebSocket heartbeat checks (seconds).
pub const WS_HEARTBEAT_CHECK_INTERVAL_SECS: u64 = 1;

/// How long shutdown waits for each background task before aborting it (ms).
pub const TASK_SHUTDOWN_GRACE_MS: u64 = 2_000;
