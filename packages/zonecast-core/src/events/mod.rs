//! Event system for realtime subscribers.
//!
//! This module provides:
//! - [`EventEmitter`] trait for the engines to emit events
//! - [`BroadcastEventBridge`] for WebSocket transport
//! - Event types for zones, playback and telemetry

mod bridge;
pub(crate) mod emitter;

pub use bridge::BroadcastEventBridge;
pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

use crate::persistence::TelemetryRow;
use crate::types::{CommandSource, PlaybackMode, ZoneId, ZoneStatus};

/// Events broadcast to clients.
///
/// Each category has its own inner event type with specific variants.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum BroadcastEvent {
    /// Zone status and presence changes.
    Zone(ZoneEvent),

    /// Playback session lifecycle.
    Playback(PlaybackEvent),

    /// Batched zone telemetry.
    Telemetry(TelemetryEvent),
}

/// Events about zone state.
///
/// Field names follow the broker status payload (`stream_enabled`, ...) so
/// clients can share one decoder.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ZoneEvent {
    /// One zone's status changed.
    Status {
        zone: ZoneId,
        stream_enabled: bool,
        is_playing: bool,
        volume: u8,
        playback_mode: PlaybackMode,
        source: CommandSource,
        online: bool,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// Several zones changed in one reconciliation pass (bulk scan, select).
    Batch {
        zones: Vec<ZoneStatusRow>,
        source: CommandSource,
        timestamp: u64,
    },
    /// A zone went silent or came back.
    Presence {
        zone: ZoneId,
        online: bool,
        timestamp: u64,
    },
}

/// One zone inside a [`ZoneEvent::Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ZoneStatusRow {
    pub zone: ZoneId,
    #[serde(flatten)]
    pub status: ZoneStatus,
}

impl ZoneEvent {
    pub fn status(
        zone: ZoneId,
        status: ZoneStatus,
        source: CommandSource,
        online: bool,
        timestamp: u64,
    ) -> Self {
        Self::Status {
            zone,
            stream_enabled: status.stream_enabled,
            is_playing: status.is_playing,
            volume: status.volume,
            playback_mode: status.playback_mode,
            source,
            online,
            timestamp,
        }
    }
}

/// Why a playback session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    /// Explicit stop request.
    Requested,
    /// A higher-priority source took the encoder.
    Preempted,
    /// Stopped to be resumed later.
    Paused,
    /// The source ran out (last track finished).
    Ended,
    /// The encoder died and was not restarted.
    Crashed,
    /// The stream gate closed (every zone disabled).
    StreamDisabled,
}

/// Events about the playback arbiter and its encoder.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlaybackEvent {
    #[serde(rename_all = "camelCase")]
    Started {
        session_id: String,
        mode: PlaybackMode,
        source: String,
        offset_ms: u64,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Stopped {
        session_id: String,
        mode: PlaybackMode,
        reason: StopReason,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Paused {
        mode: PlaybackMode,
        position_ms: u64,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Resumed {
        mode: PlaybackMode,
        position_ms: u64,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    TrackChanged {
        index: usize,
        track: String,
        timestamp: u64,
    },
    /// A start was refused (e.g. schedule while the mic is live).
    #[serde(rename_all = "camelCase")]
    Rejected {
        requested_mode: PlaybackMode,
        active_mode: PlaybackMode,
        reason: String,
        timestamp: u64,
    },
    /// Remote media crashed and a restart is scheduled.
    #[serde(rename_all = "camelCase")]
    Retrying {
        mode: PlaybackMode,
        attempt: u32,
        delay_ms: u64,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        mode: PlaybackMode,
        message: String,
        timestamp: u64,
    },
    /// Live input buffer filled (`paused = true`) or drained again.
    #[serde(rename_all = "camelCase")]
    Backpressure { paused: bool, timestamp: u64 },
}

/// Telemetry flushed from the buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TelemetryEvent {
    Batch { rows: Vec<TelemetryRow>, timestamp: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_status_serializes_with_category_and_type() {
        let status = ZoneStatus {
            stream_enabled: true,
            is_playing: false,
            volume: 11,
            playback_mode: PlaybackMode::None,
        };
        let event = BroadcastEvent::Zone(ZoneEvent::status(4, status, CommandSource::ManualPanel, true, 42));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["category"], "zone");
        assert_eq!(json["type"], "status");
        assert_eq!(json["zone"], 4);
        assert_eq!(json["stream_enabled"], true);
        assert_eq!(json["volume"], 11);
        assert_eq!(json["source"], "manual-panel");
    }

    #[test]
    fn playback_events_use_camel_case_fields() {
        let event = BroadcastEvent::Playback(PlaybackEvent::Rejected {
            requested_mode: PlaybackMode::Schedule,
            active_mode: PlaybackMode::Mic,
            reason: "mic active".into(),
            timestamp: 1,
        });
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["category"], "playback");
        assert_eq!(json["type"], "rejected");
        assert_eq!(json["requestedMode"], "schedule");
        assert_eq!(json["activeMode"], "mic");
    }

    #[test]
    fn batch_rows_flatten_status() {
        let row = ZoneStatusRow {
            zone: 2,
            status: ZoneStatus::default(),
        };
        let json = serde_json::to_value(row).unwrap();
        assert_eq!(json["zone"], 2);
        assert_eq!(json["stream_enabled"], false);
    }
}
