//! Event emitter abstraction for decoupling the engines from transport.
//!
//! The engines depend on the [`EventEmitter`] trait rather than concrete
//! broadcast channels, enabling testing and alternative transports.

use super::{PlaybackEvent, TelemetryEvent, ZoneEvent};

/// Trait for emitting domain events without knowledge of transport.
///
/// # Example
///
/// ```ignore
/// struct MyEngine {
///     emitter: Arc<dyn EventEmitter>,
/// }
///
/// impl MyEngine {
///     fn on_change(&self) {
///         self.emitter.emit_zone(ZoneEvent::Presence { ... });
///     }
/// }
/// ```
pub trait EventEmitter: Send + Sync {
    /// Emits a zone status or presence event.
    fn emit_zone(&self, event: ZoneEvent);

    /// Emits a playback lifecycle event.
    fn emit_playback(&self, event: PlaybackEvent);

    /// Emits a telemetry batch.
    fn emit_telemetry(&self, event: TelemetryEvent);
}

/// No-op emitter for tests and for engines running without subscribers.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_zone(&self, _event: ZoneEvent) {}

    fn emit_playback(&self, _event: PlaybackEvent) {}

    fn emit_telemetry(&self, _event: TelemetryEvent) {}
}

/// Logging emitter for debugging and development.
///
/// Logs all events at debug level.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_zone(&self, event: ZoneEvent) {
        tracing::debug!(?event, "zone_event");
    }

    fn emit_playback(&self, event: PlaybackEvent) {
        tracing::debug!(?event, "playback_event");
    }

    fn emit_telemetry(&self, event: TelemetryEvent) {
        tracing::debug!(?event, "telemetry_event");
    }
}
