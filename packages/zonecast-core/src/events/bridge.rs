//! Bridge implementation that maps domain events to broadcast transport.
//!
//! The [`BroadcastEventBridge`] lives at the boundary between the engines and
//! transport concerns, mapping typed domain events to the WebSocket broadcast
//! channel.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::emitter::EventEmitter;
use super::{BroadcastEvent, PlaybackEvent, TelemetryEvent, ZoneEvent};

/// Bridges domain events to the WebSocket broadcast channel.
///
/// Events are also forwarded to an optional secondary emitter (for example
/// [`super::LoggingEventEmitter`]) that can be set after construction.
#[derive(Clone)]
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<BroadcastEvent>,
    external_emitter: Arc<RwLock<Option<Arc<dyn EventEmitter>>>>,
}

impl BroadcastEventBridge {
    /// Creates a new bridge with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            external_emitter: Arc::new(RwLock::new(None)),
        }
    }

    /// Sets a secondary emitter that sees every event before broadcast.
    pub fn set_external_emitter(&self, emitter: Arc<dyn EventEmitter>) {
        *self.external_emitter.write() = Some(emitter);
    }

    /// Returns a new receiver for the broadcast channel.
    ///
    /// WebSocket handlers use this to subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.tx.subscribe()
    }
}

/// Generates an [`EventEmitter`] method that forwards to the external emitter
/// (if set) and then sends to the broadcast channel.
macro_rules! impl_emit {
    ($method:ident, $event_ty:ty, $variant:ident) => {
        fn $method(&self, event: $event_ty) {
            if let Some(ref emitter) = *self.external_emitter.read() {
                emitter.$method(event.clone());
            }
            if let Err(e) = self.tx.send(BroadcastEvent::$variant(event)) {
                log::trace!("[EventBridge] No broadcast receivers: {}", e);
            }
        }
    };
}

impl EventEmitter for BroadcastEventBridge {
    impl_emit!(emit_zone, ZoneEvent, Zone);
    impl_emit!(emit_playback, PlaybackEvent, Playback);
    impl_emit!(emit_telemetry, TelemetryEvent, Telemetry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::emitter::tests::RecordingEmitter;

    #[tokio::test]
    async fn subscribers_and_external_emitter_both_receive() {
        let bridge = BroadcastEventBridge::new(8);
        let external = Arc::new(RecordingEmitter::default());
        bridge.set_external_emitter(external.clone());
        let mut rx = bridge.subscribe();

        bridge.emit_zone(ZoneEvent::Presence {
            zone: 3,
            online: true,
            timestamp: 5,
        });

        let received = rx.recv().await.unwrap();
        assert!(matches!(
            received,
            BroadcastEvent::Zone(ZoneEvent::Presence { zone: 3, .. })
        ));
        assert_eq!(external.zone_events().len(), 1);
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        let bridge = BroadcastEventBridge::new(8);
        bridge.emit_playback(PlaybackEvent::Backpressure {
            paused: false,
            timestamp: 0,
        });
    }
}
