//! Seams between the zone engine and its collaborators.
//!
//! The broker client and the physical serial driver live outside this crate;
//! the engine only ever sees these traits.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::PlaybackMode;
use crate::zones::codec::SerialCommand;

/// Failure writing to an external transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport rejected message: {0}")]
    Rejected(String),
}

/// Single shared write channel to the amplifier controller.
#[async_trait]
pub trait SerialTransport: Send + Sync {
    async fn write(&self, command: &SerialCommand) -> Result<(), TransportError>;
}

/// Outbound side of the message broker.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError>;
}

/// What the playback arbiter needs to know about (and tell) the zones.
#[async_trait]
pub trait ZoneGate: Send + Sync {
    /// Whether at least one zone may currently receive audio.
    fn any_stream_enabled(&self) -> bool;

    /// Called whenever the active playback mode changes
    /// ([`PlaybackMode::None`] when playback ends).
    async fn playback_changed(&self, mode: PlaybackMode);
}

/// Serial transport that drops every write. Used when no hardware is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSerialTransport;

#[async_trait]
impl SerialTransport for NoopSerialTransport {
    async fn write(&self, command: &SerialCommand) -> Result<(), TransportError> {
        log::trace!("[Serial] No link attached, dropping {}", command.encode());
        Ok(())
    }
}
