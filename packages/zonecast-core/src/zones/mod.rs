//! Zone state synchronization.
//!
//! - [`codec`]: serial frame grammar of the amplifier controller
//! - [`topics`]: broker topic router and typed payloads
//! - [`cache`]: authoritative per-zone state
//! - [`debounce`]: manual pins, all-zones block window, serial rate limiter
//! - [`sync`]: the engine tying producers, cache, store and subscribers together
//! - [`serial_link`]: codec driver over a byte channel

pub mod cache;
pub mod codec;
pub mod debounce;
pub mod serial_link;
pub mod sync;
pub mod topics;
pub mod traits;

pub use cache::{ZoneCache, ZoneEntry, ZoneSnapshot};
pub use codec::{SerialCommand, SerialFrameCodec};
pub use sync::ZoneSyncEngine;
pub use topics::{InboundMessage, StatusFrame, ZoneCommand, ZoneTarget};
pub use traits::{BrokerPublisher, NoopSerialTransport, SerialTransport, TransportError, ZoneGate};
