//! Zonecast Core - playback arbitration and zone state synchronization for a
//! public-address system.
//!
//! The crate decides which audio source may broadcast at any instant, drives
//! the encoder subprocess that pushes it to the streaming relay, and keeps a
//! debounced view of every zone's on/off/volume state across the message
//! broker, the amplifier controller's serial link and persisted snapshots.
//!
//! # Architecture
//!
//! - [`zones`]: serial codec, broker topics, zone cache, debounce windows and
//!   the [`ZoneSyncEngine`]
//! - [`playback`]: encoder supervisor, sessions and the [`PlaybackArbiter`]
//! - [`schedule`]: wall-clock schedule trigger
//! - [`persistence`]: zone record and telemetry stores
//! - [`events`]: domain events for realtime subscribers
//! - [`api`]: WebSocket and HTTP surface
//! - [`bootstrap`]: composition root
//!
//! # Abstraction Traits
//!
//! External collaborators are reached only through traits:
//!
//! - [`SerialTransport`](zones::SerialTransport): amplifier controller link
//! - [`BrokerPublisher`](zones::BrokerPublisher): outbound broker messages
//! - [`EncoderLauncher`](playback::EncoderLauncher): encoder subprocess
//! - [`ZoneStore`](persistence::ZoneStore): zone records and telemetry
//! - [`ScheduleSource`](schedule::ScheduleSource): due schedule entries
//! - [`EventEmitter`](events::EventEmitter): domain events
//! - [`TaskSpawner`](runtime::TaskSpawner): background tasks

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod error;
pub mod events;
pub mod persistence;
pub mod playback;
pub mod protocol_constants;
pub mod runtime;
pub mod schedule;
pub mod state;
pub mod types;
pub mod utils;
pub mod zones;

// Re-export commonly used types at the crate root
pub use error::{ErrorCode, ZonecastError, ZonecastResult};
pub use events::{
    BroadcastEvent, BroadcastEventBridge, EventEmitter, LoggingEventEmitter, NoopEventEmitter,
    PlaybackEvent, StopReason, TelemetryEvent, ZoneEvent,
};
pub use persistence::{JsonFileZoneStore, MemoryZoneStore, ZoneStore};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use state::{Config, EncoderConfig, ScheduleConfig};
pub use types::{CommandSource, PlaybackMode, ZoneId, ZoneStatus};
pub use utils::now_millis;

// Re-export engine types
pub use playback::{FfmpegLauncher, PlaybackArbiter, PlaybackStatus};
pub use schedule::{ScheduleEntry, ScheduleTrigger};
pub use zones::{NoopSerialTransport, SerialTransport, ZoneSyncEngine};

// Re-export bootstrap types
pub use bootstrap::{bootstrap_services, BootstrappedServices};

// Re-export API types
pub use api::{bind, serve, AppState, ServerError, WsConnectionManager};
