//! Application bootstrap and dependency wiring.
//!
//! This module is the composition root: every engine is instantiated and
//! wired together here, and background tasks are started and stopped from
//! here. The external collaborators (serial link, encoder launcher) are
//! passed in so the binary and the tests can choose their own.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{WsBrokerBridge, WsConnectionManager};
use crate::error::{ZonecastError, ZonecastResult};
use crate::events::{BroadcastEventBridge, EventEmitter, LoggingEventEmitter};
use crate::persistence::{JsonFileZoneStore, MemoryZoneStore, ZoneStore};
use crate::playback::encoder::ExitNotice;
use crate::playback::{EncoderLauncher, PassthroughResolver, PlaybackArbiter};
use crate::protocol_constants::TASK_SHUTDOWN_GRACE_MS;
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::schedule::{ScheduleTrigger, StaticScheduleSource};
use crate::state::Config;
use crate::zones::serial_link::SerialReader;
use crate::zones::{BrokerPublisher, SerialTransport, ZoneGate, ZoneSyncEngine};

/// Container for all bootstrapped services.
///
/// Built once at startup, consumed by `AppState`, and shut down explicitly.
pub struct BootstrappedServices {
    /// Zone state synchronization engine.
    pub zones: Arc<ZoneSyncEngine>,
    /// Playback arbitration engine.
    pub arbiter: Arc<PlaybackArbiter>,
    /// Wall-clock schedule trigger.
    pub schedule: Arc<ScheduleTrigger>,
    /// Event bridge for realtime subscribers and the structured log.
    pub event_bridge: Arc<BroadcastEventBridge>,
    /// Broker bridge socket endpoint.
    pub broker: Arc<WsBrokerBridge>,
    /// Manages WebSocket connections.
    pub ws_manager: Arc<WsConnectionManager>,
    /// Validated configuration.
    pub config: Arc<Config>,
    /// Task spawner for background operations.
    pub spawner: TokioSpawner,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
    /// Encoder exit notices, taken by the dispatch task on start.
    exit_notices: Mutex<Option<mpsc::UnboundedReceiver<ExitNotice>>>,
}

impl BootstrappedServices {
    /// Starts the maintenance loop, encoder exit dispatch and schedule poller.
    ///
    /// Calling it twice only starts the exit dispatch once.
    pub fn start_background_tasks(&self) {
        let cancel = self.cancel_token.clone();

        self.spawner.spawn(
            "zone-maintenance",
            Arc::clone(&self.zones).run_maintenance(cancel.clone()),
        );

        if let Some(notices) = self.exit_notices.lock().take() {
            self.spawner.spawn(
                "encoder-exit-dispatch",
                Arc::clone(&self.arbiter).run_exit_dispatch(notices, cancel.clone()),
            );
        }

        if self.config.schedule.entries.is_empty() {
            log::info!("[Bootstrap] No schedule entries configured");
        } else {
            self.spawner
                .spawn("schedule-trigger", Arc::clone(&self.schedule).run(cancel));
        }
    }

    /// Feeds frames from the serial link into the zone engine.
    pub fn attach_serial_reader<R>(&self, reader: SerialReader<R>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.spawner.spawn(
            "serial-reader",
            reader.run(Arc::clone(&self.zones), self.cancel_token.clone()),
        );
    }

    /// Initiates graceful shutdown of all services.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");

        self.cancel_token.cancel();

        // Stops the encoder and emits the final playback events.
        self.arbiter.shutdown().await;

        let connections_closed = self.ws_manager.close_all();
        if connections_closed > 0 {
            log::info!(
                "[Bootstrap] Closed {} WebSocket connection(s)",
                connections_closed
            );
        }

        let flushed = self.zones.flush_telemetry().await;
        if flushed > 0 {
            log::info!("[Bootstrap] Flushed {} telemetry row(s)", flushed);
        }

        self.spawner
            .join_all(Duration::from_millis(TASK_SHUTDOWN_GRACE_MS))
            .await;

        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Picks the zone store for the configured data directory.
fn create_store(config: &Config) -> Arc<dyn ZoneStore> {
    match &config.data_dir {
        Some(dir) => {
            log::info!("[Bootstrap] Persisting zones under {}", dir.display());
            Arc::new(JsonFileZoneStore::new(dir.clone()))
        }
        None => {
            log::info!("[Bootstrap] No data directory configured, zone state is in-memory only");
            Arc::new(MemoryZoneStore::new())
        }
    }
}

/// Bootstraps all engines with their dependencies.
///
/// Wiring order:
///
/// 1. Shared infrastructure (event bridge, broker bridge, cancellation token)
/// 2. Zone store and zone engine, hydrated from the store
/// 3. Playback arbiter, gated by the zone engine
/// 4. Schedule trigger, driving the arbiter
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the store cannot be
/// read.
pub async fn bootstrap_services(
    config: Config,
    serial: Arc<dyn SerialTransport>,
    launcher: Arc<dyn EncoderLauncher>,
) -> ZonecastResult<BootstrappedServices> {
    config.validate().map_err(ZonecastError::Configuration)?;
    let config = Arc::new(config);

    let spawner = TokioSpawner::current();
    let cancel_token = CancellationToken::new();

    let event_bridge = Arc::new(BroadcastEventBridge::new(config.event_channel_capacity));
    event_bridge.set_external_emitter(Arc::new(LoggingEventEmitter));
    let emitter = Arc::clone(&event_bridge) as Arc<dyn EventEmitter>;

    let broker = Arc::new(WsBrokerBridge::new(config.broker_channel_capacity));
    let ws_manager = Arc::new(WsConnectionManager::new());

    let zones = Arc::new(ZoneSyncEngine::new(
        &config,
        serial,
        Arc::clone(&broker) as Arc<dyn BrokerPublisher>,
        create_store(&config),
        Arc::clone(&emitter),
    ));
    let hydrated = zones.hydrate().await?;
    log::info!("[Bootstrap] Hydrated {} zone record(s)", hydrated);

    let (arbiter, exit_notices) = PlaybackArbiter::new(
        &config,
        launcher,
        Arc::clone(&zones) as Arc<dyn ZoneGate>,
        Arc::new(PassthroughResolver),
        emitter,
    );
    let arbiter = Arc::new(arbiter);

    let schedule = Arc::new(ScheduleTrigger::new(
        &config.schedule,
        Arc::new(StaticScheduleSource::new(config.schedule.entries.clone())),
        Arc::clone(&arbiter),
    )?);

    Ok(BootstrappedServices {
        zones,
        arbiter,
        schedule,
        event_bridge,
        broker,
        ws_manager,
        config,
        spawner,
        cancel_token,
        exit_notices: Mutex::new(Some(exit_notices)),
    })
}
