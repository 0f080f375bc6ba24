//! Zone State Synchronization Engine.
//!
//! Keeps the [`ZoneCache`] consistent across three producers: broker traffic
//! from apps and zone devices, serial frames from the amplifier controller,
//! and bulk scan vectors. Feedback loops are broken by source tags and echo
//! detection, command storms by the block window and the serial rate limiter,
//! and stale overwrites by manual pins.
//!
//! Locks inside the cache and the debounce helpers are never held across an
//! `.await`; each handler finishes its cache mutation before it suspends on
//! I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{ZonecastError, ZonecastResult};
use crate::events::{EventEmitter, TelemetryEvent, ZoneEvent, ZoneStatusRow};
use crate::persistence::{TelemetryRow, ZoneRecord, ZoneStore};
use crate::state::Config;
use crate::types::{CommandSource, PlaybackMode, ZoneId};
use crate::utils::now_millis;
use crate::zones::cache::{ApplyOutcome, BulkOutcome, StatusUpdate, ZoneCache, ZoneEntry, ZoneSnapshot};
use crate::zones::codec::SerialCommand;
use crate::zones::debounce::{BlockWindow, ManualPins, SerialRateLimiter, WriteDecision};
use crate::zones::topics::{
    command_topic, encode_command, route, InboundMessage, StatusFrame, ZoneCommand, ZoneTarget,
};
use crate::zones::traits::{BrokerPublisher, SerialTransport, ZoneGate};

/// A caller waiting for one zone's status reply.
struct PendingZoneRequest {
    id: u64,
    tx: oneshot::Sender<StatusFrame>,
}

/// Clears a zone's waiter when its request ends, including when the
/// requesting future is dropped mid-wait.
struct PendingGuard<'a> {
    pending: &'a DashMap<ZoneId, PendingZoneRequest>,
    zone: ZoneId,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let id = self.id;
        self.pending.remove_if(&self.zone, |_, p| p.id == id);
    }
}

pub struct ZoneSyncEngine {
    zone_count: u16,
    offline_after: Duration,
    request_timeout: Duration,
    watchdog_interval: Duration,
    telemetry_flush: Duration,
    snapshot_interval: Option<Duration>,

    cache: ZoneCache,
    pins: ManualPins,
    block: BlockWindow,
    limiter: SerialRateLimiter,
    pending: DashMap<ZoneId, PendingZoneRequest>,
    next_request_id: AtomicU64,
    telemetry: Mutex<Vec<TelemetryRow>>,
    playback_mode: Mutex<PlaybackMode>,

    serial: Arc<dyn SerialTransport>,
    broker: Arc<dyn BrokerPublisher>,
    store: Arc<dyn ZoneStore>,
    emitter: Arc<dyn EventEmitter>,
}

impl ZoneSyncEngine {
    pub fn new(
        config: &Config,
        serial: Arc<dyn SerialTransport>,
        broker: Arc<dyn BrokerPublisher>,
        store: Arc<dyn ZoneStore>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            zone_count: config.zone_count,
            offline_after: config.offline_after(),
            request_timeout: config.status_request_timeout(),
            watchdog_interval: config.watchdog_interval(),
            telemetry_flush: config.telemetry_flush(),
            snapshot_interval: (config.snapshot_interval_secs > 0)
                .then(|| Duration::from_secs(config.snapshot_interval_secs)),
            cache: ZoneCache::new(),
            pins: ManualPins::new(config.manual_debounce()),
            block: BlockWindow::new(config.all_zones_block()),
            limiter: SerialRateLimiter::new(config.serial_min_interval(), config.serial_echo_window()),
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            telemetry: Mutex::new(Vec::new()),
            playback_mode: Mutex::new(PlaybackMode::None),
            serial,
            broker,
            store,
            emitter,
        }
    }

    pub fn zone_count(&self) -> u16 {
        self.zone_count
    }

    pub fn zone(&self, zone: ZoneId) -> Option<ZoneEntry> {
        self.cache.get(zone)
    }

    /// Every known zone, for subscriber snapshots.
    pub fn zones(&self) -> Vec<ZoneSnapshot> {
        self.cache.snapshot()
    }

    pub fn has_pending_request(&self, zone: ZoneId) -> bool {
        self.pending.contains_key(&zone)
    }

    /// Seeds the cache from the store. Hydrated zones start offline.
    pub async fn hydrate(&self) -> ZonecastResult<usize> {
        let records = self.store.load_zones().await?;
        let count = records.len();
        self.cache.hydrate(
            records
                .into_iter()
                .filter(|r| self.is_valid_zone(r.no))
                .map(|r| (r.no, r.status.into(), r.last_seen)),
        );
        log::info!("[ZoneSync] Hydrated {} zone record(s) from store", count);
        Ok(count)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Broker Ingress
    // ─────────────────────────────────────────────────────────────────────────

    /// Classifies and applies one inbound broker message.
    ///
    /// Malformed topics and payloads are rejected with a validation error and
    /// leave the cache untouched.
    pub async fn handle_broker_message(&self, topic: &str, payload: &str) -> ZonecastResult<()> {
        let message = route(topic, payload).map_err(|e| {
            log::warn!("[ZoneSync] Dropping message on {}: {}", topic, e);
            ZonecastError::from(e)
        })?;

        match message {
            InboundMessage::Command {
                target,
                command,
                source,
            } => self.handle_command(target, command, source).await,
            InboundMessage::Status { target, frame } => self.handle_status(target, frame).await,
            InboundMessage::Telemetry { zone, payload } => {
                self.check_zone(zone)?;
                self.touch(zone);
                self.telemetry.lock().push(TelemetryRow {
                    zone,
                    payload,
                    received_at: now_millis(),
                });
                Ok(())
            }
            InboundMessage::Presence { zone, online } => {
                self.check_zone(zone)?;
                if online {
                    self.touch(zone);
                } else if self.cache.mark_offline(zone) {
                    log::info!("[ZoneSync] Zone {} reported offline (LWT)", zone);
                    self.emit_presence(zone, false);
                }
                Ok(())
            }
            InboundMessage::BulkScan(states) => self.apply_bulk_scan(&states).await.map(|_| ()),
        }
    }

    async fn handle_command(
        &self,
        target: ZoneTarget,
        command: ZoneCommand,
        source: CommandSource,
    ) -> ZonecastResult<()> {
        let update = match command {
            ZoneCommand::SetStream(on) => self.stream_update(on),
            ZoneCommand::SetVolume(level) => StatusUpdate::volume(level),
            ZoneCommand::GetStatus => {
                log::trace!("[ZoneSync] Ignoring get_status request seen on broker");
                return Ok(());
            }
        };

        match target {
            ZoneTarget::Zone(zone) => {
                self.check_zone(zone)?;
                let outcome = self.apply_update(zone, update, source);
                if source.mirrors_to_serial() {
                    let frame = match command {
                        ZoneCommand::SetVolume(level) => SerialCommand::VolumeSet { zone, level },
                        _ => SerialCommand::ZoneToggle {
                            zone,
                            on: outcome.current.stream_enabled,
                        },
                    };
                    self.write_serial(frame).await;
                }
                self.commit(zone, &outcome, source).await;
            }
            ZoneTarget::All => {
                let zones: Vec<ZoneId> = (1..=self.zone_count).collect();
                if matches!(command, ZoneCommand::SetStream(_)) {
                    self.block.open();
                    log::info!("[ZoneSync] All-zones command, per-zone re-sync blocked");
                }
                self.apply_to_many(&zones, update, source, matches!(command, ZoneCommand::SetStream(_)))
                    .await;
            }
            ZoneTarget::Selected(zones) => {
                for zone in &zones {
                    self.check_zone(*zone)?;
                }
                self.apply_to_many(&zones, update, source, matches!(command, ZoneCommand::SetStream(_)))
                    .await;
            }
        }
        Ok(())
    }

    /// Applies one update to several zones, then performs at most one bulk
    /// serial write, one persistence write and one broadcast.
    async fn apply_to_many(
        &self,
        zones: &[ZoneId],
        update: StatusUpdate,
        source: CommandSource,
        write_bulk: bool,
    ) {
        let mut changed = Vec::new();
        for zone in zones {
            let outcome = self.apply_update(*zone, update, source);
            if outcome.came_online {
                self.emit_presence(*zone, true);
            }
            if outcome.changed() {
                changed.push(ZoneStatusRow {
                    zone: *zone,
                    status: outcome.current,
                });
            }
        }

        if write_bulk && source.mirrors_to_serial() {
            let states = self.cache.stream_vector(self.zone_count);
            self.write_serial(SerialCommand::BulkZoneVector(states)).await;
        }

        self.persist_and_broadcast_batch(changed, source).await;
    }

    async fn handle_status(&self, target: ZoneTarget, frame: StatusFrame) -> ZonecastResult<()> {
        let update = StatusUpdate {
            stream_enabled: Some(frame.stream_enabled),
            is_playing: frame.is_playing,
            volume: frame.volume,
            playback_mode: None,
        };

        let zone = match target {
            ZoneTarget::Zone(zone) => zone,
            ZoneTarget::All | ZoneTarget::Selected(_) => {
                let zones: Vec<ZoneId> = (1..=self.zone_count).collect();
                self.apply_to_many(&zones, update, frame.source, false).await;
                return Ok(());
            }
        };

        self.check_zone(zone)?;
        if let Some((_, waiter)) = self.pending.remove(&zone) {
            log::debug!("[ZoneSync] Status for zone {} resolves request {}", zone, waiter.id);
            let _ = waiter.tx.send(frame.clone());
        }

        let outcome = self.apply_update(zone, update, frame.source);

        if outcome.changed() && frame.source.mirrors_to_serial() {
            if self.block.is_open() {
                log::debug!(
                    "[ZoneSync] All-zones window open, skipping serial re-sync of zone {}",
                    zone
                );
            } else {
                let previous = outcome.previous;
                if previous.map(|p| p.stream_enabled) != Some(outcome.current.stream_enabled) {
                    self.write_serial(SerialCommand::ZoneToggle {
                        zone,
                        on: outcome.current.stream_enabled,
                    })
                    .await;
                }
                if frame.volume.is_some()
                    && previous.map(|p| p.volume) != Some(outcome.current.volume)
                {
                    self.write_serial(SerialCommand::VolumeSet {
                        zone,
                        level: outcome.current.volume,
                    })
                    .await;
                }
            }
        }

        self.commit(zone, &outcome, frame.source).await;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Serial Ingress
    // ─────────────────────────────────────────────────────────────────────────

    /// Applies one frame received from the amplifier controller.
    ///
    /// A frame equal to our own last write inside the echo window only
    /// refreshes lastSeen. Any other toggle or volume frame is an operator
    /// action on the physical panel.
    pub async fn handle_serial_frame(&self, command: SerialCommand) -> ZonecastResult<()> {
        if self.limiter.is_echo(&command.encode()) {
            log::trace!("[ZoneSync] Serial echo {}", command.encode());
            match &command {
                SerialCommand::ZoneToggle { zone, .. } | SerialCommand::VolumeSet { zone, .. } => {
                    if self.is_valid_zone(*zone) {
                        self.touch(*zone);
                    }
                }
                SerialCommand::BulkZoneVector(states) => {
                    for index in 0..states.len().min(self.zone_count as usize) {
                        self.touch(index as ZoneId + 1);
                    }
                }
            }
            return Ok(());
        }

        match command {
            SerialCommand::BulkZoneVector(states) => self.apply_bulk_scan(&states).await.map(|_| ()),
            SerialCommand::ZoneToggle { zone, on } => {
                self.check_zone(zone)?;
                self.manual_panel_change(zone, self.stream_update(on), ZoneCommand::SetStream(on))
                    .await;
                Ok(())
            }
            SerialCommand::VolumeSet { zone, level } => {
                self.check_zone(zone)?;
                self.manual_panel_change(zone, StatusUpdate::volume(level), ZoneCommand::SetVolume(level))
                    .await;
                Ok(())
            }
        }
    }

    async fn manual_panel_change(&self, zone: ZoneId, update: StatusUpdate, command: ZoneCommand) {
        log::info!("[ZoneSync] Manual panel action on zone {}: {:?}", zone, command);
        // The hardware moved on its own; our last write no longer describes it.
        self.limiter.forget();

        let outcome = self.apply_update(zone, update, CommandSource::ManualPanel);
        self.commit(zone, &outcome, CommandSource::ManualPanel).await;

        let payload = encode_command(&command, CommandSource::ManualPanel);
        if let Err(e) = self.broker.publish(&command_topic(zone), payload).await {
            log::warn!("[ZoneSync] Failed to republish manual change for zone {}: {}", zone, e);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bulk Reconciliation
    // ─────────────────────────────────────────────────────────────────────────

    /// Reconciles a bulk vector against the cache.
    ///
    /// Vectors longer than the zone count are rejected; shorter ones reconcile
    /// the zones they cover. Changed zones are persisted and broadcast as one
    /// batch; matching zones only have lastSeen refreshed.
    pub async fn apply_bulk_scan(&self, states: &[bool]) -> ZonecastResult<BulkOutcome> {
        if states.len() > self.zone_count as usize {
            return Err(ZonecastError::Validation(format!(
                "bulk vector has {} entries for {} zones",
                states.len(),
                self.zone_count
            )));
        }
        if states.len() < self.zone_count as usize {
            log::warn!(
                "[ZoneSync] Short bulk vector ({} of {} zones), reconciling prefix",
                states.len(),
                self.zone_count
            );
        }

        let outcome = self
            .cache
            .apply_bulk(states, |zone| self.pins.active(zone).map(|p| p.stream_enabled));

        for zone in &outcome.came_online {
            self.emit_presence(*zone, true);
        }

        log::debug!(
            "[ZoneSync] Bulk scan: {} changed, {} unchanged",
            outcome.changed.len(),
            outcome.refreshed.len()
        );

        let rows = outcome
            .changed
            .iter()
            .map(|(zone, status)| ZoneStatusRow {
                zone: *zone,
                status: *status,
            })
            .collect();
        self.persist_and_broadcast_batch(rows, CommandSource::BulkScan)
            .await;

        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Request / Response Bridge
    // ─────────────────────────────────────────────────────────────────────────

    /// Asks a zone device for its status and waits for the reply.
    ///
    /// Only one request per zone may be outstanding. A reply arriving after
    /// the deadline does not resolve anything.
    pub async fn request_status(&self, zone: ZoneId) -> ZonecastResult<StatusFrame> {
        self.check_zone(zone)?;

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(zone) {
            Entry::Occupied(_) => {
                return Err(ZonecastError::Validation(format!(
                    "request already pending for zone {}",
                    zone
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingZoneRequest { id, tx });
            }
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            zone,
            id,
        };

        let payload = encode_command(&ZoneCommand::GetStatus, CommandSource::App);
        self.broker.publish(&command_topic(zone), payload).await?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(ZonecastError::Internal(format!(
                "status request {} for zone {} was cancelled",
                id, zone
            ))),
            Err(_) => {
                log::warn!("[ZoneSync] Status request {} for zone {} timed out", id, zone);
                Err(ZonecastError::Timeout(format!("zone {} did not answer", zone)))
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Flags every zone silent past the offline threshold. Each zone is
    /// reported once per outage.
    pub fn watchdog_tick(&self) -> Vec<ZoneId> {
        let flagged = self.cache.sweep_offline(self.offline_after);
        for zone in &flagged {
            log::info!("[ZoneSync] Zone {} silent for over {:?}, marking offline", zone, self.offline_after);
            self.emit_presence(*zone, false);
        }
        flagged
    }

    /// Writes buffered telemetry to the store and subscribers.
    pub async fn flush_telemetry(&self) -> usize {
        let rows = std::mem::take(&mut *self.telemetry.lock());
        if rows.is_empty() {
            return 0;
        }
        let count = rows.len();
        if let Err(e) = self.store.append_telemetry(&rows).await {
            log::warn!("[ZoneSync] Failed to persist {} telemetry row(s): {}", count, e);
        }
        self.emitter.emit_telemetry(TelemetryEvent::Batch {
            rows,
            timestamp: now_millis(),
        });
        count
    }

    /// Persists every cached zone.
    pub async fn snapshot(&self) {
        let records: Vec<ZoneRecord> = self
            .cache
            .entries()
            .into_iter()
            .map(|(zone, entry)| ZoneRecord::new(zone, entry.status, entry.last_seen_ms))
            .collect();
        if records.is_empty() {
            return;
        }
        if let Err(e) = self.store.save_zones(&records).await {
            log::warn!("[ZoneSync] Snapshot of {} zone(s) failed: {}", records.len(), e);
        }
    }

    /// Runs the watchdog, telemetry flush and snapshot timers until cancelled.
    pub async fn run_maintenance(self: Arc<Self>, cancel: CancellationToken) {
        let mut watchdog = interval_after(self.watchdog_interval);
        let mut flush = interval_after(self.telemetry_flush);
        let mut snapshot = self.snapshot_interval.map(interval_after);

        log::info!("[ZoneSync] Maintenance loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = watchdog.tick() => {
                    self.watchdog_tick();
                }
                _ = flush.tick() => {
                    self.flush_telemetry().await;
                }
                _ = tick_optional(&mut snapshot) => {
                    self.snapshot().await;
                }
            }
        }

        self.flush_telemetry().await;
        self.snapshot().await;
        log::info!("[ZoneSync] Maintenance loop stopped");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn is_valid_zone(&self, zone: ZoneId) -> bool {
        (1..=self.zone_count).contains(&zone)
    }

    fn check_zone(&self, zone: ZoneId) -> ZonecastResult<()> {
        if self.is_valid_zone(zone) {
            Ok(())
        } else {
            Err(ZonecastError::Validation(format!(
                "zone {} outside 1..={}",
                zone, self.zone_count
            )))
        }
    }

    /// Update for a stream toggle, keeping `is_playing` in line with the
    /// arbiter's current mode.
    fn stream_update(&self, on: bool) -> StatusUpdate {
        let mode = if on { *self.playback_mode.lock() } else { PlaybackMode::None };
        StatusUpdate {
            stream_enabled: Some(on),
            is_playing: Some(mode != PlaybackMode::None),
            volume: None,
            playback_mode: Some(mode),
        }
    }

    fn apply_update(&self, zone: ZoneId, update: StatusUpdate, source: CommandSource) -> ApplyOutcome {
        if source == CommandSource::ManualPanel {
            let outcome = self.cache.apply(zone, update, source, |_| {});
            self.pins
                .pin(zone, outcome.current.stream_enabled, outcome.current.is_playing);
            outcome
        } else {
            self.cache.apply(zone, update, source, |update| {
                if self.pins.enforce(zone, update) {
                    log::debug!("[ZoneSync] Zone {} pinned by manual action, keeping panel state", zone);
                }
            })
        }
    }

    fn touch(&self, zone: ZoneId) {
        if self.cache.touch(zone) {
            log::info!("[ZoneSync] Zone {} back online", zone);
            self.emit_presence(zone, true);
        }
    }

    /// Persists and broadcasts a single-zone outcome.
    async fn commit(&self, zone: ZoneId, outcome: &ApplyOutcome, source: CommandSource) {
        if outcome.came_online {
            self.emit_presence(zone, true);
        }
        if !outcome.changed() {
            return;
        }
        let Some(entry) = self.cache.get(zone) else {
            return;
        };
        if let Err(e) = self
            .store
            .save_zones(&[ZoneRecord::new(zone, entry.status, entry.last_seen_ms)])
            .await
        {
            log::warn!("[ZoneSync] Failed to persist zone {}: {}", zone, e);
        }
        self.emitter.emit_zone(ZoneEvent::status(
            zone,
            entry.status,
            source,
            entry.online,
            now_millis(),
        ));
    }

    async fn persist_and_broadcast_batch(&self, rows: Vec<ZoneStatusRow>, source: CommandSource) {
        if rows.is_empty() {
            return;
        }
        let now = now_millis();
        let records: Vec<ZoneRecord> = rows
            .iter()
            .map(|row| ZoneRecord::new(row.zone, row.status, now))
            .collect();
        if let Err(e) = self.store.save_zones(&records).await {
            log::warn!("[ZoneSync] Failed to persist {} zone(s): {}", records.len(), e);
        }
        self.emitter.emit_zone(ZoneEvent::Batch {
            zones: rows,
            source,
            timestamp: now,
        });
    }

    fn emit_presence(&self, zone: ZoneId, online: bool) {
        self.emitter.emit_zone(ZoneEvent::Presence {
            zone,
            online,
            timestamp: now_millis(),
        });
    }

    async fn write_serial(&self, command: SerialCommand) -> bool {
        let frame = command.encode();
        match self.limiter.admit(&frame) {
            WriteDecision::Send => {}
            WriteDecision::SkipDuplicate => {
                log::debug!("[ZoneSync] Skipping duplicate serial write {}", frame);
                return false;
            }
            WriteDecision::SkipTooSoon => {
                log::debug!("[ZoneSync] Skipping serial write {} (rate limited)", frame);
                return false;
            }
        }
        match self.serial.write(&command).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[ZoneSync] Serial write {} failed: {}", frame, e);
                false
            }
        }
    }
}

#[async_trait]
impl ZoneGate for ZoneSyncEngine {
    fn any_stream_enabled(&self) -> bool {
        self.cache.any_stream_enabled()
    }

    async fn playback_changed(&self, mode: PlaybackMode) {
        *self.playback_mode.lock() = mode;
        let rows = self
            .cache
            .project_playback(mode)
            .into_iter()
            .map(|(zone, status)| ZoneStatusRow { zone, status })
            .collect();
        self.persist_and_broadcast_batch(rows, CommandSource::App).await;
    }
}

fn interval_after(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::emitter::tests::RecordingEmitter;
    use crate::persistence::MemoryZoneStore;
    use crate::zones::traits::TransportError;

    #[derive(Default)]
    struct RecordingSerial {
        writes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SerialTransport for RecordingSerial {
        async fn write(&self, command: &SerialCommand) -> Result<(), TransportError> {
            self.writes.lock().push(command.encode());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingBroker {
        published: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl BrokerPublisher for RecordingBroker {
        async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError> {
            self.published.lock().push((topic.to_string(), payload));
            Ok(())
        }
    }

    struct Harness {
        engine: Arc<ZoneSyncEngine>,
        serial: Arc<RecordingSerial>,
        broker: Arc<RecordingBroker>,
        store: Arc<MemoryZoneStore>,
        emitter: Arc<RecordingEmitter>,
    }

    impl Harness {
        fn new(zone_count: u16) -> Self {
            let config = Config {
                zone_count,
                ..Default::default()
            };
            let serial = Arc::new(RecordingSerial::default());
            let broker = Arc::new(RecordingBroker::default());
            let store = Arc::new(MemoryZoneStore::new());
            let emitter = Arc::new(RecordingEmitter::default());
            let engine = Arc::new(ZoneSyncEngine::new(
                &config,
                serial.clone(),
                broker.clone(),
                store.clone(),
                emitter.clone(),
            ));
            Self {
                engine,
                serial,
                broker,
                store,
                emitter,
            }
        }

        fn writes(&self) -> Vec<String> {
            self.serial.writes.lock().clone()
        }

        fn published(&self) -> Vec<(String, String)> {
            self.broker.published.lock().clone()
        }

        fn stream_enabled(&self, zone: ZoneId) -> bool {
            self.engine.zone(zone).unwrap().status.stream_enabled
        }

        /// Creates zones `1..=n` switched off, as reported by the devices.
        async fn seed_off(&self) {
            self.engine
                .handle_broker_message("all/status", r#"{"stream_enabled":false,"source":"bulk-scan"}"#)
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn identical_toggle_within_rate_window_writes_once() {
        let h = Harness::new(4);
        h.engine
            .handle_broker_message("zone1/command", r#"{"set_stream":true}"#)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        h.engine
            .handle_broker_message("zone1/command", r#"{"set_stream":true}"#)
            .await
            .unwrap();

        assert_eq!(h.writes(), vec!["$S0001Y$"]);
        assert!(h.stream_enabled(1));
    }

    #[tokio::test(start_paused = true)]
    async fn different_write_inside_rate_window_is_skipped() {
        let h = Harness::new(4);
        h.engine
            .handle_broker_message("zone1/command", r#"{"set_stream":true}"#)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        h.engine
            .handle_broker_message("zone2/command", r#"{"set_stream":true}"#)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(300)).await;
        h.engine
            .handle_broker_message("zone3/command", r#"{"set_volume":8}"#)
            .await
            .unwrap();

        assert_eq!(h.writes(), vec!["$S0001Y$", "$V00038$"]);
        // The cache still reflects every command.
        assert!(h.stream_enabled(2));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_pin_holds_for_debounce_window() {
        let h = Harness::new(2);
        h.seed_off().await;

        h.engine
            .handle_serial_frame(SerialCommand::ZoneToggle { zone: 1, on: true })
            .await
            .unwrap();
        assert!(h.stream_enabled(1));

        tokio::time::advance(Duration::from_secs(3)).await;
        h.engine
            .handle_broker_message("zone1/status", r#"{"stream_enabled":false,"source":"app"}"#)
            .await
            .unwrap();
        assert!(h.stream_enabled(1), "stale update must not revert the panel");

        tokio::time::advance(Duration::from_secs(3)).await;
        h.engine
            .handle_broker_message("zone1/status", r#"{"stream_enabled":false,"source":"app"}"#)
            .await
            .unwrap();
        assert!(!h.stream_enabled(1));
        // Only the app-sourced change after the window is mirrored to hardware.
        assert_eq!(h.writes(), vec!["$S0001N$"]);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_panel_frame_is_republished_not_written() {
        let h = Harness::new(3);
        h.seed_off().await;

        h.engine
            .handle_serial_frame(SerialCommand::ZoneToggle { zone: 2, on: true })
            .await
            .unwrap();

        assert!(h.writes().is_empty());
        let published = h.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "zone2/command");
        let payload: serde_json::Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(payload["set_stream"], true);
        assert_eq!(payload["source"], "manual-panel");
        assert!(h.store.get(2).unwrap().status.stream_enabled);

        // The device echoes the command back on the broker: still no serial write.
        h.engine
            .handle_broker_message("zone2/command", &published[0].1)
            .await
            .unwrap();
        assert!(h.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn serial_echo_of_own_write_only_refreshes() {
        let h = Harness::new(2);
        h.engine
            .handle_broker_message("zone1/command", r#"{"set_stream":true}"#)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;

        h.engine
            .handle_serial_frame(SerialCommand::ZoneToggle { zone: 1, on: true })
            .await
            .unwrap();

        assert!(h.published().is_empty());
        assert_eq!(h.engine.zone(1).unwrap().last_source, CommandSource::App);
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_scan_updates_only_differing_zones() {
        let h = Harness::new(4);
        h.seed_off().await;
        let events_before = h.emitter.zone_events().len();
        tokio::time::advance(Duration::from_secs(1)).await;

        let outcome = h
            .engine
            .handle_broker_message("bulk/test", "YNNY")
            .await;
        assert!(outcome.is_ok());

        assert_eq!(h.store.save_batches().last().unwrap(), &vec![1, 4]);
        let events = h.emitter.zone_events();
        assert_eq!(events.len(), events_before + 1);
        match events.last().unwrap() {
            ZoneEvent::Batch { zones, source, .. } => {
                let changed: Vec<ZoneId> = zones.iter().map(|r| r.zone).collect();
                assert_eq!(changed, vec![1, 4]);
                assert_eq!(*source, CommandSource::BulkScan);
            }
            other => panic!("expected batch, got {:?}", other),
        }

        assert!(h.stream_enabled(1) && h.stream_enabled(4));
        assert!(!h.stream_enabled(2) && !h.stream_enabled(3));
        assert_eq!(h.engine.zone(2).unwrap().last_seen, Instant::now());
    }

    #[tokio::test]
    async fn bulk_vector_longer_than_zone_count_is_rejected() {
        let h = Harness::new(2);
        let result = h.engine.apply_bulk_scan(&[true, true, true]).await;
        assert!(matches!(result, Err(ZonecastError::Validation(_))));
        assert!(h.engine.zones().is_empty());

        let outcome = h.engine.apply_bulk_scan(&[true]).await.unwrap();
        assert_eq!(outcome.changed.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_zones_command_writes_bulk_and_blocks_resync() {
        let h = Harness::new(3);
        h.seed_off().await;

        h.engine
            .handle_broker_message("all/command", r#"{"set_stream":true}"#)
            .await
            .unwrap();
        assert_eq!(h.writes(), vec!["YYY"]);

        tokio::time::advance(Duration::from_secs(1)).await;
        h.engine
            .handle_broker_message("zone2/status", r#"{"stream_enabled":false}"#)
            .await
            .unwrap();
        assert_eq!(h.writes(), vec!["YYY"], "re-sync suppressed inside window");

        tokio::time::advance(Duration::from_secs(5)).await;
        h.engine
            .handle_broker_message("zone3/status", r#"{"stream_enabled":false}"#)
            .await
            .unwrap();
        assert_eq!(h.writes(), vec!["YYY", "$S0003N$"]);
    }

    #[tokio::test(start_paused = true)]
    async fn all_zones_volume_never_touches_serial() {
        let h = Harness::new(3);
        h.engine
            .handle_broker_message("all/command", r#"{"set_volume":9}"#)
            .await
            .unwrap();
        assert!(h.writes().is_empty());
        assert_eq!(h.engine.zone(3).unwrap().status.volume, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn select_command_writes_one_bulk_vector() {
        let h = Harness::new(4);
        h.seed_off().await;
        h.engine
            .handle_broker_message("select/command", r#"{"zone":[2,4],"set_stream":true}"#)
            .await
            .unwrap();
        assert_eq!(h.writes(), vec!["NYNY"]);
        assert_eq!(h.store.save_batches().last().unwrap(), &vec![2, 4]);

        let bad = h
            .engine
            .handle_broker_message("select/command", r#"{"zone":[2,9],"set_stream":true}"#)
            .await;
        assert!(matches!(bad, Err(ZonecastError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_zone_goes_offline_once() {
        let h = Harness::new(2);
        h.engine
            .handle_broker_message("zone1/status", r#"{"stream_enabled":true}"#)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(36)).await;
        assert_eq!(h.engine.watchdog_tick(), vec![1]);
        assert!(h.engine.watchdog_tick().is_empty());

        let offline_events = h
            .emitter
            .zone_events()
            .into_iter()
            .filter(|e| matches!(e, ZoneEvent::Presence { online: false, .. }))
            .count();
        assert_eq!(offline_events, 1);
        assert!(!h.engine.zone(1).unwrap().online);

        h.engine
            .handle_broker_message("zone1/monitoring", r#"{"rssi":-70}"#)
            .await
            .unwrap();
        assert!(h.engine.zone(1).unwrap().online);
        assert!(matches!(
            h.emitter.zone_events().last(),
            Some(ZoneEvent::Presence { zone: 1, online: true, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn lwt_offline_marks_zone_immediately() {
        let h = Harness::new(2);
        h.seed_off().await;
        h.engine.handle_broker_message("zone2/lwt", "offline").await.unwrap();
        assert!(!h.engine.zone(2).unwrap().online);
        h.engine.handle_broker_message("zone2/lwt", "online").await.unwrap();
        assert!(h.engine.zone(2).unwrap().online);
    }

    async fn wait_for_pending(engine: &ZoneSyncEngine, zone: ZoneId) {
        while !engine.has_pending_request(zone) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn status_request_times_out_and_ignores_late_reply() {
        let h = Harness::new(2);
        let engine = h.engine.clone();
        let request = tokio::spawn(async move { engine.request_status(1).await });
        wait_for_pending(&h.engine, 1).await;

        let second = h.engine.request_status(1).await;
        assert!(matches!(second, Err(ZonecastError::Validation(_))));
        assert_eq!(
            h.published(),
            vec![("zone1/command".to_string(), r#"{"get_status":true}"#.to_string())]
        );

        tokio::time::advance(Duration::from_millis(5_000)).await;
        let result = request.await.unwrap();
        assert!(matches!(result, Err(ZonecastError::Timeout(_))));
        assert!(!h.engine.has_pending_request(1));

        tokio::time::advance(Duration::from_millis(100)).await;
        h.engine
            .handle_broker_message("zone1/status", r#"{"stream_enabled":true}"#)
            .await
            .unwrap();
        assert!(!h.engine.has_pending_request(1));
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_status_request_frees_the_zone() {
        let h = Harness::new(2);
        let engine = h.engine.clone();
        let request = tokio::spawn(async move { engine.request_status(1).await });
        wait_for_pending(&h.engine, 1).await;

        request.abort();
        assert!(request.await.unwrap_err().is_cancelled());
        assert!(!h.engine.has_pending_request(1));

        let engine = h.engine.clone();
        let retry = tokio::spawn(async move { engine.request_status(1).await });
        wait_for_pending(&h.engine, 1).await;
        assert_eq!(h.published().len(), 2);

        tokio::time::advance(Duration::from_millis(5_000)).await;
        let result = retry.await.unwrap();
        assert!(matches!(result, Err(ZonecastError::Timeout(_))));
        assert!(!h.engine.has_pending_request(1));
    }

    #[tokio::test(start_paused = true)]
    async fn status_request_resolves_on_matching_status() {
        let h = Harness::new(2);
        let engine = h.engine.clone();
        let request = tokio::spawn(async move { engine.request_status(2).await });
        wait_for_pending(&h.engine, 2).await;

        h.engine
            .handle_broker_message("zone2/status", r#"{"stream_enabled":true,"volume":6}"#)
            .await
            .unwrap();

        let frame = request.await.unwrap().unwrap();
        assert_eq!(frame.zone, Some(2));
        assert_eq!(frame.volume, Some(6));
    }

    #[tokio::test]
    async fn telemetry_is_flushed_in_batches() {
        let h = Harness::new(2);
        h.engine
            .handle_broker_message("zone1/monitoring", r#"{"temp":41}"#)
            .await
            .unwrap();
        h.engine
            .handle_broker_message("zone2/monitoring", r#"{"temp":39}"#)
            .await
            .unwrap();

        assert_eq!(h.engine.flush_telemetry().await, 2);
        assert_eq!(h.engine.flush_telemetry().await, 0);
        assert_eq!(h.store.telemetry().len(), 2);
        assert_eq!(h.emitter.telemetry.lock().len(), 1);
    }

    #[tokio::test]
    async fn malformed_messages_leave_cache_untouched() {
        let h = Harness::new(2);
        assert!(h.engine.handle_broker_message("zone1/status", "{").await.is_err());
        assert!(h.engine.handle_broker_message("zone9/status", r#"{"stream_enabled":true}"#).await.is_err());
        assert!(h.engine.handle_broker_message("zone1/monitoring", "not json").await.is_err());
        assert!(h.engine.zones().is_empty());
    }

    #[tokio::test]
    async fn playback_projection_marks_enabled_zones() {
        let h = Harness::new(2);
        h.engine
            .handle_broker_message("zone1/status", r#"{"stream_enabled":true,"source":"bulk-scan"}"#)
            .await
            .unwrap();
        h.engine
            .handle_broker_message("zone2/status", r#"{"stream_enabled":false,"source":"bulk-scan"}"#)
            .await
            .unwrap();
        assert!(h.engine.any_stream_enabled());

        h.engine.playback_changed(PlaybackMode::Schedule).await;
        let zone1 = h.engine.zone(1).unwrap().status;
        assert!(zone1.is_playing);
        assert_eq!(zone1.playback_mode, PlaybackMode::Schedule);
        assert!(!h.engine.zone(2).unwrap().status.is_playing);

        // A zone enabled mid-session picks up the active mode.
        h.engine
            .handle_broker_message("zone2/command", r#"{"set_stream":true}"#)
            .await
            .unwrap();
        assert_eq!(h.engine.zone(2).unwrap().status.playback_mode, PlaybackMode::Schedule);
    }

    #[tokio::test]
    async fn snapshot_and_hydrate_round_trip_through_store() {
        let h = Harness::new(2);
        h.engine
            .handle_broker_message("zone2/command", r#"{"set_volume":14}"#)
            .await
            .unwrap();
        h.engine.snapshot().await;

        let config = Config {
            zone_count: 2,
            ..Default::default()
        };
        let restarted = ZoneSyncEngine::new(
            &config,
            Arc::new(RecordingSerial::default()),
            Arc::new(RecordingBroker::default()),
            h.store.clone(),
            Arc::new(RecordingEmitter::default()),
        );
        assert_eq!(restarted.hydrate().await.unwrap(), 1);
        let entry = restarted.zone(2).unwrap();
        assert_eq!(entry.status.volume, 14);
        assert!(!entry.online);
    }
}
