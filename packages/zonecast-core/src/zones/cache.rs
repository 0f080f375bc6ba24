//! Zone status cache.
//!
//! The single authoritative table of per-zone state. Only the sync engine
//! mutates it. Every operation completes under one lock acquisition, so a bulk
//! diff is never interleaved with a per-zone update.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use crate::types::{CommandSource, PlaybackMode, ZoneId, ZoneStatus};
use crate::utils::now_millis;

/// Cached state of one zone. Created on first sighting and never removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneEntry {
    pub status: ZoneStatus,
    pub online: bool,
    /// Unix milliseconds of the last message from any producer.
    pub last_seen_ms: u64,
    /// Monotonic time of the last message, used by the watchdog.
    pub last_seen: Instant,
    pub last_source: CommandSource,
}

impl ZoneEntry {
    fn fresh(source: CommandSource) -> Self {
        Self {
            status: ZoneStatus::default(),
            online: true,
            last_seen_ms: now_millis(),
            last_seen: Instant::now(),
            last_source: source,
        }
    }

    fn touch(&mut self) -> bool {
        self.last_seen_ms = now_millis();
        self.last_seen = Instant::now();
        let came_online = !self.online;
        self.online = true;
        came_online
    }
}

/// Serializable view of a zone for subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneSnapshot {
    pub zone: ZoneId,
    #[serde(flatten)]
    pub status: ZoneStatus,
    pub online: bool,
    pub last_seen: u64,
    pub source: CommandSource,
}

/// Partial update to a zone; `None` leaves the cached field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub stream_enabled: Option<bool>,
    pub is_playing: Option<bool>,
    pub volume: Option<u8>,
    pub playback_mode: Option<PlaybackMode>,
}

impl StatusUpdate {
    pub fn stream(on: bool) -> Self {
        Self {
            stream_enabled: Some(on),
            ..Default::default()
        }
    }

    pub fn volume(level: u8) -> Self {
        Self {
            volume: Some(level),
            ..Default::default()
        }
    }

    fn apply_to(&self, status: &mut ZoneStatus) {
        if let Some(v) = self.stream_enabled {
            status.stream_enabled = v;
        }
        if let Some(v) = self.is_playing {
            status.is_playing = v;
        }
        if let Some(v) = self.volume {
            status.volume = v;
        }
        if let Some(v) = self.playback_mode {
            status.playback_mode = v;
        }
    }
}

/// Result of applying an update to one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub previous: Option<ZoneStatus>,
    pub current: ZoneStatus,
    pub came_online: bool,
}

impl ApplyOutcome {
    /// Whether any status field differs from before.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.previous != Some(self.current)
    }
}

/// Result of reconciling a bulk vector against the cache.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BulkOutcome {
    /// Zones whose `stream_enabled` flipped, with their new status.
    pub changed: Vec<(ZoneId, ZoneStatus)>,
    /// Zones that matched the vector and only had lastSeen refreshed.
    pub refreshed: Vec<ZoneId>,
    /// Zones that were offline before this scan.
    pub came_online: Vec<ZoneId>,
}

#[derive(Debug, Default)]
pub struct ZoneCache {
    entries: RwLock<BTreeMap<ZoneId, ZoneEntry>>,
}

impl ZoneCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, zone: ZoneId) -> Option<ZoneEntry> {
        self.entries.read().get(&zone).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Every zone in ascending order.
    pub fn snapshot(&self) -> Vec<ZoneSnapshot> {
        self.entries
            .read()
            .iter()
            .map(|(zone, entry)| ZoneSnapshot {
                zone: *zone,
                status: entry.status,
                online: entry.online,
                last_seen: entry.last_seen_ms,
                source: entry.last_source,
            })
            .collect()
    }

    /// Raw entries in ascending zone order.
    pub fn entries(&self) -> Vec<(ZoneId, ZoneEntry)> {
        self.entries.read().iter().map(|(z, e)| (*z, *e)).collect()
    }

    /// Whether any zone currently has streaming enabled.
    pub fn any_stream_enabled(&self) -> bool {
        self.entries.read().values().any(|e| e.status.stream_enabled)
    }

    /// Seeds the cache from persisted records. Hydrated zones start offline
    /// until a producer reports them.
    pub fn hydrate(&self, records: impl IntoIterator<Item = (ZoneId, ZoneStatus, u64)>) {
        let mut entries = self.entries.write();
        let now = Instant::now();
        for (zone, status, last_seen_ms) in records {
            entries.entry(zone).or_insert(ZoneEntry {
                status,
                online: false,
                last_seen_ms,
                last_seen: now,
                last_source: CommandSource::App,
            });
        }
    }

    /// Applies a partial update and marks the zone seen.
    ///
    /// `pin` is consulted under the lock and overrides the volatile fields of
    /// the update when a manual pin is active.
    pub fn apply(
        &self,
        zone: ZoneId,
        mut update: StatusUpdate,
        source: CommandSource,
        pin: impl FnOnce(&mut StatusUpdate),
    ) -> ApplyOutcome {
        pin(&mut update);
        let mut entries = self.entries.write();
        let previous = entries.get(&zone).map(|e| e.status);
        let entry = entries
            .entry(zone)
            .or_insert_with(|| ZoneEntry::fresh(source));
        let came_online = entry.touch();
        update.apply_to(&mut entry.status);
        entry.last_source = source;
        ApplyOutcome {
            previous,
            current: entry.status,
            came_online,
        }
    }

    /// Refreshes lastSeen without touching status. Returns true when the zone
    /// transitioned back online.
    pub fn touch(&self, zone: ZoneId) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(&zone) {
            Some(entry) => entry.touch(),
            None => {
                entries.insert(zone, ZoneEntry::fresh(CommandSource::App));
                false
            }
        }
    }

    /// Flags one zone offline. Returns false if it already was (or is unknown).
    pub fn mark_offline(&self, zone: ZoneId) -> bool {
        match self.entries.write().get_mut(&zone) {
            Some(entry) if entry.online => {
                entry.online = false;
                true
            }
            _ => false,
        }
    }

    /// Flags every online zone silent for longer than `threshold` offline and
    /// returns them. Zones already offline are not reported again.
    pub fn sweep_offline(&self, threshold: Duration) -> Vec<ZoneId> {
        let now = Instant::now();
        let mut flagged = Vec::new();
        for (zone, entry) in self.entries.write().iter_mut() {
            if entry.online && now.saturating_duration_since(entry.last_seen) > threshold {
                entry.online = false;
                entry.last_source = CommandSource::Watchdog;
                flagged.push(*zone);
            }
        }
        flagged
    }

    /// Diffs a bulk vector (`states[0]` is zone 1) against the cache in one
    /// critical section. `pinned` returns the pinned `stream_enabled` value of
    /// a zone under manual debounce.
    pub fn apply_bulk(
        &self,
        states: &[bool],
        pinned: impl Fn(ZoneId) -> Option<bool>,
    ) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        let mut entries = self.entries.write();

        for (index, reported) in states.iter().enumerate() {
            let Ok(zone) = ZoneId::try_from(index + 1) else {
                break;
            };
            let wanted = pinned(zone).unwrap_or(*reported);
            let entry = entries
                .entry(zone)
                .or_insert_with(|| ZoneEntry::fresh(CommandSource::BulkScan));
            if entry.touch() {
                outcome.came_online.push(zone);
            }
            if entry.status.stream_enabled == wanted {
                outcome.refreshed.push(zone);
            } else {
                entry.status.stream_enabled = wanted;
                if !wanted {
                    entry.status.is_playing = false;
                }
                entry.last_source = CommandSource::BulkScan;
                outcome.changed.push((zone, entry.status));
            }
        }
        outcome
    }

    /// On/off state of zones `1..=zone_count` in bulk-vector order. Unknown
    /// zones are reported off.
    pub fn stream_vector(&self, zone_count: u16) -> Vec<bool> {
        let entries = self.entries.read();
        (1..=zone_count)
            .map(|z| entries.get(&z).is_some_and(|e| e.status.stream_enabled))
            .collect()
    }

    /// Projects the arbiter's state onto every stream-enabled zone and returns
    /// the zones whose status changed.
    pub fn project_playback(&self, mode: PlaybackMode) -> Vec<(ZoneId, ZoneStatus)> {
        let playing = mode != PlaybackMode::None;
        let mut changed = Vec::new();
        for (zone, entry) in self.entries.write().iter_mut() {
            let before = entry.status;
            if entry.status.stream_enabled {
                entry.status.is_playing = playing;
                entry.status.playback_mode = mode;
            } else {
                entry.status.is_playing = false;
                entry.status.playback_mode = PlaybackMode::None;
            }
            if entry.status != before {
                changed.push((*zone, entry.status));
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn off_cache(zones: u16) -> ZoneCache {
        let cache = ZoneCache::new();
        for z in 1..=zones {
            cache.apply(z, StatusUpdate::stream(false), CommandSource::App, |_| {});
        }
        cache
    }

    #[test]
    fn apply_creates_and_reports_changes() {
        let cache = ZoneCache::new();
        let first = cache.apply(3, StatusUpdate::volume(9), CommandSource::App, |_| {});
        assert_eq!(first.previous, None);
        assert!(first.changed());
        assert_eq!(cache.get(3).unwrap().status.volume, 9);

        let again = cache.apply(3, StatusUpdate::volume(9), CommandSource::App, |_| {});
        assert!(!again.changed());
    }

    #[test]
    fn pin_overrides_update_before_apply() {
        let cache = off_cache(1);
        let outcome = cache.apply(1, StatusUpdate::stream(true), CommandSource::App, |u| {
            u.stream_enabled = Some(false);
        });
        assert!(!outcome.current.stream_enabled);
    }

    #[test]
    fn bulk_diff_changes_only_differing_zones() {
        let cache = off_cache(4);
        let outcome = cache.apply_bulk(&[true, false, false, true], |_| None);

        let changed: Vec<ZoneId> = outcome.changed.iter().map(|(z, _)| *z).collect();
        assert_eq!(changed, vec![1, 4]);
        assert_eq!(outcome.refreshed, vec![2, 3]);
        assert!(cache.get(1).unwrap().status.stream_enabled);
        assert!(!cache.get(2).unwrap().status.stream_enabled);
        assert_eq!(cache.stream_vector(4), vec![true, false, false, true]);
    }

    #[test]
    fn bulk_respects_pins() {
        let cache = off_cache(2);
        let outcome = cache.apply_bulk(&[true, true], |z| (z == 2).then_some(false));
        assert_eq!(outcome.changed.len(), 1);
        assert!(!cache.get(2).unwrap().status.stream_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_flags_silent_zones_once() {
        let cache = off_cache(2);
        tokio::time::advance(Duration::from_secs(20)).await;
        cache.touch(2);
        tokio::time::advance(Duration::from_secs(16)).await;

        assert_eq!(cache.sweep_offline(Duration::from_secs(35)), vec![1]);
        assert!(cache.sweep_offline(Duration::from_secs(35)).is_empty());
        assert!(!cache.get(1).unwrap().online);

        assert!(cache.touch(1));
        assert!(cache.get(1).unwrap().online);
    }

    #[test]
    fn hydrated_zones_start_offline() {
        let cache = ZoneCache::new();
        let status = ZoneStatus {
            stream_enabled: true,
            volume: 4,
            ..Default::default()
        };
        cache.hydrate([(2, status, 1_700_000_000_000)]);
        let entry = cache.get(2).unwrap();
        assert!(!entry.online);
        assert_eq!(entry.status, status);
        assert!(cache.any_stream_enabled());
    }

    #[test]
    fn projection_only_marks_enabled_zones_playing() {
        let cache = off_cache(2);
        cache.apply(2, StatusUpdate::stream(true), CommandSource::App, |_| {});

        let changed = cache.project_playback(PlaybackMode::Mic);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].0, 2);
        assert!(changed[0].1.is_playing);
        assert_eq!(changed[0].1.playback_mode, PlaybackMode::Mic);
        assert!(!cache.get(1).unwrap().status.is_playing);
    }
}
