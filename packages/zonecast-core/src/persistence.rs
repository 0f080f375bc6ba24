//! Zone record and telemetry persistence.
//!
//! The engines write through the [`ZoneStore`] trait. Two implementations are
//! provided: [`JsonFileZoneStore`] for deployments and [`MemoryZoneStore`] for
//! tests and diskless runs.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{PlaybackMode, ZoneId, ZoneStatus};

const ZONES_FILE: &str = "zones.json";
const ZONES_TEMP_FILE: &str = "zones.json.tmp";
const TELEMETRY_FILE: &str = "telemetry.jsonl";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store task failed: {0}")]
    Task(String),
}

/// Persisted status fields of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredStatus {
    pub stream_enabled: bool,
    pub is_playing: bool,
    pub volume: u8,
    #[serde(default)]
    pub playback_mode: PlaybackMode,
}

impl From<ZoneStatus> for StoredStatus {
    fn from(s: ZoneStatus) -> Self {
        Self {
            stream_enabled: s.stream_enabled,
            is_playing: s.is_playing,
            volume: s.volume,
            playback_mode: s.playback_mode,
        }
    }
}

impl From<StoredStatus> for ZoneStatus {
    fn from(s: StoredStatus) -> Self {
        Self {
            stream_enabled: s.stream_enabled,
            is_playing: s.is_playing,
            volume: s.volume,
            playback_mode: s.playback_mode,
        }
    }
}

/// Persisted zone record: `{no, status:{...}, lastSeen}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub no: ZoneId,
    pub status: StoredStatus,
    /// Unix milliseconds.
    #[serde(rename = "lastSeen")]
    pub last_seen: u64,
}

impl ZoneRecord {
    pub fn new(no: ZoneId, status: ZoneStatus, last_seen: u64) -> Self {
        Self {
            no,
            status: status.into(),
            last_seen,
        }
    }
}

/// One buffered telemetry message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRow {
    pub zone: ZoneId,
    pub payload: serde_json::Value,
    /// Unix milliseconds.
    pub received_at: u64,
}

#[async_trait]
pub trait ZoneStore: Send + Sync {
    /// Upserts the given records in one write.
    async fn save_zones(&self, records: &[ZoneRecord]) -> Result<(), StoreError>;

    /// Loads every persisted record.
    async fn load_zones(&self) -> Result<Vec<ZoneRecord>, StoreError>;

    /// Appends telemetry rows.
    async fn append_telemetry(&self, rows: &[TelemetryRow]) -> Result<(), StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON File Store
// ─────────────────────────────────────────────────────────────────────────────

/// File-backed store under a data directory.
///
/// Zone records live in `zones.json`, rewritten atomically (temp file +
/// rename) on every save. Telemetry is appended to `telemetry.jsonl`.
#[derive(Clone)]
pub struct JsonFileZoneStore {
    inner: Arc<JsonFileInner>,
}

struct JsonFileInner {
    dir: PathBuf,
    /// Serializes all file operations.
    lock: Mutex<()>,
}

impl JsonFileZoneStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(JsonFileInner {
                dir: dir.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&JsonFileInner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let _guard = inner.lock.lock();
            f(&inner)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

impl JsonFileInner {
    fn read_zones(&self) -> Result<BTreeMap<ZoneId, ZoneRecord>, StoreError> {
        let path = self.dir.join(ZONES_FILE);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let records: Vec<ZoneRecord> = serde_json::from_str(&contents)?;
        Ok(records.into_iter().map(|r| (r.no, r)).collect())
    }

    fn write_zones(&self, records: &BTreeMap<ZoneId, ZoneRecord>) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(ZONES_FILE);
        let temp_path = self.dir.join(ZONES_TEMP_FILE);
        let list: Vec<&ZoneRecord> = records.values().collect();
        let contents = serde_json::to_string_pretty(&list)?;

        std::fs::write(&temp_path, contents)?;
        std::fs::rename(&temp_path, &path)?;
        Ok(())
    }
}

#[async_trait]
impl ZoneStore for JsonFileZoneStore {
    async fn save_zones(&self, records: &[ZoneRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let records = records.to_vec();
        self.blocking(move |inner| {
            let mut existing = inner.read_zones()?;
            for record in records {
                existing.insert(record.no, record);
            }
            inner.write_zones(&existing)
        })
        .await
    }

    async fn load_zones(&self) -> Result<Vec<ZoneRecord>, StoreError> {
        self.blocking(|inner| Ok(inner.read_zones()?.into_values().collect()))
            .await
    }

    async fn append_telemetry(&self, rows: &[TelemetryRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut buf, row)?;
            buf.push(b'\n');
        }
        self.blocking(move |inner| {
            std::fs::create_dir_all(&inner.dir)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(inner.dir.join(TELEMETRY_FILE))?;
            file.write_all(&buf)?;
            Ok(())
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-Memory Store
// ─────────────────────────────────────────────────────────────────────────────

/// Store that keeps everything in memory.
#[derive(Default)]
pub struct MemoryZoneStore {
    zones: Mutex<BTreeMap<ZoneId, ZoneRecord>>,
    telemetry: Mutex<Vec<TelemetryRow>>,
    save_batches: Mutex<Vec<Vec<ZoneId>>>,
}

impl MemoryZoneStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, zone: ZoneId) -> Option<ZoneRecord> {
        self.zones.lock().get(&zone).copied()
    }

    /// Zone numbers written by each `save_zones` call, in call order.
    pub fn save_batches(&self) -> Vec<Vec<ZoneId>> {
        self.save_batches.lock().clone()
    }

    pub fn telemetry(&self) -> Vec<TelemetryRow> {
        self.telemetry.lock().clone()
    }
}

#[async_trait]
impl ZoneStore for MemoryZoneStore {
    async fn save_zones(&self, records: &[ZoneRecord]) -> Result<(), StoreError> {
        let mut zones = self.zones.lock();
        for record in records {
            zones.insert(record.no, *record);
        }
        self.save_batches
            .lock()
            .push(records.iter().map(|r| r.no).collect());
        Ok(())
    }

    async fn load_zones(&self) -> Result<Vec<ZoneRecord>, StoreError> {
        Ok(self.zones.lock().values().copied().collect())
    }

    async fn append_telemetry(&self, rows: &[TelemetryRow]) -> Result<(), StoreError> {
        self.telemetry.lock().extend_from_slice(rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(no: ZoneId, on: bool) -> ZoneRecord {
        ZoneRecord::new(
            no,
            ZoneStatus {
                stream_enabled: on,
                volume: 5,
                ..Default::default()
            },
            1_000,
        )
    }

    #[test]
    fn record_uses_wire_field_names() {
        let json = serde_json::to_value(record(3, true)).unwrap();
        assert_eq!(json["no"], 3);
        assert_eq!(json["lastSeen"], 1_000);
        assert_eq!(json["status"]["stream_enabled"], true);
        assert_eq!(json["status"]["playback_mode"], "none");
    }

    #[tokio::test]
    async fn json_store_upserts_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileZoneStore::new(dir.path());

        store.save_zones(&[record(1, false), record(2, false)]).await.unwrap();
        store.save_zones(&[record(2, true)]).await.unwrap();

        let loaded = store.load_zones().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(!loaded[0].status.stream_enabled);
        assert!(loaded[1].status.stream_enabled);
        assert!(!dir.path().join(ZONES_TEMP_FILE).exists());
    }

    #[tokio::test]
    async fn json_store_loads_empty_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileZoneStore::new(dir.path().join("nested"));
        assert!(store.load_zones().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn json_store_appends_telemetry_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileZoneStore::new(dir.path());
        let row = TelemetryRow {
            zone: 1,
            payload: serde_json::json!({"rssi": -61}),
            received_at: 7,
        };
        store.append_telemetry(&[row.clone()]).await.unwrap();
        store.append_telemetry(&[row]).await.unwrap();

        let text = std::fs::read_to_string(dir.path().join(TELEMETRY_FILE)).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("\"receivedAt\":7"));
    }

    #[tokio::test]
    async fn memory_store_tracks_batches() {
        let store = MemoryZoneStore::new();
        store.save_zones(&[record(1, true), record(4, true)]).await.unwrap();
        assert_eq!(store.save_batches(), vec![vec![1, 4]]);
        assert!(store.get(4).unwrap().status.stream_enabled);
    }
}
