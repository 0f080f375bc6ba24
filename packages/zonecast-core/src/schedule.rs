//! Schedule trigger.
//!
//! Wakes `lookahead` before every minute boundary (site-local time), asks the
//! [`ScheduleSource`] which entries are due at that minute, then sleeps to the
//! boundary and hands the first due entry to the arbiter. Rejections (mic
//! live, streaming disabled) are logged and dropped; nothing is queued.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, TimeZone, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ZonecastError, ZonecastResult};
use crate::playback::PlaybackArbiter;
use crate::state::ScheduleConfig;

fn every_day() -> Vec<u8> {
    (0..7).collect()
}

fn enabled_default() -> bool {
    true
}

/// One configured schedule slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    /// Local wall-clock time, `HH:MM`.
    pub time: String,
    /// Weekdays the entry fires on, `0` = Sunday.
    #[serde(default = "every_day")]
    pub days: Vec<u8>,
    /// Track handed to the encoder.
    pub track: PathBuf,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

impl ScheduleEntry {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("schedule entry id must not be empty".to_string());
        }
        if self.parsed_time().is_none() {
            return Err(format!("schedule entry {}: time {:?} is not HH:MM", self.id, self.time));
        }
        if let Some(day) = self.days.iter().find(|d| **d > 6) {
            return Err(format!("schedule entry {}: day {} is not 0..=6", self.id, day));
        }
        if self.track.as_os_str().is_empty() {
            return Err(format!("schedule entry {}: track must not be empty", self.id));
        }
        Ok(())
    }

    fn parsed_time(&self) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(self.time.trim(), "%H:%M").ok()
    }

    /// Whether the entry fires in the minute starting at `local`.
    pub fn is_due<Tz: TimeZone>(&self, local: &DateTime<Tz>) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(time) = self.parsed_time() else {
            return false;
        };
        let weekday = local.weekday().num_days_from_sunday() as u8;
        self.days.contains(&weekday) && time.hour() == local.hour() && time.minute() == local.minute()
    }
}

/// Where schedule entries come from.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    /// Entries due in the minute starting at `minute` (site-local time).
    async fn due_entries(&self, minute: DateTime<FixedOffset>) -> ZonecastResult<Vec<ScheduleEntry>>;
}

/// Entries fixed at startup (from configuration).
pub struct StaticScheduleSource {
    entries: Vec<ScheduleEntry>,
}

impl StaticScheduleSource {
    pub fn new(mut entries: Vec<ScheduleEntry>) -> Self {
        entries.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));
        Self { entries }
    }
}

#[async_trait]
impl ScheduleSource for StaticScheduleSource {
    async fn due_entries(&self, minute: DateTime<FixedOffset>) -> ZonecastResult<Vec<ScheduleEntry>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.is_due(&minute))
            .cloned()
            .collect())
    }
}

/// First instant strictly after `now` with zero seconds.
pub fn next_minute_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = now.timestamp();
    let next = (secs.div_euclid(60) + 1) * 60;
    Utc.timestamp_opt(next, 0).single().unwrap_or(now)
}

struct FiredMinute {
    minute: i64,
    ids: HashSet<String>,
}

/// Polls a [`ScheduleSource`] and starts due entries.
pub struct ScheduleTrigger {
    source: Arc<dyn ScheduleSource>,
    arbiter: Arc<PlaybackArbiter>,
    offset: FixedOffset,
    lookahead: Duration,
    fired: Mutex<FiredMinute>,
}

impl ScheduleTrigger {
    pub fn new(
        config: &ScheduleConfig,
        source: Arc<dyn ScheduleSource>,
        arbiter: Arc<PlaybackArbiter>,
    ) -> ZonecastResult<Self> {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60).ok_or_else(|| {
            ZonecastError::Configuration(format!(
                "invalid schedule UTC offset: {} minutes",
                config.utc_offset_minutes
            ))
        })?;
        Ok(Self {
            source,
            arbiter,
            offset,
            lookahead: Duration::from_millis(config.lookahead_ms),
            fired: Mutex::new(FiredMinute {
                minute: i64::MIN,
                ids: HashSet::new(),
            }),
        })
    }

    /// Runs until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        log::info!(
            "[Schedule] Trigger running (UTC{}, lookahead {:?})",
            self.offset,
            self.lookahead
        );
        loop {
            let now = Utc::now();
            let boundary = next_minute_boundary(now);
            let prefetch_at = boundary - chrono::Duration::milliseconds(self.lookahead.as_millis() as i64);
            let until_prefetch = (prefetch_at - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(until_prefetch) => {}
            }

            let minute = boundary.with_timezone(&self.offset);
            let due = match self.source.due_entries(minute).await {
                Ok(due) => due,
                Err(e) => {
                    log::warn!("[Schedule] Fetching due entries failed: {}", e);
                    Vec::new()
                }
            };

            let until_boundary = (boundary - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(until_boundary) => {}
            }

            self.fire(boundary.timestamp() / 60, due).await;
        }
        log::debug!("[Schedule] Trigger stopped");
    }

    /// Starts the first due entry not yet fired in `minute`. Returns the id of
    /// the entry that was handed to the arbiter.
    pub async fn fire(&self, minute: i64, due: Vec<ScheduleEntry>) -> Option<String> {
        let entry = {
            let mut fired = self.fired.lock();
            if fired.minute != minute {
                fired.minute = minute;
                fired.ids.clear();
            }
            let entry = due.into_iter().find(|e| !fired.ids.contains(&e.id))?;
            fired.ids.insert(entry.id.clone());
            entry
        };

        log::info!("[Schedule] Entry {} due ({}), starting {}", entry.id, entry.time, entry.track.display());
        match self.arbiter.start_schedule(entry.track.clone()).await {
            Ok(started) => log::info!("[Schedule] Entry {} playing as session {}", entry.id, started.session_id),
            Err(e) => log::info!("[Schedule] Entry {} dropped: {}", entry.id, e),
        }
        Some(entry.id)
    }
}
