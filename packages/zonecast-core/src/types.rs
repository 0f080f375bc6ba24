//! Shared domain types used by both engines.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::protocol_constants::MAX_VOLUME;

/// Zone number, `1..=zone_count`.
pub type ZoneId = u16;

/// Clamps a requested volume into the amplifier's `0..=21` range.
#[must_use]
pub fn clamp_volume(level: i64) -> u8 {
    level.clamp(0, MAX_VOLUME as i64) as u8
}

/// Which source currently owns (or last owned) the encoder.
///
/// `All` is only ever a zone-level display value; the arbiter never runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    #[default]
    None,
    Mic,
    Schedule,
    Playlist,
    File,
    Remote,
    All,
}

impl PlaybackMode {
    /// Whether sessions of this mode may be paused and resumed by seek.
    #[must_use]
    pub fn is_pausable(self) -> bool {
        matches!(self, Self::Schedule | Self::File | Self::Playlist)
    }

    /// Wire name, as used in events and persisted records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Mic => "mic",
            Self::Schedule => "schedule",
            Self::Playlist => "playlist",
            Self::File => "file",
            Self::Remote => "remote",
            Self::All => "all",
        }
    }
}

impl fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Producer that last changed a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CommandSource {
    #[default]
    #[serde(rename = "app")]
    App,
    #[serde(rename = "manual-panel", alias = "manual", alias = "manual_panel")]
    ManualPanel,
    #[serde(rename = "bulk-scan")]
    BulkScan,
    #[serde(rename = "watchdog")]
    Watchdog,
}

impl CommandSource {
    /// Wire name of the source tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::ManualPanel => "manual-panel",
            Self::BulkScan => "bulk-scan",
            Self::Watchdog => "watchdog",
        }
    }

    /// Whether updates from this source may be mirrored to the serial link.
    ///
    /// Manual panel actions already came from the hardware, and bulk scans and
    /// watchdog sweeps describe hardware truth, so only app traffic is mirrored.
    #[must_use]
    pub fn mirrors_to_serial(self) -> bool {
        matches!(self, Self::App)
    }
}

impl FromStr for CommandSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app" | "web" => Ok(Self::App),
            "manual" | "manual-panel" | "manual_panel" => Ok(Self::ManualPanel),
            "bulk-scan" | "bulk" => Ok(Self::BulkScan),
            "watchdog" => Ok(Self::Watchdog),
            other => Err(format!("unknown command source: {}", other)),
        }
    }
}

/// The on/off/volume state of one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ZoneStatus {
    pub stream_enabled: bool,
    pub is_playing: bool,
    pub volume: u8,
    pub playback_mode: PlaybackMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_is_clamped_to_amplifier_range() {
        assert_eq!(clamp_volume(-4), 0);
        assert_eq!(clamp_volume(12), 12);
        assert_eq!(clamp_volume(40), 21);
    }

    #[test]
    fn only_file_like_modes_are_pausable() {
        assert!(PlaybackMode::File.is_pausable());
        assert!(PlaybackMode::Schedule.is_pausable());
        assert!(PlaybackMode::Playlist.is_pausable());
        assert!(!PlaybackMode::Mic.is_pausable());
        assert!(!PlaybackMode::Remote.is_pausable());
    }

    #[test]
    fn command_source_accepts_manual_alias() {
        let source: CommandSource = serde_json::from_str("\"manual\"").unwrap();
        assert_eq!(source, CommandSource::ManualPanel);
        assert_eq!(
            serde_json::to_string(&CommandSource::ManualPanel).unwrap(),
            "\"manual-panel\""
        );
        assert_eq!("bulk".parse::<CommandSource>(), Ok(CommandSource::BulkScan));
    }

    #[test]
    fn only_app_traffic_reaches_the_serial_link() {
        assert!(CommandSource::App.mirrors_to_serial());
        assert!(!CommandSource::ManualPanel.mirrors_to_serial());
        assert!(!CommandSource::BulkScan.mirrors_to_serial());
        assert!(!CommandSource::Watchdog.mirrors_to_serial());
    }
}
