//! Broker topic router and typed payloads.
//!
//! Inbound broker traffic is classified by topic pattern and its payload is
//! parsed into tagged variants here, at the protocol boundary. Anything that
//! fails to parse is rejected with a [`TopicError`] and never reaches the cache.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol_constants::{BULK_SCAN_TOPIC, ZONE_TOPIC_PREFIX};
use crate::types::{clamp_volume, CommandSource, ZoneId};
use crate::zones::codec::parse_bulk_vector;

#[derive(Debug, Error)]
pub enum TopicError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("invalid zone in topic or payload: {0}")]
    InvalidZone(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Which zones a command or status addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneTarget {
    Zone(ZoneId),
    All,
    Selected(Vec<ZoneId>),
}

/// Topic shape, before the payload is looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    ZoneCommand(ZoneId),
    AllCommand,
    SelectCommand,
    ZoneStatus(ZoneId),
    AllStatus,
    Telemetry(ZoneId),
    Presence(ZoneId),
    BulkScan,
}

/// Classifies a topic string by pattern.
pub fn classify(topic: &str) -> Result<TopicKind, TopicError> {
    if topic == BULK_SCAN_TOPIC {
        return Ok(TopicKind::BulkScan);
    }

    let (scope, leaf) = topic
        .split_once('/')
        .ok_or_else(|| TopicError::UnknownTopic(topic.to_string()))?;

    match (scope, leaf) {
        ("all", "command") => return Ok(TopicKind::AllCommand),
        ("all", "status") => return Ok(TopicKind::AllStatus),
        ("select", "command") => return Ok(TopicKind::SelectCommand),
        _ => {}
    }

    let digits = scope
        .strip_prefix(ZONE_TOPIC_PREFIX)
        .ok_or_else(|| TopicError::UnknownTopic(topic.to_string()))?;
    let zone = parse_zone_number(digits).ok_or_else(|| TopicError::InvalidZone(topic.to_string()))?;

    match leaf {
        "command" => Ok(TopicKind::ZoneCommand(zone)),
        "status" => Ok(TopicKind::ZoneStatus(zone)),
        "monitoring" => Ok(TopicKind::Telemetry(zone)),
        "lwt" => Ok(TopicKind::Presence(zone)),
        _ => Err(TopicError::UnknownTopic(topic.to_string())),
    }
}

fn parse_zone_number(digits: &str) -> Option<ZoneId> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<ZoneId>().ok().filter(|z| *z > 0)
}

/// Topic for commands addressed to one zone device.
#[must_use]
pub fn command_topic(zone: ZoneId) -> String {
    format!("{}{}/command", ZONE_TOPIC_PREFIX, zone)
}

/// Topic for statuses published about one zone.
#[must_use]
pub fn status_topic(zone: ZoneId) -> String {
    format!("{}{}/status", ZONE_TOPIC_PREFIX, zone)
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// An action requested of one or more zones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneCommand {
    SetStream(bool),
    SetVolume(u8),
    GetStatus,
}

/// Wire shape shared by every `*/command` topic.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CommandPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    set_stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    set_volume: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    zone: Option<Vec<ZoneId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    get_status: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<CommandSource>,
}

/// Renders an outbound command payload for `zone{N}/command`.
#[must_use]
pub fn encode_command(command: &ZoneCommand, source: CommandSource) -> String {
    let payload = match command {
        ZoneCommand::SetStream(on) => CommandPayload {
            set_stream: Some(*on),
            source: Some(source),
            ..Default::default()
        },
        ZoneCommand::SetVolume(level) => CommandPayload {
            set_volume: Some(i64::from(*level)),
            source: Some(source),
            ..Default::default()
        },
        ZoneCommand::GetStatus => CommandPayload {
            get_status: Some(true),
            ..Default::default()
        },
    };
    serde_json::to_string(&payload).unwrap_or_default()
}

/// Status of one zone, as carried on `zone{N}/status` and `all/status`.
///
/// `volume` and `is_playing` are optional so a partial status never resets
/// fields the producer did not report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<ZoneId>,
    pub stream_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_playing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(default)]
    pub source: CommandSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

#[derive(Deserialize)]
struct RawStatusFrame {
    #[serde(default)]
    zone: Option<ZoneId>,
    stream_enabled: bool,
    #[serde(default)]
    is_playing: Option<bool>,
    #[serde(default)]
    volume: Option<i64>,
    #[serde(default)]
    source: CommandSource,
    #[serde(default)]
    raw: Option<String>,
}

/// A fully classified and parsed inbound broker message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Command {
        target: ZoneTarget,
        command: ZoneCommand,
        source: CommandSource,
    },
    Status {
        target: ZoneTarget,
        frame: StatusFrame,
    },
    Telemetry {
        zone: ZoneId,
        payload: serde_json::Value,
    },
    Presence {
        zone: ZoneId,
        online: bool,
    },
    BulkScan(Vec<bool>),
}

/// Classifies `topic` and parses `payload` into an [`InboundMessage`].
pub fn route(topic: &str, payload: &str) -> Result<InboundMessage, TopicError> {
    match classify(topic)? {
        TopicKind::ZoneCommand(zone) => parse_command(ZoneTarget::Zone(zone), payload),
        TopicKind::AllCommand => parse_command(ZoneTarget::All, payload),
        TopicKind::SelectCommand => parse_command(ZoneTarget::Selected(Vec::new()), payload),
        TopicKind::ZoneStatus(zone) => {
            let mut frame = parse_status(payload)?;
            if let Some(claimed) = frame.zone {
                if claimed != zone {
                    return Err(TopicError::InvalidZone(format!(
                        "payload zone {} on {}",
                        claimed, topic
                    )));
                }
            }
            frame.zone = Some(zone);
            Ok(InboundMessage::Status {
                target: ZoneTarget::Zone(zone),
                frame,
            })
        }
        TopicKind::AllStatus => Ok(InboundMessage::Status {
            target: ZoneTarget::All,
            frame: parse_status(payload)?,
        }),
        TopicKind::Telemetry(zone) => {
            let payload = serde_json::from_str(payload)
                .map_err(|e| TopicError::InvalidPayload(format!("telemetry: {}", e)))?;
            Ok(InboundMessage::Telemetry { zone, payload })
        }
        TopicKind::Presence(zone) => {
            let online = match payload.trim().trim_matches('"') {
                "online" => true,
                "offline" => false,
                other => {
                    return Err(TopicError::InvalidPayload(format!(
                        "presence must be online/offline, got {:?}",
                        other
                    )))
                }
            };
            Ok(InboundMessage::Presence { zone, online })
        }
        TopicKind::BulkScan => parse_bulk_vector(payload.trim().trim_matches('"'))
            .map(InboundMessage::BulkScan)
            .map_err(|e| TopicError::InvalidPayload(e.to_string())),
    }
}

fn parse_command(target: ZoneTarget, payload: &str) -> Result<InboundMessage, TopicError> {
    let raw: CommandPayload =
        serde_json::from_str(payload).map_err(|e| TopicError::InvalidPayload(e.to_string()))?;
    let source = raw.source.unwrap_or_default();

    let target = match target {
        ZoneTarget::Selected(_) => {
            let zones = raw
                .zone
                .ok_or_else(|| TopicError::InvalidPayload("select requires a zone list".into()))?;
            if zones.is_empty() || zones.contains(&0) {
                return Err(TopicError::InvalidZone(format!("{:?}", zones)));
            }
            ZoneTarget::Selected(zones)
        }
        other => other,
    };

    let command = match (raw.set_stream, raw.set_volume, raw.get_status) {
        (Some(on), None, _) => ZoneCommand::SetStream(on),
        (None, Some(level), _) => ZoneCommand::SetVolume(clamp_volume(level)),
        (None, None, Some(true)) if matches!(target, ZoneTarget::Zone(_)) => ZoneCommand::GetStatus,
        (Some(_), Some(_), _) => {
            return Err(TopicError::InvalidPayload(
                "set_stream and set_volume are mutually exclusive".into(),
            ))
        }
        _ => return Err(TopicError::InvalidPayload("no recognised command".into())),
    };

    Ok(InboundMessage::Command {
        target,
        command,
        source,
    })
}

fn parse_status(payload: &str) -> Result<StatusFrame, TopicError> {
    let raw: RawStatusFrame =
        serde_json::from_str(payload).map_err(|e| TopicError::InvalidPayload(e.to_string()))?;
    if raw.zone == Some(0) {
        return Err(TopicError::InvalidZone("0".into()));
    }
    Ok(StatusFrame {
        zone: raw.zone,
        stream_enabled: raw.stream_enabled,
        is_playing: raw.is_playing,
        volume: raw.volume.map(clamp_volume),
        source: raw.source,
        raw: raw.raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_every_topic_shape() {
        assert_eq!(classify("zone3/command").unwrap(), TopicKind::ZoneCommand(3));
        assert_eq!(classify("all/command").unwrap(), TopicKind::AllCommand);
        assert_eq!(classify("select/command").unwrap(), TopicKind::SelectCommand);
        assert_eq!(classify("zone12/status").unwrap(), TopicKind::ZoneStatus(12));
        assert_eq!(classify("all/status").unwrap(), TopicKind::AllStatus);
        assert_eq!(classify("zone2/monitoring").unwrap(), TopicKind::Telemetry(2));
        assert_eq!(classify("zone2/lwt").unwrap(), TopicKind::Presence(2));
        assert_eq!(classify("bulk/test").unwrap(), TopicKind::BulkScan);
    }

    #[test]
    fn rejects_unknown_topics_and_bad_zones() {
        assert!(matches!(classify("zone3/reboot"), Err(TopicError::UnknownTopic(_))));
        assert!(matches!(classify("garbage"), Err(TopicError::UnknownTopic(_))));
        assert!(matches!(classify("zonex/status"), Err(TopicError::InvalidZone(_))));
        assert!(matches!(classify("zone0/status"), Err(TopicError::InvalidZone(_))));
    }

    #[test]
    fn parses_zone_commands_with_source() {
        let msg = route("zone4/command", r#"{"set_stream":true,"source":"manual"}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Command {
                target: ZoneTarget::Zone(4),
                command: ZoneCommand::SetStream(true),
                source: CommandSource::ManualPanel,
            }
        );

        let msg = route("all/command", r#"{"set_volume":35}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Command {
                target: ZoneTarget::All,
                command: ZoneCommand::SetVolume(21),
                source: CommandSource::App,
            }
        );
    }

    #[test]
    fn select_requires_zone_list() {
        let msg = route("select/command", r#"{"zone":[1,3],"set_stream":false}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Command {
                target: ZoneTarget::Selected(vec![1, 3]),
                command: ZoneCommand::SetStream(false),
                source: CommandSource::App,
            }
        );
        assert!(route("select/command", r#"{"set_stream":false}"#).is_err());
        assert!(route("select/command", r#"{"zone":[],"set_stream":false}"#).is_err());
    }

    #[test]
    fn ambiguous_or_empty_commands_are_rejected() {
        assert!(route("zone1/command", r#"{"set_stream":true,"set_volume":3}"#).is_err());
        assert!(route("zone1/command", r#"{}"#).is_err());
        assert!(route("zone1/command", "not json").is_err());
        assert!(route("all/command", r#"{"get_status":true}"#).is_err());
    }

    #[test]
    fn status_takes_zone_from_topic() {
        let msg = route(
            "zone5/status",
            r#"{"stream_enabled":true,"is_playing":false,"volume":7,"source":"app","raw":"S5Y"}"#,
        )
        .unwrap();
        let InboundMessage::Status { target, frame } = msg else {
            panic!("expected status");
        };
        assert_eq!(target, ZoneTarget::Zone(5));
        assert_eq!(frame.zone, Some(5));
        assert_eq!(frame.volume, Some(7));
        assert_eq!(frame.raw.as_deref(), Some("S5Y"));

        assert!(route("zone5/status", r#"{"zone":6,"stream_enabled":true}"#).is_err());
    }

    #[test]
    fn presence_and_bulk_payloads() {
        assert_eq!(
            route("zone2/lwt", "offline").unwrap(),
            InboundMessage::Presence { zone: 2, online: false }
        );
        assert_eq!(
            route("zone2/lwt", "\"online\"").unwrap(),
            InboundMessage::Presence { zone: 2, online: true }
        );
        assert!(route("zone2/lwt", "maybe").is_err());
        assert_eq!(
            route("bulk/test", "YNNY").unwrap(),
            InboundMessage::BulkScan(vec![true, false, false, true])
        );
        assert!(route("bulk/test", "YNQY").is_err());
    }

    #[test]
    fn outbound_commands_carry_source() {
        let text = encode_command(&ZoneCommand::SetStream(true), CommandSource::ManualPanel);
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["set_stream"], true);
        assert_eq!(value["source"], "manual-panel");

        let text = encode_command(&ZoneCommand::GetStatus, CommandSource::App);
        assert_eq!(text, r#"{"get_status":true}"#);
        assert_eq!(command_topic(7), "zone7/command");
        assert_eq!(status_topic(7), "zone7/status");
    }
}
