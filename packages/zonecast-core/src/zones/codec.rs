//! Serial frame codec for the legacy amplifier controller.
//!
//! Grammar (ASCII):
//!
//! ```text
//! zone toggle   $S{zone:4 digits}{Y|N}$      $S0003Y$
//! volume set    $V{zone:4 digits}{0..21}$    $V000312$
//! bulk vector   {Y|N}*  (line terminated)    YNNY
//! ```
//!
//! Index 0 of a bulk vector is zone 1. The same grammar is used in both
//! directions; a panel toggle on the hardware arrives shaped exactly like the
//! echo of a command we sent.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol_constants::{FRAME_DELIMITER, MAX_SERIAL_FRAME_LEN, MAX_VOLUME, ZONE_DIGITS};
use crate::types::{clamp_volume, ZoneId};

/// Errors produced while encoding or decoding serial frames.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed serial frame: {0:?}")]
    Malformed(String),

    #[error("zone {0} is outside the addressable range")]
    ZoneOutOfRange(u32),

    #[error("invalid bulk vector: {0:?}")]
    InvalidVector(String),

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A command or status frame on the serial link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialCommand {
    /// Switch one zone's amplifier channel on or off.
    ZoneToggle { zone: ZoneId, on: bool },
    /// Set one zone's volume (clamped to `0..=21`).
    VolumeSet { zone: ZoneId, level: u8 },
    /// Every zone's on/off state; `states[0]` is zone 1.
    BulkZoneVector(Vec<bool>),
}

impl SerialCommand {
    /// Renders the command as the exact ASCII text written to the wire.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::ZoneToggle { zone, on } => {
                format!("$S{:04}{}$", zone, if *on { 'Y' } else { 'N' })
            }
            Self::VolumeSet { zone, level } => {
                format!("$V{:04}{}$", zone, (*level).min(MAX_VOLUME))
            }
            Self::BulkZoneVector(states) => encode_bulk_vector(states),
        }
    }

    /// Parses one complete frame (delimiters included for addressed frames).
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CodecError::Malformed(String::new()));
        }
        if text.as_bytes()[0] != FRAME_DELIMITER {
            return parse_bulk_vector(text).map(Self::BulkZoneVector);
        }

        let body = text
            .strip_prefix('$')
            .and_then(|t| t.strip_suffix('$'))
            .ok_or_else(|| CodecError::Malformed(text.to_string()))?;
        if !body.is_ascii() || body.len() < 1 + ZONE_DIGITS + 1 {
            return Err(CodecError::Malformed(text.to_string()));
        }

        let (kind, rest) = body.split_at(1);
        let (zone_digits, arg) = rest.split_at(ZONE_DIGITS);
        let zone = parse_zone(zone_digits).ok_or_else(|| CodecError::Malformed(text.to_string()))?;
        if zone == 0 {
            return Err(CodecError::ZoneOutOfRange(zone));
        }
        let zone = zone as ZoneId;

        match kind {
            "S" => match arg {
                "Y" => Ok(Self::ZoneToggle { zone, on: true }),
                "N" => Ok(Self::ZoneToggle { zone, on: false }),
                _ => Err(CodecError::Malformed(text.to_string())),
            },
            "V" => {
                if arg.is_empty() || arg.len() > 2 || !arg.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(CodecError::Malformed(text.to_string()));
                }
                let level: i64 = arg
                    .parse()
                    .map_err(|_| CodecError::Malformed(text.to_string()))?;
                Ok(Self::VolumeSet {
                    zone,
                    level: clamp_volume(level),
                })
            }
            _ => Err(CodecError::Malformed(text.to_string())),
        }
    }
}

fn parse_zone(digits: &str) -> Option<u32> {
    if digits.len() != ZONE_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Encodes per-zone on/off states as a bulk vector (`true` -> `Y`).
#[must_use]
pub fn encode_bulk_vector(states: &[bool]) -> String {
    states.iter().map(|on| if *on { 'Y' } else { 'N' }).collect()
}

/// Parses a bulk vector. Whitespace around it is ignored; anything other than
/// `Y`/`N` inside it is rejected.
pub fn parse_bulk_vector(text: &str) -> Result<Vec<bool>, CodecError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(CodecError::InvalidVector(String::new()));
    }
    text.chars()
        .map(|c| match c {
            'Y' => Ok(true),
            'N' => Ok(false),
            _ => Err(CodecError::InvalidVector(text.to_string())),
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream Codec
// ─────────────────────────────────────────────────────────────────────────────

/// One item decoded from the serial byte stream.
///
/// Malformed frames are yielded rather than returned as errors so a single bad
/// frame never terminates the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    Command(SerialCommand),
    Malformed(String),
}

/// `tokio_util` codec splitting the serial byte stream into frames.
#[derive(Debug, Default)]
pub struct SerialFrameCodec;

impl Decoder for SerialFrameCodec {
    type Item = DecodedFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Skip line noise between frames.
        let skip = src
            .iter()
            .take_while(|b| b.is_ascii_whitespace() || **b == 0)
            .count();
        src.advance(skip);

        let Some(&first) = src.first() else {
            return Ok(None);
        };

        if first == FRAME_DELIMITER {
            let Some(end) = src[1..]
                .iter()
                .position(|b| *b == FRAME_DELIMITER || *b == b'\n' || *b == b'\r')
            else {
                if src.len() > MAX_SERIAL_FRAME_LEN {
                    log::warn!("[Serial] Discarding {} bytes of unterminated frame", src.len());
                    src.clear();
                }
                return Ok(None);
            };
            // Frames never span lines; a stray opener ends at the newline.
            if src[end + 1] != FRAME_DELIMITER {
                let stray = src.split_to(end + 1);
                return Ok(Some(DecodedFrame::Malformed(
                    String::from_utf8_lossy(&stray).into_owned(),
                )));
            }
            let frame = src.split_to(end + 2);
            let text = String::from_utf8_lossy(&frame).into_owned();
            return Ok(Some(match SerialCommand::parse(&text) {
                Ok(cmd) => DecodedFrame::Command(cmd),
                Err(_) => DecodedFrame::Malformed(text),
            }));
        }

        if first == b'Y' || first == b'N' {
            let Some(end) = src.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                if src.len() > MAX_SERIAL_FRAME_LEN {
                    log::warn!("[Serial] Discarding {} bytes of unterminated vector", src.len());
                    src.clear();
                }
                return Ok(None);
            };
            let line = src.split_to(end);
            let text = String::from_utf8_lossy(&line).into_owned();
            return Ok(Some(match parse_bulk_vector(&text) {
                Ok(states) => DecodedFrame::Command(SerialCommand::BulkZoneVector(states)),
                Err(_) => DecodedFrame::Malformed(text),
            }));
        }

        // Garbage: drop everything up to the next plausible frame start.
        let garbage = src
            .iter()
            .position(|b| *b == FRAME_DELIMITER || *b == b'\n' || *b == b'\r')
            .unwrap_or(src.len());
        let dropped = src.split_to(garbage);
        Ok(Some(DecodedFrame::Malformed(
            String::from_utf8_lossy(&dropped).into_owned(),
        )))
    }
}

impl Encoder<SerialCommand> for SerialFrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: SerialCommand, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let text = item.encode();
        dst.reserve(text.len() + 1);
        dst.put_slice(text.as_bytes());
        if matches!(item, SerialCommand::BulkZoneVector(_)) {
            dst.put_u8(b'\n');
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_frames_use_four_digit_zone() {
        let cmd = SerialCommand::ZoneToggle { zone: 3, on: true };
        assert_eq!(cmd.encode(), "$S0003Y$");
        assert_eq!(SerialCommand::parse("$S0003Y$").unwrap(), cmd);
        assert_eq!(
            SerialCommand::parse("$S0120N$").unwrap(),
            SerialCommand::ZoneToggle { zone: 120, on: false }
        );
    }

    #[test]
    fn volume_frames_are_clamped() {
        assert_eq!(SerialCommand::VolumeSet { zone: 7, level: 9 }.encode(), "$V00079$");
        assert_eq!(SerialCommand::VolumeSet { zone: 7, level: 40 }.encode(), "$V000721$");
        assert_eq!(
            SerialCommand::parse("$V000799$").unwrap(),
            SerialCommand::VolumeSet { zone: 7, level: 21 }
        );
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(SerialCommand::parse("$S03Y$"), Err(CodecError::Malformed(_))));
        assert!(matches!(SerialCommand::parse("$S0003X$"), Err(CodecError::Malformed(_))));
        assert!(matches!(SerialCommand::parse("$V0003$"), Err(CodecError::Malformed(_))));
        assert!(matches!(SerialCommand::parse("$V0003123$"), Err(CodecError::Malformed(_))));
        assert!(matches!(SerialCommand::parse("$Q0003Y$"), Err(CodecError::Malformed(_))));
        assert!(matches!(SerialCommand::parse("$S0000Y$"), Err(CodecError::ZoneOutOfRange(0))));
    }

    #[test]
    fn bulk_vector_index_zero_is_zone_one() {
        let states = parse_bulk_vector("YNNY").unwrap();
        assert_eq!(states, vec![true, false, false, true]);
        assert_eq!(encode_bulk_vector(&states), "YNNY");
        assert!(matches!(parse_bulk_vector("YNXY"), Err(CodecError::InvalidVector(_))));
    }

    #[test]
    fn decoder_splits_frames_and_vectors() {
        let mut codec = SerialFrameCodec;
        let mut buf = BytesMut::from(&b"\r\n$S0001Y$$V000210$YNY\n"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(DecodedFrame::Command(SerialCommand::ZoneToggle { zone: 1, on: true }))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(DecodedFrame::Command(SerialCommand::VolumeSet { zone: 2, level: 10 }))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(DecodedFrame::Command(SerialCommand::BulkZoneVector(vec![
                true, false, true
            ])))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decoder_waits_for_partial_frames() {
        let mut codec = SerialFrameCodec;
        let mut buf = BytesMut::from(&b"$S00"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"04N$");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(DecodedFrame::Command(SerialCommand::ZoneToggle { zone: 4, on: false }))
        );
    }

    #[test]
    fn decoder_yields_garbage_as_malformed() {
        let mut codec = SerialFrameCodec;
        let mut buf = BytesMut::from(&b"OK\r\n$S0001Y$"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(DecodedFrame::Malformed("OK".into()))
        );
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(DecodedFrame::Command(_))
        ));
    }

    #[test]
    fn stray_opener_resyncs_at_line_end() {
        let mut codec = SerialFrameCodec;
        let mut buf = BytesMut::from(&b"$S00\n$S0001Y$"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(DecodedFrame::Malformed("$S00".into()))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(DecodedFrame::Command(SerialCommand::ZoneToggle { zone: 1, on: true }))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn encoder_terminates_bulk_vectors_with_newline() {
        let mut codec = SerialFrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(SerialCommand::BulkZoneVector(vec![true, false]), &mut buf)
            .unwrap();
        codec
            .encode(SerialCommand::ZoneToggle { zone: 2, on: true }, &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"YN\n$S0002Y$");
    }
}
