//! # Scan Event Codec
//!
//! Wire format: UTF-8 `"<area>,<station>"`, split on the first separator,
//! each field trimmed. Decoding is total; every failure is reported as a
//! [`MalformedMessage`] carrying the reason and the lossy payload text.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::constants::FIELD_SEPARATOR;

/// Field of a scan event, used in malformed-message reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Area,
    Station,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Area => write!(f, "area"),
            Field::Station => write!(f, "station"),
        }
    }
}

/// Why a payload could not be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedReason {
    InvalidUtf8,
    MissingDelimiter,
    EmptyField { field: Field },
    DelimiterInField { field: Field },
    LineBreakInField { field: Field },
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::InvalidUtf8 => write!(f, "payload is not valid UTF-8"),
            MalformedReason::MissingDelimiter => {
                write!(f, "missing '{FIELD_SEPARATOR}' separator")
            }
            MalformedReason::EmptyField { field } => write!(f, "{field} is empty"),
            MalformedReason::DelimiterInField { field } => {
                write!(f, "{field} contains the '{FIELD_SEPARATOR}' separator")
            }
            MalformedReason::LineBreakInField { field } => {
                write!(f, "{field} contains a line break")
            }
        }
    }
}

/// Payload that does not describe a scan event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed scan message {payload:?}: {reason}")]
pub struct MalformedMessage {
    /// Lossy UTF-8 rendering of the raw payload
    pub payload: String,
    pub reason: MalformedReason,
}

impl MalformedMessage {
    fn new(payload: impl Into<String>, reason: MalformedReason) -> Self {
        Self {
            payload: payload.into(),
            reason,
        }
    }
}

/// One scan: an operation area and the station that scanned it
///
/// Fields are trimmed, non-empty, and free of the separator and line breaks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ScanEvent {
    area: String,
    station: String,
}

impl ScanEvent {
    /// Build a validated event; fields are trimmed first
    pub fn new(area: impl AsRef<str>, station: impl AsRef<str>) -> Result<Self, MalformedMessage> {
        let area = area.as_ref().trim();
        let station = station.as_ref().trim();
        let payload = format!("{area}{FIELD_SEPARATOR}{station}");

        validate_field(area, Field::Area).map_err(|r| MalformedMessage::new(&payload, r))?;
        validate_field(station, Field::Station).map_err(|r| MalformedMessage::new(&payload, r))?;

        Ok(Self {
            area: area.to_string(),
            station: station.to_string(),
        })
    }

    pub fn area(&self) -> &str {
        &self.area
    }

    pub fn station(&self) -> &str {
        &self.station
    }

    /// Canonical `"<area>,<station>"` string, also the idempotency key
    pub fn canonical(&self) -> String {
        format!("{}{}{}", self.area, FIELD_SEPARATOR, self.station)
    }
}

impl fmt::Display for ScanEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.area, FIELD_SEPARATOR, self.station)
    }
}

impl FromStr for ScanEvent {
    type Err = MalformedMessage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s.as_bytes())
    }
}

fn validate_field(value: &str, field: Field) -> Result<(), MalformedReason> {
    if value.is_empty() {
        return Err(MalformedReason::EmptyField { field });
    }
    if value.contains(FIELD_SEPARATOR) {
        return Err(MalformedReason::DelimiterInField { field });
    }
    if value.contains(['\n', '\r']) {
        return Err(MalformedReason::LineBreakInField { field });
    }
    Ok(())
}

/// Encode an event into its wire representation
pub fn encode(event: &ScanEvent) -> Vec<u8> {
    event.canonical().into_bytes()
}

/// Decode a wire payload into an event
pub fn decode(bytes: &[u8]) -> Result<ScanEvent, MalformedMessage> {
    let text = std::str::from_utf8(bytes).map_err(|_| {
        MalformedMessage::new(
            String::from_utf8_lossy(bytes).into_owned(),
            MalformedReason::InvalidUtf8,
        )
    })?;

    let (area, station) = text
        .split_once(FIELD_SEPARATOR)
        .ok_or_else(|| MalformedMessage::new(text, MalformedReason::MissingDelimiter))?;

    let area = area.trim();
    let station = station.trim();
    validate_field(area, Field::Area).map_err(|r| MalformedMessage::new(text, r))?;
    validate_field(station, Field::Station).map_err(|r| MalformedMessage::new(text, r))?;

    Ok(ScanEvent {
        area: area.to_string(),
        station: station.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_basic() {
        let event = decode(b"OP7,S500").unwrap();
        assert_eq!(event.area(), "OP7");
        assert_eq!(event.station(), "S500");
        assert_eq!(event.canonical(), "OP7,S500");
    }

    #[test]
    fn test_decode_trims_whitespace() {
        let event = decode(b"  OP7 , S500\n").unwrap();
        assert_eq!(event, ScanEvent::new("OP7", "S500").unwrap());
    }

    #[test]
    fn test_decode_rejects_missing_delimiter() {
        let err = decode(b"OP7S500").unwrap_err();
        assert_eq!(err.reason, MalformedReason::MissingDelimiter);
        assert_eq!(err.payload, "OP7S500");
    }

    #[test]
    fn test_decode_rejects_empty_fields() {
        assert_eq!(
            decode(b",S500").unwrap_err().reason,
            MalformedReason::EmptyField { field: Field::Area }
        );
        assert_eq!(
            decode(b"OP7,  ").unwrap_err().reason,
            MalformedReason::EmptyField {
                field: Field::Station
            }
        );
        assert_eq!(
            decode(b"").unwrap_err().reason,
            MalformedReason::MissingDelimiter
        );
    }

    #[test]
    fn test_decode_rejects_extra_delimiter() {
        let err = decode(b"OP7,S500,extra").unwrap_err();
        assert_eq!(
            err.reason,
            MalformedReason::DelimiterInField {
                field: Field::Station
            }
        );
    }

    #[test]
    fn test_decode_rejects_embedded_line_break() {
        let err = decode(b"OP7,S5\n00").unwrap_err();
        assert_eq!(
            err.reason,
            MalformedReason::LineBreakInField {
                field: Field::Station
            }
        );
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let err = decode(&[0x4f, 0x50, 0xff, b',', b'S']).unwrap_err();
        assert_eq!(err.reason, MalformedReason::InvalidUtf8);
        assert!(err.payload.contains('\u{FFFD}'));
    }

    #[test]
    fn test_new_validates_like_decode() {
        assert!(ScanEvent::new("OP,7", "S500").is_err());
        assert!(ScanEvent::new(" ", "S500").is_err());
        let event = ScanEvent::new(" OP7 ", "S500").unwrap();
        assert_eq!(encode(&event), b"OP7,S500".to_vec());
    }

    #[test]
    fn test_display_and_from_str() {
        let event: ScanEvent = "OP1,S100".parse().unwrap();
        assert_eq!(event.to_string(), "OP1,S100");
        assert!("garbage".parse::<ScanEvent>().is_err());
    }

    #[test]
    fn test_malformed_message_display() {
        let err = decode(b"OP7").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Malformed scan message \"OP7\": missing ',' separator"
        );
    }
}
