//! Raw tag content as handed over by the radio transport.
//!
//! A scan produces one [`RawTagPayload`]: the NDEF records found on the tag
//! plus the chip's hardware identifier. Nothing here interprets record
//! contents beyond the NDEF text framing; that is the sniffer's job.

pub mod fields;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

pub use fields::{Descriptor, FieldMap, FieldValue, NormalizedFields, SpoolReference};

/// NDEF record type indicator, reduced to what the decoders care about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum RecordType {
    /// NFC Forum well-known text record ("T").
    Text,
    /// Media-type record, e.g. `application/vnd.openprinttag`.
    Mime(String),
    /// NFC Forum external type, e.g. `example.com:spool`.
    External(String),
    Other(String),
}

impl RecordType {
    /// Classify a record type name as reported by NDEF tooling.
    pub fn parse(type_name: &str) -> RecordType {
        let name = type_name.trim();
        if name == "T" || name.eq_ignore_ascii_case("urn:nfc:wkt:T") || name.eq_ignore_ascii_case("text") {
            RecordType::Text
        } else if let Some(ext) = name.strip_prefix("urn:nfc:ext:") {
            RecordType::External(ext.to_string())
        } else if name.contains('/') {
            RecordType::Mime(name.to_string())
        } else if name.contains(':') {
            RecordType::External(name.to_string())
        } else {
            RecordType::Other(name.to_string())
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, RecordType::Text)
    }
}

/// One NDEF record: type indicator and undecoded payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    pub record_type: RecordType,
    pub payload: Vec<u8>,
}

impl TagRecord {
    pub fn new(record_type: RecordType, payload: Vec<u8>) -> Self {
        Self {
            record_type,
            payload,
        }
    }

    /// Build a UTF-8 text record with language code "en".
    pub fn text(text: &str) -> Self {
        let lang = b"en";
        let mut payload = Vec::with_capacity(1 + lang.len() + text.len());
        payload.push(lang.len() as u8);
        payload.extend_from_slice(lang);
        payload.extend_from_slice(text.as_bytes());
        Self::new(RecordType::Text, payload)
    }

    /// Decoded text of a text record, `None` for any other record type.
    pub fn text_content(&self) -> Option<Result<String, DecodeError>> {
        if !self.record_type.is_text() {
            return None;
        }
        Some(decode_text_payload(&self.payload))
    }
}

/// Decode an RTD-Text payload: status byte (bit 7 = UTF-16, bits 0-5 =
/// language code length), language code, then the text itself.
fn decode_text_payload(payload: &[u8]) -> Result<String, DecodeError> {
    let Some((&status, rest)) = payload.split_first() else {
        return Ok(String::new());
    };

    let lang_len = usize::from(status & 0x3F);
    if rest.len() < lang_len {
        return Err(DecodeError::malformed(
            "text",
            format!("language code of {} bytes exceeds record", lang_len),
        ));
    }
    let body = &rest[lang_len..];

    if status & 0x80 == 0 {
        return String::from_utf8(body.to_vec())
            .map_err(|e| DecodeError::malformed("text", format!("invalid UTF-8: {}", e)));
    }

    if body.len() % 2 != 0 {
        return Err(DecodeError::malformed("text", "odd-length UTF-16 body"));
    }
    // Big-endian unless a little-endian byte order mark says otherwise.
    let little_endian = body.starts_with(&[0xFF, 0xFE]);
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| {
            if little_endian {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    let text = String::from_utf16(&units)
        .map_err(|e| DecodeError::malformed("text", format!("invalid UTF-16: {}", e)))?;
    Ok(text.trim_start_matches('\u{feff}').to_string())
}

/// Everything read from one tag during one scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawTagPayload {
    /// Chip serial number; `None` when the reader could not report it.
    pub uid: Option<Vec<u8>>,
    pub records: Vec<TagRecord>,
}

impl RawTagPayload {
    pub fn new(uid: Option<Vec<u8>>, records: Vec<TagRecord>) -> Self {
        Self { uid, records }
    }

    pub fn nfc_id(&self) -> Option<NfcId> {
        self.uid
            .as_deref()
            .filter(|uid| !uid.is_empty())
            .map(NfcId::from_uid)
    }
}

/// Hardware identifier in its inventory form: lowercase hex bytes without
/// zero padding, joined by colons (`[0xAA, 0x0B]` renders as `aa:b`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NfcId(String);

impl NfcId {
    pub fn from_uid(uid: &[u8]) -> Self {
        let rendered: Vec<String> = uid.iter().map(|b| format!("{:x}", b)).collect();
        NfcId(rendered.join(":"))
    }

    /// Parse either the colon form (`aa:bb:cc`) or contiguous hex (`aabbcc`).
    pub fn parse(input: &str) -> Result<Self, DecodeError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(DecodeError::malformed("tag_identifier", "empty identifier"));
        }

        if input.contains(':') {
            let mut bytes = Vec::new();
            for part in input.split(':') {
                let byte = u8::from_str_radix(part, 16).map_err(|_| {
                    DecodeError::malformed("tag_identifier", format!("'{}' is not a hex byte", part))
                })?;
                bytes.push(byte);
            }
            return Ok(Self::from_uid(&bytes));
        }

        let bytes = hex::decode(input)
            .map_err(|e| DecodeError::malformed("tag_identifier", e.to_string()))?;
        Ok(Self::from_uid(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a stored identifier.
    pub fn matches(&self, stored: &str) -> bool {
        self.0.eq_ignore_ascii_case(stored.trim())
    }
}

impl fmt::Display for NfcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
