//! Binary record codec for the two checksummed tag formats.
//!
//! # Discipline shared by both formats
//!
//! - **Version**: checked first; anything newer than the understood major
//!   version is rejected, minor bumps are accepted.
//! - **Checksum**: a SHA-256 prefix over the body, verified before a single
//!   field is read. A failed record never yields partial fields.
//! - **Fields**: type/length/value triples. Unknown types are skipped using
//!   their declared length; a repeated type replaces the earlier value.
//!
//! The concrete byte layouts live in [`structured`] and [`neutral`].

pub mod neutral;
pub mod structured;

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{DecodeError, EncodeError};
use crate::tag::fields::{material_class_code, material_class_name};
use crate::tag::{FieldMap, FieldValue};

/// The two binary record formats, in sniffing precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryFormat {
    /// Format A: "SST" signature, big-endian header, one-byte field lengths.
    Structured,
    /// Format B: "NSPL" signature, little-endian header, two-byte field lengths.
    Neutral,
}

impl BinaryFormat {
    pub const ALL: [BinaryFormat; 2] = [BinaryFormat::Structured, BinaryFormat::Neutral];

    pub fn signature(self) -> &'static [u8] {
        match self {
            BinaryFormat::Structured => structured::SIGNATURE,
            BinaryFormat::Neutral => neutral::SIGNATURE,
        }
    }

    /// True if `payload` starts with this format's signature.
    pub fn matches(self, payload: &[u8]) -> bool {
        payload.starts_with(self.signature())
    }

    /// First format (in precedence order) whose signature the payload carries.
    pub fn detect(payload: &[u8]) -> Option<BinaryFormat> {
        Self::ALL.into_iter().find(|format| format.matches(payload))
    }

    pub fn decode(self, record: &[u8]) -> Result<FieldMap, DecodeError> {
        match self {
            BinaryFormat::Structured => structured::decode(record),
            BinaryFormat::Neutral => neutral::decode(record),
        }
    }

    pub fn encode(self, fields: &FieldMap) -> Result<Vec<u8>, EncodeError> {
        match self {
            BinaryFormat::Structured => structured::encode(fields),
            BinaryFormat::Neutral => neutral::encode(fields),
        }
    }
}

impl fmt::Display for BinaryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryFormat::Structured => f.write_str("structured spool tag"),
            BinaryFormat::Neutral => f.write_str("vendor-neutral tag"),
        }
    }
}

impl FromStr for BinaryFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "structured" | "a" => Ok(BinaryFormat::Structured),
            "neutral" | "b" => Ok(BinaryFormat::Neutral),
            other => Err(format!(
                "unknown binary format '{}', expected 'structured' or 'neutral'",
                other
            )),
        }
    }
}

// =============================================================================
// FIELD TABLES
// =============================================================================

/// How a field value is laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldKind {
    /// UTF-8 string.
    Text,
    /// UTF-8 string, upper-cased on both decode and encode.
    UpperText,
    /// Big-endian unsigned integer, 1..=8 bytes.
    Int,
    /// One-byte material class code.
    MaterialCode,
    /// RGB, optionally followed by an ignored alpha byte.
    Rgb,
    /// RGBA; alpha is dropped on decode and written as 0xFF.
    Rgba,
    /// Concatenated RGB triples.
    RgbList,
    /// Opaque bytes rendered as lowercase hex, at most 16.
    HexId,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldSpec {
    pub code: u8,
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Width of the per-field length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LengthWidth {
    U8,
    U16Le,
}

impl LengthWidth {
    fn bytes(self) -> usize {
        match self {
            LengthWidth::U8 => 1,
            LengthWidth::U16Le => 2,
        }
    }

    fn max_value_len(self) -> usize {
        match self {
            LengthWidth::U8 => u8::MAX as usize,
            LengthWidth::U16Le => u16::MAX as usize,
        }
    }
}

const MAX_HEX_ID_LEN: usize = 16;

// =============================================================================
// CHECKSUM
// =============================================================================

pub(crate) fn checksum(body: &[u8], len: usize) -> Vec<u8> {
    let digest = Sha256::digest(body);
    digest[..len].to_vec()
}

pub(crate) fn verify_checksum(
    format: BinaryFormat,
    stored: &[u8],
    body: &[u8],
) -> Result<(), DecodeError> {
    let computed = checksum(body, stored.len());
    if computed != stored {
        return Err(DecodeError::ChecksumMismatch {
            format,
            stored: hex::encode(stored),
            computed: hex::encode(&computed),
        });
    }
    Ok(())
}

// =============================================================================
// DECODING
// =============================================================================

/// Split a body into (type, value) triples without interpreting values.
fn read_tlvs(
    format: BinaryFormat,
    body: &[u8],
    width: LengthWidth,
) -> Result<Vec<(u8, &[u8])>, DecodeError> {
    let truncated = |needed: usize| DecodeError::TruncatedRecord {
        format,
        needed,
        available: body.len(),
    };

    let mut cursor = Cursor::new(body);
    let mut triples = Vec::new();

    while (cursor.position() as usize) < body.len() {
        let start = cursor.position() as usize;
        let value_start = start + 1 + width.bytes();
        if value_start > body.len() {
            return Err(truncated(value_start));
        }

        let code = cursor.read_u8().map_err(|_| truncated(start + 1))?;
        let len = match width {
            LengthWidth::U8 => cursor.read_u8().map(usize::from),
            LengthWidth::U16Le => cursor.read_u16::<LittleEndian>().map(usize::from),
        }
        .map_err(|_| truncated(value_start))?;

        let value_end = value_start + len;
        if value_end > body.len() {
            return Err(truncated(value_end));
        }
        triples.push((code, &body[value_start..value_end]));
        cursor.set_position(value_end as u64);
    }

    Ok(triples)
}

/// Decode a checksummed body into fields. Either every field decodes or an
/// error is returned.
pub(crate) fn decode_body(
    format: BinaryFormat,
    table: &[FieldSpec],
    body: &[u8],
    width: LengthWidth,
) -> Result<FieldMap, DecodeError> {
    let mut fields = FieldMap::new();

    for (code, raw) in read_tlvs(format, body, width)? {
        let Some(spec) = table.iter().find(|spec| spec.code == code) else {
            debug!(%format, code, len = raw.len(), "Skipping unknown field type");
            continue;
        };
        if let Some(value) = decode_value(spec, raw)? {
            fields.insert(spec.name, value);
        }
    }

    Ok(fields)
}

fn decode_value(spec: &FieldSpec, raw: &[u8]) -> Result<Option<FieldValue>, DecodeError> {
    let malformed = |reason: String| DecodeError::malformed(spec.name, reason);

    let value = match spec.kind {
        FieldKind::Text => FieldValue::Text(decode_utf8(spec.name, raw)?),
        FieldKind::UpperText => FieldValue::Text(decode_utf8(spec.name, raw)?.to_uppercase()),
        FieldKind::Int => FieldValue::Int(decode_uint(spec.name, raw)?),
        FieldKind::MaterialCode => {
            let [code] = raw else {
                return Err(malformed(format!("expected 1 byte, got {}", raw.len())));
            };
            match material_class_name(*code) {
                Some(name) => FieldValue::Category(name.to_string()),
                None => {
                    debug!(field = spec.name, code, "Skipping unknown material class code");
                    return Ok(None);
                }
            }
        }
        FieldKind::Rgb => match raw.len() {
            3 | 4 => FieldValue::Text(render_rgb(&raw[..3])),
            n => return Err(malformed(format!("expected 3 or 4 color bytes, got {}", n))),
        },
        FieldKind::Rgba => match raw.len() {
            4 => FieldValue::Text(render_rgb(&raw[..3])),
            n => return Err(malformed(format!("expected 4 color bytes, got {}", n))),
        },
        FieldKind::RgbList => {
            if raw.is_empty() || raw.len() % 3 != 0 {
                return Err(malformed(format!(
                    "expected a multiple of 3 color bytes, got {}",
                    raw.len()
                )));
            }
            let colors: Vec<String> = raw.chunks_exact(3).map(render_rgb).collect();
            FieldValue::Text(colors.join(","))
        }
        FieldKind::HexId => {
            if raw.is_empty() || raw.len() > MAX_HEX_ID_LEN {
                return Err(malformed(format!(
                    "expected 1 to {} bytes, got {}",
                    MAX_HEX_ID_LEN,
                    raw.len()
                )));
            }
            FieldValue::Text(hex::encode(raw))
        }
    };

    Ok(Some(value))
}

fn decode_utf8(field: &str, raw: &[u8]) -> Result<String, DecodeError> {
    String::from_utf8(raw.to_vec())
        .map_err(|e| DecodeError::malformed(field, format!("invalid UTF-8: {}", e)))
}

fn decode_uint(field: &str, raw: &[u8]) -> Result<u64, DecodeError> {
    if raw.is_empty() || raw.len() > 8 {
        return Err(DecodeError::malformed(
            field,
            format!("integer must be 1 to 8 bytes, got {}", raw.len()),
        ));
    }
    Ok(raw.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn render_rgb(rgb: &[u8]) -> String {
    format!("#{}", hex::encode_upper(rgb))
}

// =============================================================================
// ENCODING
// =============================================================================

/// Serialize fields into a body in ascending type order.
pub(crate) fn encode_body(
    format: BinaryFormat,
    table: &[FieldSpec],
    fields: &FieldMap,
    width: LengthWidth,
) -> Result<Vec<u8>, EncodeError> {
    let mut encoded: Vec<(u8, Vec<u8>)> = Vec::with_capacity(fields.len());

    for (name, value) in fields.iter() {
        let spec = table
            .iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| EncodeError::UnsupportedField {
                format,
                field: name.to_string(),
            })?;
        let bytes = encode_value(spec, value)?;
        if bytes.len() > width.max_value_len() {
            return Err(EncodeError::ValueTooLong {
                field: name.to_string(),
                len: bytes.len(),
                max: width.max_value_len(),
            });
        }
        encoded.push((spec.code, bytes));
    }
    encoded.sort_by_key(|(code, _)| *code);

    let mut body = Vec::new();
    for (code, bytes) in encoded {
        body.push(code);
        match width {
            LengthWidth::U8 => body.push(bytes.len() as u8),
            LengthWidth::U16Le => {
                let mut len = [0u8; 2];
                LittleEndian::write_u16(&mut len, bytes.len() as u16);
                body.extend_from_slice(&len);
            }
        }
        body.extend_from_slice(&bytes);
    }

    if body.len() > u16::MAX as usize {
        return Err(EncodeError::BodyTooLong {
            format,
            len: body.len(),
            max: u16::MAX as usize,
        });
    }
    Ok(body)
}

fn encode_value(spec: &FieldSpec, value: &FieldValue) -> Result<Vec<u8>, EncodeError> {
    let wrong_type = |expected: &'static str| EncodeError::WrongType {
        field: spec.name.to_string(),
        expected,
    };

    match spec.kind {
        FieldKind::Text => Ok(value.as_text().ok_or_else(|| wrong_type("a string"))?.as_bytes().to_vec()),
        FieldKind::UpperText => Ok(value
            .as_text()
            .ok_or_else(|| wrong_type("a string"))?
            .to_uppercase()
            .into_bytes()),
        FieldKind::Int => {
            let n = value.as_int().ok_or_else(|| wrong_type("an integer"))?;
            Ok(encode_uint(n))
        }
        FieldKind::MaterialCode => {
            let name = value.as_text().ok_or_else(|| wrong_type("a material class"))?;
            let code = material_class_code(name)
                .ok_or_else(|| EncodeError::UnknownCategory(name.to_string()))?;
            Ok(vec![code])
        }
        FieldKind::Rgb => {
            let text = value.as_text().ok_or_else(|| wrong_type("a #RRGGBB color"))?;
            parse_rgb(text).ok_or_else(|| wrong_type("a #RRGGBB color"))
        }
        FieldKind::Rgba => {
            let text = value.as_text().ok_or_else(|| wrong_type("a #RRGGBB color"))?;
            let mut rgba = parse_rgb(text).ok_or_else(|| wrong_type("a #RRGGBB color"))?;
            rgba.push(0xFF);
            Ok(rgba)
        }
        FieldKind::RgbList => {
            let text = value
                .as_text()
                .ok_or_else(|| wrong_type("comma-separated #RRGGBB colors"))?;
            let mut bytes = Vec::new();
            for color in text.split(',') {
                let rgb = parse_rgb(color.trim())
                    .ok_or_else(|| wrong_type("comma-separated #RRGGBB colors"))?;
                bytes.extend_from_slice(&rgb);
            }
            Ok(bytes)
        }
        FieldKind::HexId => {
            let text = value.as_text().ok_or_else(|| wrong_type("a hex string"))?;
            let bytes = hex::decode(text).map_err(|_| wrong_type("a hex string"))?;
            if bytes.is_empty() || bytes.len() > MAX_HEX_ID_LEN {
                return Err(EncodeError::ValueTooLong {
                    field: spec.name.to_string(),
                    len: bytes.len(),
                    max: MAX_HEX_ID_LEN,
                });
            }
            Ok(bytes)
        }
    }
}

/// Minimal big-endian width, at least one byte.
fn encode_uint(n: u64) -> Vec<u8> {
    let bytes = n.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    bytes[skip..].to_vec()
}

fn parse_rgb(text: &str) -> Option<Vec<u8>> {
    let digits = text.strip_prefix('#').unwrap_or(text);
    if digits.len() != 6 {
        return None;
    }
    hex::decode(digits).ok()
}
