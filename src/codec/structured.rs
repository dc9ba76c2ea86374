//! Format A: the structured spool tag.
//!
//! ```text
//! offset size  field
//! 0      3     signature "SST"
//! 3      1     version (high nibble major, low nibble minor)
//! 4      2     body length N, big-endian
//! 6      4     first 4 bytes of SHA-256(body)
//! 10     N     fields: type u8, length u8, value
//! 10+N   ...   ignored
//! ```
//!
//! Only major version 1 is read. Any other major, including the pre-release
//! major 0, is `UnsupportedVersion`: its field table is not this one.

use byteorder::{BigEndian, ByteOrder};
use tracing::trace;

use super::{decode_body, encode_body, checksum, verify_checksum, BinaryFormat, FieldKind, FieldSpec, LengthWidth};
use crate::error::{DecodeError, EncodeError};
use crate::tag::fields::*;
use crate::tag::FieldMap;

pub const SIGNATURE: &[u8] = b"SST";

/// Version written by the encoder (1.0).
pub const VERSION: u8 = 0x10;
const SUPPORTED_MAJOR: u8 = 1;

const HEADER_LEN: usize = 10;
const CHECKSUM_LEN: usize = 4;
const FORMAT: BinaryFormat = BinaryFormat::Structured;

const FIELDS: &[FieldSpec] = &[
    FieldSpec { code: 0x01, name: VENDOR_NAME, kind: FieldKind::Text },
    FieldSpec { code: 0x02, name: MATERIAL_BASE, kind: FieldKind::MaterialCode },
    FieldSpec { code: 0x03, name: MATERIAL_MODIFIER, kind: FieldKind::Text },
    FieldSpec { code: 0x04, name: MATERIAL_NAME, kind: FieldKind::Text },
    FieldSpec { code: 0x05, name: COLOR_NAME, kind: FieldKind::Text },
    FieldSpec { code: 0x06, name: COLOR_HEX, kind: FieldKind::Rgb },
    FieldSpec { code: 0x07, name: SECONDARY_COLORS, kind: FieldKind::RgbList },
    FieldSpec { code: 0x08, name: FILAMENT_DIAMETER, kind: FieldKind::Int },
    FieldSpec { code: 0x09, name: NOMINAL_WEIGHT, kind: FieldKind::Int },
    FieldSpec { code: 0x0A, name: ACTUAL_WEIGHT, kind: FieldKind::Int },
    FieldSpec { code: 0x0B, name: SPOOL_WEIGHT, kind: FieldKind::Int },
    FieldSpec { code: 0x0C, name: FILAMENT_LENGTH, kind: FieldKind::Int },
    FieldSpec { code: 0x0D, name: DENSITY, kind: FieldKind::Int },
    FieldSpec { code: 0x0E, name: PRINT_TEMP_MIN, kind: FieldKind::Int },
    FieldSpec { code: 0x0F, name: PRINT_TEMP_MAX, kind: FieldKind::Int },
    FieldSpec { code: 0x10, name: BED_TEMP_MIN, kind: FieldKind::Int },
    FieldSpec { code: 0x11, name: BED_TEMP_MAX, kind: FieldKind::Int },
    FieldSpec { code: 0x12, name: GTIN, kind: FieldKind::Int },
    FieldSpec { code: 0x13, name: INSTANCE_ID, kind: FieldKind::HexId },
];

pub fn decode(record: &[u8]) -> Result<FieldMap, DecodeError> {
    if record.len() < HEADER_LEN {
        return Err(DecodeError::TruncatedRecord {
            format: FORMAT,
            needed: HEADER_LEN,
            available: record.len(),
        });
    }
    if !record.starts_with(SIGNATURE) {
        return Err(DecodeError::malformed("signature", "not a structured spool tag"));
    }

    let version = record[3];
    if version >> 4 != SUPPORTED_MAJOR {
        return Err(DecodeError::UnsupportedVersion {
            format: FORMAT,
            version,
        });
    }

    let body_len = usize::from(BigEndian::read_u16(&record[4..6]));
    let end = HEADER_LEN + body_len;
    if record.len() < end {
        return Err(DecodeError::TruncatedRecord {
            format: FORMAT,
            needed: end,
            available: record.len(),
        });
    }

    let body = &record[HEADER_LEN..end];
    verify_checksum(FORMAT, &record[6..HEADER_LEN], body)?;
    trace!(version, body_len, "Structured record checksum verified");

    decode_body(FORMAT, FIELDS, body, LengthWidth::U8)
}

pub fn encode(fields: &FieldMap) -> Result<Vec<u8>, EncodeError> {
    let body = encode_body(FORMAT, FIELDS, fields, LengthWidth::U8)?;

    let mut record = Vec::with_capacity(HEADER_LEN + body.len());
    record.extend_from_slice(SIGNATURE);
    record.push(VERSION);
    let mut len = [0u8; 2];
    BigEndian::write_u16(&mut len, body.len() as u16);
    record.extend_from_slice(&len);
    record.extend_from_slice(&checksum(&body, CHECKSUM_LEN));
    record.extend_from_slice(&body);
    Ok(record)
}
