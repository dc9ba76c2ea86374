//! Format B: the vendor-neutral spool record.
//!
//! ```text
//! offset size  field
//! 0      4     signature "NSPL"
//! 4      1     version, 1..=2
//! 5      2     body length N, little-endian
//! 7      2     first 2 bytes of SHA-256(body)
//! 9      N     fields: type u8, length u16 little-endian, value
//! ```

use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

use super::{checksum, decode_body, encode_body, verify_checksum, BinaryFormat, FieldKind, FieldSpec, LengthWidth};
use crate::error::{DecodeError, EncodeError};
use crate::tag::fields::*;
use crate::tag::FieldMap;

pub const SIGNATURE: &[u8] = b"NSPL";

pub const VERSION: u8 = 2;
const MIN_VERSION: u8 = 1;

const HEADER_LEN: usize = 9;
const CHECKSUM_LEN: usize = 2;
const FORMAT: BinaryFormat = BinaryFormat::Neutral;

const FIELDS: &[FieldSpec] = &[
    FieldSpec { code: 0x01, name: VENDOR_NAME, kind: FieldKind::Text },
    FieldSpec { code: 0x02, name: MATERIAL_BASE, kind: FieldKind::UpperText },
    FieldSpec { code: 0x03, name: MATERIAL_MODIFIER, kind: FieldKind::Text },
    FieldSpec { code: 0x04, name: COLOR_NAME, kind: FieldKind::Text },
    FieldSpec { code: 0x05, name: COLOR_HEX, kind: FieldKind::Rgba },
    FieldSpec { code: 0x06, name: FILAMENT_DIAMETER, kind: FieldKind::Int },
    FieldSpec { code: 0x07, name: NOMINAL_WEIGHT, kind: FieldKind::Int },
    FieldSpec { code: 0x08, name: SPOOL_WEIGHT, kind: FieldKind::Int },
    FieldSpec { code: 0x09, name: PRINT_TEMP, kind: FieldKind::Int },
    FieldSpec { code: 0x0A, name: BED_TEMP, kind: FieldKind::Int },
    FieldSpec { code: 0x0B, name: DENSITY, kind: FieldKind::Int },
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
        return Err(DecodeError::malformed("signature", "not a vendor-neutral tag"));
    }

    let version = record[4];
    if !(MIN_VERSION..=VERSION).contains(&version) {
        return Err(DecodeError::UnsupportedVersion {
            format: FORMAT,
            version,
        });
    }

    let body_len = usize::from(LittleEndian::read_u16(&record[5..7]));
    let end = HEADER_LEN + body_len;
    if record.len() < end {
        return Err(DecodeError::TruncatedRecord {
            format: FORMAT,
            needed: end,
            available: record.len(),
        });
    }

    let body = &record[HEADER_LEN..end];
    verify_checksum(FORMAT, &record[7..HEADER_LEN], body)?;
    trace!(version, body_len, "Neutral record checksum verified");

    decode_body(FORMAT, FIELDS, body, LengthWidth::U16Le)
}

pub fn encode(fields: &FieldMap) -> Result<Vec<u8>, EncodeError> {
    let body = encode_body(FORMAT, FIELDS, fields, LengthWidth::U16Le)?;

    let mut record = Vec::with_capacity(HEADER_LEN + body.len());
    record.extend_from_slice(SIGNATURE);
    record.push(VERSION);
    let mut len = [0u8; 2];
    LittleEndian::write_u16(&mut len, body.len() as u16);
    record.extend_from_slice(&len);
    record.extend_from_slice(&checksum(&body, CHECKSUM_LEN));
    record.extend_from_slice(&body);
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert(VENDOR_NAME, "Generic");
        fields.insert(MATERIAL_BASE, "PETG");
        fields.insert(COLOR_HEX, "#00FF80");
        fields.insert(PRINT_TEMP, 235u64);
        fields.insert(BED_TEMP, 80u64);
        fields
    }

    fn frame(version: u8, body: &[u8]) -> Vec<u8> {
        let mut record = b"NSPL".to_vec();
        record.push(version);
        record.extend_from_slice(&(body.len() as u16).to_le_bytes());
        record.extend_from_slice(&checksum(body, CHECKSUM_LEN));
        record.extend_from_slice(body);
        record
    }

    #[test]
    fn test_encode_layout() {
        let mut fields = FieldMap::new();
        fields.insert(VENDOR_NAME, "Go");
        fields.insert(COLOR_HEX, "#102030");
        let record = encode(&fields).unwrap();
        assert_eq!(&record[..4], b"NSPL");
        assert_eq!(record[4], 2);
        assert_eq!(&record[5..7], &[12, 0]);
        assert_eq!(
            &record[9..],
            &[0x01, 2, 0, b'G', b'o', 0x05, 4, 0, 0x10, 0x20, 0x30, 0xFF]
        );
    }

    #[test]
    fn test_round_trip_sample() {
        let record = encode(&sample()).unwrap();
        assert_eq!(decode(&record).unwrap(), sample());
    }

    #[test]
    fn test_material_base_is_upper_cased() {
        let body = [0x02, 3, 0, b'p', b'l', b'a'];
        let fields = decode(&frame(1, &body)).unwrap();
        assert_eq!(fields.text(MATERIAL_BASE), Some("PLA"));
    }

    #[test]
    fn test_version_bounds() {
        let body = [0x01, 1, 0, b'V'];
        assert!(decode(&frame(1, &body)).is_ok());
        assert!(decode(&frame(2, &body)).is_ok());
        for version in [0, 3, 0x10] {
            assert_eq!(
                decode(&frame(version, &body)).unwrap_err(),
                DecodeError::UnsupportedVersion {
                    format: BinaryFormat::Neutral,
                    version
                }
            );
        }
    }

    #[test]
    fn test_rgb_without_alpha_is_malformed() {
        let body = [0x05, 3, 0, 1, 2, 3];
        assert!(matches!(
            decode(&frame(1, &body)),
            Err(DecodeError::MalformedField { .. })
        ));
    }

    #[test]
    fn test_unknown_field_with_wide_length_is_skipped() {
        let mut body = vec![0x40, 0x00, 0x01];
        body.extend(std::iter::repeat(0xAB).take(256));
        body.extend_from_slice(&[0x08, 1, 0, 200]);
        let fields = decode(&frame(2, &body)).unwrap();
        assert_eq!(fields.int(SPOOL_WEIGHT), Some(200));
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn test_stored_checksum_corruption_is_detected() {
        let mut record = encode(&sample()).unwrap();
        record[7] = record[7].wrapping_add(1);
        assert!(matches!(
            decode(&record),
            Err(DecodeError::ChecksumMismatch { format: BinaryFormat::Neutral, .. })
        ));
    }

    #[test]
    fn test_truncated_header() {
        assert!(matches!(
            decode(b"NSPL\x01"),
            Err(DecodeError::TruncatedRecord { needed: 9, available: 5, .. })
        ));
    }

    #[test]
    fn test_encode_rejects_structured_only_fields() {
        let mut fields = sample();
        fields.insert(GTIN, 4_006_381_333_931u64);
        assert!(matches!(
            encode(&fields),
            Err(EncodeError::UnsupportedField { format: BinaryFormat::Neutral, .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            vendor in "\\PC{1,60}",
            material in "[A-Z]{2,6}",
            rgb in any::<[u8; 3]>(),
            print_temp in prop::option::of(150u64..320),
            density in prop::option::of(any::<u64>()),
        ) {
            let mut fields = FieldMap::new();
            fields.insert(VENDOR_NAME, vendor);
            fields.insert(MATERIAL_BASE, material);
            fields.insert(COLOR_HEX, format!("#{}", hex::encode_upper(rgb)));
            if let Some(t) = print_temp {
                fields.insert(PRINT_TEMP, t);
            }
            if let Some(d) = density {
                fields.insert(DENSITY, d);
            }
            let record = encode(&fields).unwrap();
            prop_assert_eq!(decode(&record).unwrap(), fields);
        }
    }
}
