//! Normalized tag fields shared by every decoder.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::codec::BinaryFormat;
use crate::tag::NfcId;

// =============================================================================
// CANONICAL FIELD NAMES
// =============================================================================

pub const SPOOL_ID: &str = "spool_id";
pub const FILAMENT_ID: &str = "filament_id";

pub const VENDOR_NAME: &str = "vendor_name";
pub const MATERIAL_BASE: &str = "material_base";
pub const MATERIAL_MODIFIER: &str = "material_modifier";
pub const MATERIAL_NAME: &str = "material_name";
pub const COLOR_NAME: &str = "color_name";
pub const COLOR_HEX: &str = "color_hex";
pub const SECONDARY_COLORS: &str = "secondary_colors";
pub const FILAMENT_DIAMETER: &str = "filament_diameter";
pub const NOMINAL_WEIGHT: &str = "nominal_weight";
pub const ACTUAL_WEIGHT: &str = "actual_weight";
pub const SPOOL_WEIGHT: &str = "spool_weight";
pub const FILAMENT_LENGTH: &str = "filament_length";
pub const DENSITY: &str = "density";
pub const PRINT_TEMP: &str = "print_temp";
pub const PRINT_TEMP_MIN: &str = "print_temp_min";
pub const PRINT_TEMP_MAX: &str = "print_temp_max";
pub const BED_TEMP: &str = "bed_temp";
pub const BED_TEMP_MIN: &str = "bed_temp_min";
pub const BED_TEMP_MAX: &str = "bed_temp_max";
pub const GTIN: &str = "gtin";
pub const INSTANCE_ID: &str = "instance_id";
pub const TAG_IDENTIFIER: &str = "tag_identifier";

/// Every name a decoder can produce. Mapping rules may only reference these.
pub const KNOWN_FIELDS: &[&str] = &[
    SPOOL_ID,
    FILAMENT_ID,
    VENDOR_NAME,
    MATERIAL_BASE,
    MATERIAL_MODIFIER,
    MATERIAL_NAME,
    COLOR_NAME,
    COLOR_HEX,
    SECONDARY_COLORS,
    FILAMENT_DIAMETER,
    NOMINAL_WEIGHT,
    ACTUAL_WEIGHT,
    SPOOL_WEIGHT,
    FILAMENT_LENGTH,
    DENSITY,
    PRINT_TEMP,
    PRINT_TEMP_MIN,
    PRINT_TEMP_MAX,
    BED_TEMP,
    BED_TEMP_MIN,
    BED_TEMP_MAX,
    GTIN,
    INSTANCE_ID,
    TAG_IDENTIFIER,
];

pub fn is_known_field(name: &str) -> bool {
    KNOWN_FIELDS.contains(&name)
}

// =============================================================================
// MATERIAL CLASSES
// =============================================================================

/// One-byte material class codes carried by structured tags.
const MATERIAL_CLASSES: &[(u8, &str)] = &[
    (0x01, "PLA"),
    (0x02, "PETG"),
    (0x03, "ABS"),
    (0x04, "ASA"),
    (0x05, "TPU"),
    (0x06, "PA"),
    (0x07, "PC"),
    (0x08, "PVA"),
    (0x09, "HIPS"),
    (0x0A, "PP"),
    (0x0B, "PET"),
    (0x0C, "PCTG"),
    (0x0D, "PEEK"),
    (0x0E, "PVB"),
    (0x0F, "PEI"),
    (0x10, "PPS"),
];

pub fn material_class_name(code: u8) -> Option<&'static str> {
    MATERIAL_CLASSES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

pub fn material_class_code(name: &str) -> Option<u8> {
    let wanted = normalize_token(name);
    MATERIAL_CLASSES
        .iter()
        .find(|(_, n)| *n == wanted)
        .map(|(c, _)| *c)
}

/// Upper-case, trim and collapse inner whitespace. Used wherever material
/// or color attributes are compared.
pub fn normalize_token(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

// =============================================================================
// VALUES
// =============================================================================

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(u64),
    Text(String),
    /// Member of a closed vocabulary (material class).
    Category(String),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) | FieldValue::Category(s) => Some(s),
            FieldValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            FieldValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Plain string rendering for template substitution.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Int(n) => n.to_string(),
            FieldValue::Text(s) | FieldValue::Category(s) => s.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Int(n) => serde_json::Value::from(*n),
            FieldValue::Text(s) | FieldValue::Category(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl From<u64> for FieldValue {
    fn from(n: u64) -> Self {
        FieldValue::Int(n)
    }
}

impl From<u32> for FieldValue {
    fn from(n: u32) -> Self {
        FieldValue::Int(u64::from(n))
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

/// Canonical field name to value. Keys are unique; order is irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldMap(BTreeMap<String, FieldValue>);

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; the latest value for a name wins.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(FieldValue::as_text)
    }

    pub fn int(&self, name: &str) -> Option<u64> {
        self.0.get(name).and_then(FieldValue::as_int)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.0.remove(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = FieldMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

// =============================================================================
// DECODER OUTPUT
// =============================================================================

/// Direct inventory reference read from a text tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpoolReference {
    pub spool_id: u32,
    pub filament_id: Option<u32>,
}

/// Full material description read from a binary record, bound to the tag
/// it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Descriptor {
    pub format: BinaryFormat,
    pub nfc_id: NfcId,
    pub fields: FieldMap,
}

/// Decoder output. The two shapes never mix: a tag either references
/// existing inventory or describes material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum NormalizedFields {
    Reference(SpoolReference),
    Descriptor(Descriptor),
}

impl NormalizedFields {
    /// Flat view of the fields, e.g. for display.
    pub fn field_map(&self) -> FieldMap {
        match self {
            NormalizedFields::Reference(reference) => {
                let mut map = FieldMap::new();
                map.insert(SPOOL_ID, reference.spool_id);
                if let Some(filament_id) = reference.filament_id {
                    map.insert(FILAMENT_ID, filament_id);
                }
                map
            }
            NormalizedFields::Descriptor(descriptor) => descriptor.fields.clone(),
        }
    }
}
