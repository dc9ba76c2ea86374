//! Format sniffing: pick exactly one decode path for a scanned tag.
//!
//! Precedence is fixed. Tags routinely carry auxiliary records left by
//! vendor tooling, so a structured format must always beat the generic
//! identifier fallback:
//!
//! 1. structured spool tag record (format A)
//! 2. vendor-neutral record (format B)
//! 3. `SPOOL:`/`FILAMENT:` text record
//! 4. the tag's hardware identifier alone

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::BinaryFormat;
use crate::error::DecodeError;
use crate::tag::fields::{INSTANCE_ID, TAG_IDENTIFIER};
use crate::tag::{Descriptor, FieldMap, NfcId, NormalizedFields, RawTagPayload};
use crate::text;

/// Which decode path a tag took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TagFormat {
    Structured,
    Neutral,
    TextPair,
    IdentifierOnly,
}

impl From<BinaryFormat> for TagFormat {
    fn from(format: BinaryFormat) -> Self {
        match format {
            BinaryFormat::Structured => TagFormat::Structured,
            BinaryFormat::Neutral => TagFormat::Neutral,
        }
    }
}

/// Result of sniffing and decoding one tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DecodedTag {
    Fields(NormalizedFields),
    /// Nothing decodable; only the hardware identifier is known.
    Identifier(NfcId),
}

impl DecodedTag {
    pub fn format(&self) -> TagFormat {
        match self {
            DecodedTag::Fields(NormalizedFields::Reference(_)) => TagFormat::TextPair,
            DecodedTag::Fields(NormalizedFields::Descriptor(d)) => d.format.into(),
            DecodedTag::Identifier(_) => TagFormat::IdentifierOnly,
        }
    }

    /// Hardware identifier the decode is bound to, if any.
    pub fn nfc_id(&self) -> Option<&NfcId> {
        match self {
            DecodedTag::Fields(NormalizedFields::Reference(_)) => None,
            DecodedTag::Fields(NormalizedFields::Descriptor(d)) => Some(&d.nfc_id),
            DecodedTag::Identifier(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sniffer {
    /// Enabled binary formats, in precedence order.
    formats: Vec<BinaryFormat>,
}

impl Default for Sniffer {
    fn default() -> Self {
        Self {
            formats: BinaryFormat::ALL.to_vec(),
        }
    }
}

impl Sniffer {
    /// Only the listed binary formats are considered. Precedence between
    /// them stays fixed regardless of the order given.
    pub fn with_formats(enabled: &[BinaryFormat]) -> Self {
        let formats = BinaryFormat::ALL
            .into_iter()
            .filter(|format| enabled.contains(format))
            .collect();
        Self { formats }
    }

    pub fn formats(&self) -> &[BinaryFormat] {
        &self.formats
    }

    pub fn sniff(&self, payload: &RawTagPayload) -> Result<DecodedTag, DecodeError> {
        for &format in &self.formats {
            let record = payload
                .records
                .iter()
                .find(|record| !record.record_type.is_text() && format.matches(&record.payload));
            if let Some(record) = record {
                debug!(%format, len = record.payload.len(), "Binary record signature matched");
                // A detected record that fails to decode is terminal; it
                // never falls through to a weaker path.
                let fields = format.decode(&record.payload)?;
                return bind_descriptor(format, fields, payload).map(DecodedTag::Fields);
            }
        }

        let mut texts = Vec::new();
        for record in &payload.records {
            match record.text_content() {
                Some(Ok(text)) => texts.push(text),
                Some(Err(e)) => warn!(error = %e, "Skipping undecodable text record"),
                None => {}
            }
        }
        if let Some(reference) = text::parse_reference(texts.iter().map(String::as_str))? {
            info!(
                spool_id = reference.spool_id,
                filament_id = ?reference.filament_id,
                "Tag carries a spool reference"
            );
            return Ok(DecodedTag::Fields(NormalizedFields::Reference(reference)));
        }

        match payload.nfc_id() {
            Some(nfc_id) => {
                info!(%nfc_id, "No known record on tag, using hardware identifier");
                Ok(DecodedTag::Identifier(nfc_id))
            }
            None => Err(DecodeError::UnrecognizedTag),
        }
    }
}

fn bind_descriptor(
    format: BinaryFormat,
    mut fields: FieldMap,
    payload: &RawTagPayload,
) -> Result<NormalizedFields, DecodeError> {
    let nfc_id = match payload.nfc_id() {
        Some(id) => id,
        None => {
            let instance = fields.text(INSTANCE_ID).ok_or_else(|| {
                DecodeError::malformed(
                    TAG_IDENTIFIER,
                    "tag reports no hardware identifier and the record has no instance id",
                )
            })?;
            NfcId::parse(instance)?
        }
    };

    fields.insert(TAG_IDENTIFIER, nfc_id.to_string());
    info!(%format, %nfc_id, fields = fields.len(), "Decoded binary tag record");
    Ok(NormalizedFields::Descriptor(Descriptor {
        format,
        nfc_id,
        fields,
    }))
}
