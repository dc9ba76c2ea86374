//! `KEY:VALUE` text convention for tags that point at existing inventory.
//!
//! ```text
//! SPOOL:23
//! FILAMENT:14
//! ```
//!
//! Keys are case-sensitive. Lines that do not split into exactly one key
//! and one value, or carry another key, are ignored.

use tracing::debug;

use crate::error::DecodeError;
use crate::tag::fields::{FILAMENT_ID, SPOOL_ID};
use crate::tag::SpoolReference;

const SPOOL_KEY: &str = "SPOOL";
const FILAMENT_KEY: &str = "FILAMENT";

/// Scan one or more text blocks for a spool reference.
///
/// Returns `Ok(None)` when no line carries a recognized key, so the caller
/// can fall back to another decode path. Later lines override earlier ones.
pub fn parse_reference<'a, I>(texts: I) -> Result<Option<SpoolReference>, DecodeError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut spool_id = None;
    let mut filament_id = None;
    let mut recognized = false;

    for line in texts.into_iter().flat_map(str::lines) {
        let parts: Vec<&str> = line.split(':').collect();
        let [key, value] = parts.as_slice() else {
            continue;
        };
        match key.trim() {
            SPOOL_KEY => {
                spool_id = Some(parse_id(SPOOL_ID, value)?);
                recognized = true;
            }
            FILAMENT_KEY => {
                filament_id = Some(parse_id(FILAMENT_ID, value)?);
                recognized = true;
            }
            other => debug!(key = other, "Ignoring unrecognized tag text key"),
        }
    }

    if !recognized {
        return Ok(None);
    }
    let spool_id = spool_id.ok_or(DecodeError::MissingSpoolReference)?;
    Ok(Some(SpoolReference {
        spool_id,
        filament_id,
    }))
}

/// Decode a single text block; text without a spool reference is an error.
pub fn decode(text: &str) -> Result<SpoolReference, DecodeError> {
    parse_reference([text])?.ok_or(DecodeError::MissingSpoolReference)
}

/// Render a reference the way [`decode`] reads it.
pub fn encode(reference: &SpoolReference) -> String {
    match reference.filament_id {
        Some(filament_id) => format!(
            "{}:{}\n{}:{}\n",
            SPOOL_KEY, reference.spool_id, FILAMENT_KEY, filament_id
        ),
        None => format!("{}:{}\n", SPOOL_KEY, reference.spool_id),
    }
}

fn parse_id(field: &str, value: &str) -> Result<u32, DecodeError> {
    let value = value.trim();
    value.parse::<u32>().map_err(|_| {
        DecodeError::malformed(field, format!("'{}' is not a non-negative integer", value))
    })
}
