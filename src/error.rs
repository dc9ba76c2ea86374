use thiserror::Error;

use crate::codec::BinaryFormat;
use crate::tag::NfcId;

/// Failure to turn a raw tag payload into normalized fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Tag not recognized: no known record and no hardware identifier")]
    UnrecognizedTag,

    #[error("{format} record version {version:#04x} is not supported")]
    UnsupportedVersion { format: BinaryFormat, version: u8 },

    #[error("{format} record checksum mismatch: stored {stored}, computed {computed}")]
    ChecksumMismatch {
        format: BinaryFormat,
        stored: String,
        computed: String,
    },

    #[error("{format} record truncated: needed {needed} bytes, only {available} available")]
    TruncatedRecord {
        format: BinaryFormat,
        needed: usize,
        available: usize,
    },

    #[error("Malformed field '{field}': {reason}")]
    MalformedField { field: String, reason: String },

    #[error("Tag text carries no SPOOL reference")]
    MissingSpoolReference,
}

impl DecodeError {
    pub(crate) fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        DecodeError::MalformedField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Failure to serialize a field map into a binary record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("{format} records have no field named '{field}'")]
    UnsupportedField { format: BinaryFormat, field: String },

    #[error("Field '{field}' expects {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },

    #[error("Field '{field}' is {len} bytes long, at most {max} fit")]
    ValueTooLong { field: String, len: usize, max: usize },

    #[error("{format} body of {len} bytes exceeds the {max} byte limit")]
    BodyTooLong {
        format: BinaryFormat,
        len: usize,
        max: usize,
    },

    #[error("Unknown material class '{0}'")]
    UnknownCategory(String),
}

/// Failure reported by an inventory repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Unexpected response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("Inventory unavailable: {0}")]
    Unavailable(String),
}

/// What a failed spool lookup was keyed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpoolLookup {
    Id(u32),
    Nfc(NfcId),
}

impl std::fmt::Display for SpoolLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpoolLookup::Id(id) => write!(f, "#{}", id),
            SpoolLookup::Nfc(nfc_id) => write!(f, "with nfc_id {}", nfc_id),
        }
    }
}

/// Failure to bind decoded tag content to inventory entities.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Spool {0} not found in inventory")]
    SpoolNotFound(SpoolLookup),

    #[error("Inventory repository unavailable: {0}")]
    RepositoryUnavailable(#[from] RepositoryError),

    /// Unbound tag whose descriptor lacks what is needed to look up or
    /// create entities, or carries out-of-range values.
    #[error("Tag description incomplete: {0}")]
    IncompleteDescriptor(DecodeError),
}

/// Terminal outcome of a single failed scan.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Reconcile(ReconcileError),
}

impl From<ReconcileError> for ScanError {
    fn from(err: ReconcileError) -> Self {
        match err {
            // Deficient tag content is the tag's fault, not the inventory's.
            ReconcileError::IncompleteDescriptor(decode) => ScanError::Decode(decode),
            other => ScanError::Reconcile(other),
        }
    }
}

impl ScanError {
    pub fn is_decode(&self) -> bool {
        matches!(self, ScanError::Decode(_))
    }

    /// Short guidance for whoever is standing at the printer.
    pub fn operator_hint(&self) -> &'static str {
        match self {
            ScanError::Decode(_) => "unreadable tag",
            ScanError::Reconcile(ReconcileError::SpoolNotFound(_)) => "spool unknown to inventory",
            ScanError::Reconcile(ReconcileError::RepositoryUnavailable(_)) => {
                "inventory service unavailable"
            }
            ScanError::Reconcile(ReconcileError::IncompleteDescriptor(_)) => "unreadable tag",
        }
    }
}

/// Failure to deliver printer macros.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Printer rejected commands: {0}")]
    Rejected(String),
}

/// Invalid field-mapping configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("Invalid mapping target '{0}': expected vendor.<field>, filament.<field> or spool.<field>")]
    InvalidTarget(String),

    #[error("Rule for '{target}' references unknown tag field '{field}'")]
    UnknownField { target: String, field: String },

    #[error("Template for '{target}' is malformed: {reason}")]
    BadTemplate { target: String, reason: String },

    #[error("Rule for '{target}' must set exactly one of field, template or value")]
    AmbiguousRule { target: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_messages_name_the_format() {
        let err = DecodeError::UnsupportedVersion {
            format: BinaryFormat::Structured,
            version: 0x20,
        };
        assert_eq!(
            err.to_string(),
            "structured spool tag record version 0x20 is not supported"
        );

        let err = DecodeError::TruncatedRecord {
            format: BinaryFormat::Neutral,
            needed: 12,
            available: 9,
        };
        assert!(err.to_string().contains("needed 12 bytes"));
    }

    #[test]
    fn test_scan_error_distinguishes_decode_from_reconcile() {
        let decode: ScanError = DecodeError::MissingSpoolReference.into();
        assert!(decode.is_decode());
        assert_eq!(decode.operator_hint(), "unreadable tag");

        let unavailable: ScanError =
            ReconcileError::from(RepositoryError::Unavailable("down".to_string())).into();
        assert!(!unavailable.is_decode());
        assert_eq!(unavailable.operator_hint(), "inventory service unavailable");

        let missing: ScanError = ReconcileError::SpoolNotFound(SpoolLookup::Id(7)).into();
        assert_eq!(missing.to_string(), "Spool #7 not found in inventory");
        assert_eq!(missing.operator_hint(), "spool unknown to inventory");

        let incomplete: ScanError =
            ReconcileError::IncompleteDescriptor(DecodeError::malformed("vendor_name", "missing"))
                .into();
        assert!(incomplete.is_decode());
    }
}
