//! Inventory of vendors, filaments and spools.
//!
//! The reconciler only talks to the [`Repository`] trait. Two
//! implementations exist: [`SpoolmanClient`] over HTTP and
//! [`MemoryRepository`] for tests and `--mock` runs.

pub mod memory;
pub mod spoolman;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RepositoryError;
use crate::tag::fields::normalize_token;
use crate::tag::NfcId;

pub use memory::{MemoryRepository, RepositoryCall};
pub use spoolman::SpoolmanClient;

/// Key under a spool's `extra` holding the bound hardware identifier.
pub const NFC_ID_EXTRA: &str = "nfc_id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vendor {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub empty_spool_weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filament {
    pub id: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub vendor: Option<Vendor>,
    /// Base material plus modifier, e.g. "PLA Silk"
    #[serde(default)]
    pub material: Option<String>,
    /// Six hex digits without '#'
    #[serde(default)]
    pub color_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spool {
    pub id: u32,
    pub filament: Filament,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl Spool {
    /// The bound hardware identifier. Stored values are JSON-encoded
    /// strings (`"\"aa:bb\""`); plain strings are accepted too.
    pub fn nfc_id(&self) -> Option<String> {
        match self.extra.get(NFC_ID_EXTRA)? {
            Value::String(raw) => {
                let decoded = serde_json::from_str::<String>(raw).unwrap_or_else(|_| raw.clone());
                let decoded = decoded.trim().to_string();
                (!decoded.is_empty()).then_some(decoded)
            }
            _ => None,
        }
    }

    pub fn is_bound_to(&self, nfc_id: &NfcId) -> bool {
        self.nfc_id().is_some_and(|stored| nfc_id.matches(&stored))
    }
}

/// Attributes a filament must match exactly to be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilamentQuery {
    pub vendor_id: u32,
    pub material_base: String,
    pub material_modifier: Option<String>,
    /// Hex digits, with or without '#'
    pub color_hex: Option<String>,
}

impl FilamentQuery {
    /// Material as stored on a filament: base and modifier joined by a space.
    pub fn material(&self) -> String {
        compose_material(&self.material_base, self.material_modifier.as_deref())
    }

    /// Exact match on vendor, normalized material and normalized color.
    ///
    /// Spoolman keeps a single `material` string, so base and modifier
    /// are compared composed: base "PETG CF" without a modifier matches a
    /// filament stored from base "PETG" plus modifier "CF".
    pub fn matches(&self, filament: &Filament) -> bool {
        let vendor_matches = filament.vendor.as_ref().map(|v| v.id) == Some(self.vendor_id);
        let material_matches = filament
            .material
            .as_deref()
            .map(normalize_token)
            == Some(normalize_token(&self.material()));
        let color_matches = filament.color_hex.as_deref().map(normalize_color)
            == self.color_hex.as_deref().map(normalize_color);
        vendor_matches && material_matches && color_matches
    }
}

pub fn compose_material(base: &str, modifier: Option<&str>) -> String {
    match modifier.map(str::trim).filter(|m| !m.is_empty()) {
        Some(modifier) => format!("{} {}", base.trim(), modifier),
        None => base.trim().to_string(),
    }
}

/// Upper-case hex digits without '#'. Empty means "no color".
pub fn normalize_color(hex: &str) -> String {
    normalize_token(hex.trim().trim_start_matches('#'))
}

/// Lookup-or-create operations the reconciler needs.
///
/// Every failure is a [`RepositoryError`]; the reconciler reports all of
/// them as the repository being unavailable.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn find_spool_by_nfc_id(&self, nfc_id: &NfcId) -> Result<Option<Spool>, RepositoryError>;

    async fn get_spool(&self, spool_id: u32) -> Result<Option<Spool>, RepositoryError>;

    /// Case-insensitive name match.
    async fn find_vendor_by_name(&self, name: &str) -> Result<Option<Vendor>, RepositoryError>;

    async fn create_vendor(&self, fields: &Map<String, Value>) -> Result<Vendor, RepositoryError>;

    async fn find_filament(&self, query: &FilamentQuery) -> Result<Option<Filament>, RepositoryError>;

    async fn create_filament(&self, fields: &Map<String, Value>) -> Result<Filament, RepositoryError>;

    /// Create a spool of `filament_id` with `nfc_id` recorded in its
    /// lookup field.
    async fn create_spool(
        &self,
        filament_id: u32,
        nfc_id: &NfcId,
        fields: &Map<String, Value>,
    ) -> Result<Spool, RepositoryError>;
}

/// Manual binding of a hardware identifier to an existing spool.
#[async_trait]
pub trait NfcBinder: Send + Sync {
    /// Every spool, for picking one to bind.
    async fn list_spools(&self) -> Result<Vec<Spool>, RepositoryError>;

    /// Bind `nfc_id` to `spool_id` and clear it from every other spool.
    /// Returns false if the spool does not exist.
    async fn bind_nfc_id(&self, spool_id: u32, nfc_id: &NfcId) -> Result<bool, RepositoryError>;
}
