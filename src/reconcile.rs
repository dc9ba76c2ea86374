//! Reconciliation: bind a decoded tag to inventory entities.
//!
//! - **Reference** (`SPOOL:`/`FILAMENT:` text): the spool must exist; it is
//!   never created.
//! - **Identifier only**: the spool bound to the hardware identifier must
//!   exist.
//! - **Descriptor** (binary record): a spool already bound to the hardware
//!   identifier wins unchanged. Otherwise vendor, filament and spool are
//!   looked up or created, in that order.
//!
//! Nothing is rolled back. If spool creation fails after a filament was
//! created, the filament stays and the scan reports failure.

use std::f64::consts::PI;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{DecodeError, ReconcileError, SpoolLookup};
use crate::inventory::{compose_material, normalize_color, FilamentQuery, Repository, Spool};
use crate::mapping::MappedFields;
use crate::sniffer::DecodedTag;
use crate::tag::fields::*;
use crate::tag::{Descriptor, FieldMap, NfcId, NormalizedFields, SpoolReference};

const DEFAULT_DIAMETER_MM: f64 = 1.75;
const DEFAULT_DENSITY: f64 = 1.24;
/// Hottest extruder or bed setting a tag may carry.
const MAX_TEMP_C: u64 = 500;

/// The spool and filament a scan resolved to. Both exist in the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedSpoolIdentity {
    pub spool_id: u32,
    pub filament_id: u32,
}

impl From<&Spool> for ResolvedSpoolIdentity {
    fn from(spool: &Spool) -> Self {
        Self {
            spool_id: spool.id,
            filament_id: spool.filament.id,
        }
    }
}

pub struct Reconciler {
    repository: Arc<dyn Repository>,
}

impl Reconciler {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    pub async fn reconcile(
        &self,
        tag: &DecodedTag,
        mapped: &MappedFields,
    ) -> Result<ResolvedSpoolIdentity, ReconcileError> {
        match tag {
            DecodedTag::Fields(NormalizedFields::Reference(reference)) => {
                self.resolve_reference(reference).await
            }
            DecodedTag::Fields(NormalizedFields::Descriptor(descriptor)) => {
                self.resolve_descriptor(descriptor, mapped).await
            }
            DecodedTag::Identifier(nfc_id) => self.resolve_identifier(nfc_id).await,
        }
    }

    async fn resolve_reference(
        &self,
        reference: &SpoolReference,
    ) -> Result<ResolvedSpoolIdentity, ReconcileError> {
        let spool = self
            .repository
            .get_spool(reference.spool_id)
            .await?
            .ok_or(ReconcileError::SpoolNotFound(SpoolLookup::Id(reference.spool_id)))?;

        let filament_id = reference.filament_id.unwrap_or(spool.filament.id);
        info!(spool_id = spool.id, filament_id, "Resolved spool reference");
        Ok(ResolvedSpoolIdentity {
            spool_id: reference.spool_id,
            filament_id,
        })
    }

    async fn resolve_identifier(&self, nfc_id: &NfcId) -> Result<ResolvedSpoolIdentity, ReconcileError> {
        let spool = self
            .repository
            .find_spool_by_nfc_id(nfc_id)
            .await?
            .ok_or_else(|| ReconcileError::SpoolNotFound(SpoolLookup::Nfc(nfc_id.clone())))?;
        info!(%nfc_id, spool_id = spool.id, "Resolved hardware identifier");
        Ok(ResolvedSpoolIdentity::from(&spool))
    }

    async fn resolve_descriptor(
        &self,
        descriptor: &Descriptor,
        mapped: &MappedFields,
    ) -> Result<ResolvedSpoolIdentity, ReconcileError> {
        let nfc_id = &descriptor.nfc_id;

        // An existing binding is authoritative, whatever the tag says now.
        if let Some(spool) = self.repository.find_spool_by_nfc_id(nfc_id).await? {
            info!(%nfc_id, spool_id = spool.id, "Tag already bound to a spool");
            return Ok(ResolvedSpoolIdentity::from(&spool));
        }

        let seed = Seed::build(&descriptor.fields, mapped).map_err(ReconcileError::IncompleteDescriptor)?;

        let vendor = match self.repository.find_vendor_by_name(&seed.vendor_name).await? {
            Some(vendor) => {
                debug!(id = vendor.id, name = %vendor.name, "Reusing vendor");
                vendor
            }
            None => {
                info!(name = %seed.vendor_name, "Creating vendor");
                self.repository.create_vendor(&seed.vendor).await?
            }
        };

        let query = seed.query(vendor.id);
        let filament = match self.repository.find_filament(&query).await? {
            Some(filament) => {
                debug!(id = filament.id, "Reusing filament");
                filament
            }
            None => {
                info!(vendor_id = vendor.id, material = %query.material(), "Creating filament");
                self.repository
                    .create_filament(&seed.filament_fields(vendor.id))
                    .await?
            }
        };

        let spool = self
            .repository
            .create_spool(filament.id, nfc_id, &seed.spool)
            .await?;
        info!(%nfc_id, spool_id = spool.id, filament_id = filament.id, "Created spool for tag");

        Ok(ResolvedSpoolIdentity {
            spool_id: spool.id,
            filament_id: filament.id,
        })
    }
}

/// Everything needed to find or create the three entities, computed
/// once the tag is known to be unbound.
#[derive(Debug, Clone, PartialEq)]
pub struct Seed {
    pub vendor_name: String,
    pub material_base: String,
    pub material_modifier: Option<String>,
    pub color_hex: Option<String>,
    pub vendor: Map<String, Value>,
    /// Filament fields without `vendor_id`
    pub filament: Map<String, Value>,
    pub spool: Map<String, Value>,
}

impl Seed {
    /// Build records from tag fields, overlay mapped fields, then fill
    /// defaults where nothing was set.
    pub fn build(fields: &FieldMap, mapped: &MappedFields) -> Result<Seed, DecodeError> {
        let vendor_name = required_text(fields, VENDOR_NAME)?;
        let material_base = required_text(fields, MATERIAL_BASE)?;
        let material_modifier = optional_text(fields, MATERIAL_MODIFIER);
        let color_hex = fields
            .text(COLOR_HEX)
            .map(normalize_color)
            .filter(|c| !c.is_empty());
        let material = compose_material(&material_base, material_modifier.as_deref());
        let diameter_mm = fields.int(FILAMENT_DIAMETER).map(|um| um as f64 / 1000.0);

        // === vendor ===
        let mut vendor = Map::new();
        vendor.insert("name".into(), Value::from(vendor_name.clone()));
        if let Some(weight) = fields.int(SPOOL_WEIGHT) {
            vendor.insert("empty_spool_weight".into(), Value::from(weight as f64));
        }
        overlay(&mut vendor, &mapped.vendor);

        // === filament ===
        let mut filament = Map::new();
        filament.insert("material".into(), Value::from(material.clone()));
        if let Some(color) = &color_hex {
            filament.insert("color_hex".into(), Value::from(color.clone()));
        }
        if let Some(colors) = fields.text(SECONDARY_COLORS) {
            let hexes: Vec<String> = colors.split(',').map(normalize_color).collect();
            filament.insert("multi_color_hexes".into(), Value::from(hexes.join(",")));
        }
        if let Some(diameter) = diameter_mm {
            filament.insert("diameter".into(), Value::from(diameter));
        }
        if let Some(density) = fields.int(DENSITY) {
            filament.insert("density".into(), Value::from(density as f64 / 1000.0));
        }
        if let Some(weight) = fields.int(NOMINAL_WEIGHT) {
            filament.insert("weight".into(), Value::from(weight as f64));
        }
        if let Some(weight) = fields.int(SPOOL_WEIGHT) {
            filament.insert("spool_weight".into(), Value::from(weight as f64));
        }
        if let Some(gtin) = fields.int(GTIN) {
            filament.insert("article_number".into(), Value::from(gtin.to_string()));
        }
        if let Some(temp) = average_temp(fields, PRINT_TEMP_MIN, PRINT_TEMP_MAX, PRINT_TEMP)? {
            filament.insert("settings_extruder_temp".into(), Value::from(temp));
        }
        if let Some(temp) = average_temp(fields, BED_TEMP_MIN, BED_TEMP_MAX, BED_TEMP)? {
            filament.insert("settings_bed_temp".into(), Value::from(temp));
        }
        overlay(&mut filament, &mapped.filament);

        let default_name = optional_text(fields, MATERIAL_NAME).unwrap_or_else(|| material.clone());
        fill_default(&mut filament, "name", Value::from(default_name));
        fill_default(&mut filament, "diameter", Value::from(DEFAULT_DIAMETER_MM));
        let density = computed_density(fields, diameter_mm).unwrap_or(DEFAULT_DENSITY);
        fill_default(&mut filament, "density", Value::from(density));

        // === spool ===
        let mut spool = Map::new();
        if let Some(weight) = fields.int(ACTUAL_WEIGHT).or_else(|| fields.int(NOMINAL_WEIGHT)) {
            spool.insert("initial_weight".into(), Value::from(weight as f64));
            spool.insert("remaining_weight".into(), Value::from(weight as f64));
        }
        overlay(&mut spool, &mapped.spool);

        Ok(Seed {
            vendor_name,
            material_base,
            material_modifier,
            color_hex,
            vendor,
            filament,
            spool,
        })
    }

    pub fn query(&self, vendor_id: u32) -> FilamentQuery {
        FilamentQuery {
            vendor_id,
            material_base: self.material_base.clone(),
            material_modifier: self.material_modifier.clone(),
            color_hex: self.color_hex.clone(),
        }
    }

    /// Filament fields referencing `vendor_id`, which always wins over a
    /// mapped value.
    pub fn filament_fields(&self, vendor_id: u32) -> Map<String, Value> {
        let mut fields = self.filament.clone();
        fields.insert("vendor_id".into(), Value::from(vendor_id));
        fields
    }
}

fn required_text(fields: &FieldMap, name: &str) -> Result<String, DecodeError> {
    optional_text(fields, name).ok_or_else(|| {
        DecodeError::malformed(name, "required to find or create inventory entries")
    })
}

fn optional_text(fields: &FieldMap, name: &str) -> Option<String> {
    fields
        .text(name)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Mean of min and max, either one alone, or the single-value field.
fn average_temp(
    fields: &FieldMap,
    min: &str,
    max: &str,
    single: &str,
) -> Result<Option<u64>, DecodeError> {
    let lo = temperature(fields, min)?;
    let hi = temperature(fields, max)?;
    Ok(match (lo, hi) {
        (Some(lo), Some(hi)) => Some(lo / 2 + hi / 2 + (lo % 2 + hi % 2) / 2),
        (Some(t), None) | (None, Some(t)) => Some(t),
        (None, None) => temperature(fields, single)?,
    })
}

fn temperature(fields: &FieldMap, name: &str) -> Result<Option<u64>, DecodeError> {
    match fields.int(name) {
        Some(t) if t > MAX_TEMP_C => Err(DecodeError::malformed(
            name,
            format!("{} °C is above the {} °C limit", t, MAX_TEMP_C),
        )),
        t => Ok(t),
    }
}

/// g/cm³ from net weight (g), length (mm) and diameter (mm).
fn computed_density(fields: &FieldMap, diameter_mm: Option<f64>) -> Option<f64> {
    let weight = fields.int(ACTUAL_WEIGHT)? as f64;
    let length_cm = fields.int(FILAMENT_LENGTH)? as f64 / 10.0;
    let radius_cm = diameter_mm? / 20.0;
    let volume = length_cm * radius_cm * radius_cm * PI;
    if volume <= 0.0 {
        return None;
    }
    Some((weight / volume * 1000.0).round() / 1000.0)
}

/// Mapped values replace base values; nested `extra` objects merge.
fn overlay(base: &mut Map<String, Value>, mapped: &Map<String, Value>) {
    for (key, value) in mapped {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                for (k, v) in incoming {
                    existing.insert(k.clone(), v.clone());
                }
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn fill_default(map: &mut Map<String, Value>, key: &str, value: Value) {
    if !map.contains_key(key) {
        map.insert(key.to_string(), value);
    }
}
