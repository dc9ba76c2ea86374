//! In-process repository with a call log and failure injection.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::{compose_material, normalize_color, Filament, FilamentQuery, NfcBinder, Repository, Spool, Vendor, NFC_ID_EXTRA};
use crate::error::RepositoryError;
use crate::tag::NfcId;

/// One repository call, recorded in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryCall {
    FindSpoolByNfcId(String),
    GetSpool(u32),
    FindVendorByName(String),
    CreateVendor(String),
    FindFilament(u32),
    CreateFilament(u32),
    CreateSpool { filament_id: u32, nfc_id: String },
    BindNfcId { spool_id: u32, nfc_id: String },
    ListSpools,
}

impl RepositoryCall {
    pub fn operation(&self) -> &'static str {
        match self {
            RepositoryCall::FindSpoolByNfcId(_) => "find_spool_by_nfc_id",
            RepositoryCall::GetSpool(_) => "get_spool",
            RepositoryCall::FindVendorByName(_) => "find_vendor_by_name",
            RepositoryCall::CreateVendor(_) => "create_vendor",
            RepositoryCall::FindFilament(_) => "find_filament",
            RepositoryCall::CreateFilament(_) => "create_filament",
            RepositoryCall::CreateSpool { .. } => "create_spool",
            RepositoryCall::BindNfcId { .. } => "bind_nfc_id",
            RepositoryCall::ListSpools => "list_spools",
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(
            self,
            RepositoryCall::CreateVendor(_)
                | RepositoryCall::CreateFilament(_)
                | RepositoryCall::CreateSpool { .. }
        )
    }
}

#[derive(Default)]
struct State {
    vendors: Vec<Vendor>,
    filaments: Vec<Filament>,
    spools: Vec<Spool>,
    next_vendor_id: u32,
    next_filament_id: u32,
    next_spool_id: u32,
    calls: Vec<RepositoryCall>,
    failing: HashSet<&'static str>,
}

impl State {
    // Each table numbers its rows from 1.
    fn allocate(counter: &mut u32) -> u32 {
        *counter += 1;
        *counter
    }

    /// Log the call, then fail it if injection says so.
    fn record(&mut self, call: RepositoryCall) -> Result<(), RepositoryError> {
        let operation = call.operation();
        self.calls.push(call);
        if self.failing.contains(operation) || self.failing.contains("*") {
            return Err(RepositoryError::Unavailable(format!(
                "injected failure in {}",
                operation
            )));
        }
        Ok(())
    }

    fn vendor(&self, id: u32) -> Option<Vendor> {
        self.vendors.iter().find(|v| v.id == id).cloned()
    }

    fn filament(&self, id: u32) -> Option<Filament> {
        self.filaments.iter().find(|f| f.id == id).cloned()
    }
}

/// Repository kept entirely in memory.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// A small sample inventory for dry runs.
    pub fn demo() -> Self {
        let repo = Self::new();
        let mcgreedy = repo.add_vendor("McGreedy");
        let flaky = repo.add_vendor("Flaky Inc");
        let late = repo.add_vendor("Too Late Company");
        let red = repo.add_filament(mcgreedy.id, "PLA Red", "PLA", Some("FF0000"));
        let blue = repo.add_filament(flaky.id, "PETG Blue", "PETG", Some("0000FF"));
        let black = repo.add_filament(late.id, "ABS Black", "ABS", Some("000000"));
        repo.add_spool(red.id, None);
        repo.add_spool(blue.id, None);
        repo.add_spool(black.id, None);
        repo
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // === Seeding (not logged) ===

    pub fn add_vendor(&self, name: &str) -> Vendor {
        let mut state = self.state();
        let vendor = Vendor {
            id: State::allocate(&mut state.next_vendor_id),
            name: name.to_string(),
            empty_spool_weight: None,
        };
        state.vendors.push(vendor.clone());
        vendor
    }

    pub fn add_filament(
        &self,
        vendor_id: u32,
        name: &str,
        material: &str,
        color_hex: Option<&str>,
    ) -> Filament {
        let mut state = self.state();
        let filament = Filament {
            id: State::allocate(&mut state.next_filament_id),
            name: Some(name.to_string()),
            vendor: state.vendor(vendor_id),
            material: Some(material.to_string()),
            color_hex: color_hex.map(str::to_string),
        };
        state.filaments.push(filament.clone());
        filament
    }

    pub fn add_spool(&self, filament_id: u32, nfc_id: Option<&NfcId>) -> Spool {
        let mut state = self.state();
        let id = State::allocate(&mut state.next_spool_id);
        let filament = state.filament(filament_id).unwrap_or(Filament {
            id: filament_id,
            name: None,
            vendor: None,
            material: None,
            color_hex: None,
        });
        let mut extra = Map::new();
        if let Some(nfc_id) = nfc_id {
            extra.insert(NFC_ID_EXTRA.to_string(), encoded_nfc_id(nfc_id.as_str()));
        }
        let spool = Spool { id, filament, extra };
        state.spools.push(spool.clone());
        spool
    }

    // === Inspection ===

    pub fn vendors(&self) -> Vec<Vendor> {
        self.state().vendors.clone()
    }

    pub fn filaments(&self) -> Vec<Filament> {
        self.state().filaments.clone()
    }

    pub fn spools(&self) -> Vec<Spool> {
        self.state().spools.clone()
    }

    pub fn calls(&self) -> Vec<RepositoryCall> {
        self.state().calls.clone()
    }

    pub fn creates(&self) -> Vec<RepositoryCall> {
        self.calls().into_iter().filter(RepositoryCall::is_create).collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    // === Failure injection ===

    /// Make every call to `operation` fail; `"*"` fails everything.
    pub fn fail_on(&self, operation: &'static str) {
        self.state().failing.insert(operation);
    }

    pub fn heal(&self) {
        self.state().failing.clear();
    }
}

fn encoded_nfc_id(nfc_id: &str) -> Value {
    Value::String(Value::String(nfc_id.to_string()).to_string())
}

fn text_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields.get(key).and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_spool_by_nfc_id(&self, nfc_id: &NfcId) -> Result<Option<Spool>, RepositoryError> {
        let mut state = self.state();
        state.record(RepositoryCall::FindSpoolByNfcId(nfc_id.to_string()))?;
        Ok(state.spools.iter().find(|s| s.is_bound_to(nfc_id)).cloned())
    }

    async fn get_spool(&self, spool_id: u32) -> Result<Option<Spool>, RepositoryError> {
        let mut state = self.state();
        state.record(RepositoryCall::GetSpool(spool_id))?;
        Ok(state.spools.iter().find(|s| s.id == spool_id).cloned())
    }

    async fn find_vendor_by_name(&self, name: &str) -> Result<Option<Vendor>, RepositoryError> {
        let mut state = self.state();
        state.record(RepositoryCall::FindVendorByName(name.to_string()))?;
        let wanted = name.trim().to_lowercase();
        Ok(state
            .vendors
            .iter()
            .find(|v| v.name.trim().to_lowercase() == wanted)
            .cloned())
    }

    async fn create_vendor(&self, fields: &Map<String, Value>) -> Result<Vendor, RepositoryError> {
        let mut state = self.state();
        let name = text_field(fields, "name").unwrap_or_default();
        state.record(RepositoryCall::CreateVendor(name.clone()))?;
        let vendor = Vendor {
            id: State::allocate(&mut state.next_vendor_id),
            name,
            empty_spool_weight: fields.get("empty_spool_weight").and_then(Value::as_f64),
        };
        debug!(id = vendor.id, name = %vendor.name, "Created vendor in memory");
        state.vendors.push(vendor.clone());
        Ok(vendor)
    }

    async fn find_filament(&self, query: &FilamentQuery) -> Result<Option<Filament>, RepositoryError> {
        let mut state = self.state();
        state.record(RepositoryCall::FindFilament(query.vendor_id))?;
        Ok(state.filaments.iter().find(|f| query.matches(f)).cloned())
    }

    async fn create_filament(&self, fields: &Map<String, Value>) -> Result<Filament, RepositoryError> {
        let mut state = self.state();
        let vendor_id = fields
            .get("vendor_id")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
            .unwrap_or_default();
        state.record(RepositoryCall::CreateFilament(vendor_id))?;

        let material = text_field(fields, "material")
            .map(|m| compose_material(&m, None));
        let filament = Filament {
            id: State::allocate(&mut state.next_filament_id),
            name: text_field(fields, "name"),
            vendor: state.vendor(vendor_id),
            material,
            color_hex: text_field(fields, "color_hex").map(|c| normalize_color(&c)),
        };
        debug!(id = filament.id, vendor_id, "Created filament in memory");
        state.filaments.push(filament.clone());
        Ok(filament)
    }

    async fn create_spool(
        &self,
        filament_id: u32,
        nfc_id: &NfcId,
        fields: &Map<String, Value>,
    ) -> Result<Spool, RepositoryError> {
        let mut state = self.state();
        state.record(RepositoryCall::CreateSpool {
            filament_id,
            nfc_id: nfc_id.to_string(),
        })?;

        let mut extra = fields
            .get("extra")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        extra.insert(NFC_ID_EXTRA.to_string(), encoded_nfc_id(nfc_id.as_str()));

        let filament = state.filament(filament_id).ok_or_else(|| {
            RepositoryError::Unavailable(format!("filament {} does not exist", filament_id))
        })?;
        let spool = Spool {
            id: State::allocate(&mut state.next_spool_id),
            filament,
            extra,
        };
        debug!(id = spool.id, filament_id, %nfc_id, "Created spool in memory");
        state.spools.push(spool.clone());
        Ok(spool)
    }
}

#[async_trait]
impl NfcBinder for MemoryRepository {
    async fn list_spools(&self) -> Result<Vec<Spool>, RepositoryError> {
        let mut state = self.state();
        state.record(RepositoryCall::ListSpools)?;
        Ok(state.spools.clone())
    }

    async fn bind_nfc_id(&self, spool_id: u32, nfc_id: &NfcId) -> Result<bool, RepositoryError> {
        let mut state = self.state();
        state.record(RepositoryCall::BindNfcId {
            spool_id,
            nfc_id: nfc_id.to_string(),
        })?;
        if !state.spools.iter().any(|s| s.id == spool_id) {
            return Ok(false);
        }
        for spool in state.spools.iter_mut() {
            if spool.id == spool_id {
                spool
                    .extra
                    .insert(NFC_ID_EXTRA.to_string(), encoded_nfc_id(nfc_id.as_str()));
            } else if spool.is_bound_to(nfc_id) {
                spool
                    .extra
                    .insert(NFC_ID_EXTRA.to_string(), encoded_nfc_id(""));
            }
        }
        Ok(true)
    }
}
