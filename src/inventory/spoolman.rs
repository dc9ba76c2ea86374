use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{Filament, FilamentQuery, NfcBinder, Repository, Spool, Vendor, NFC_ID_EXTRA};
use crate::error::RepositoryError;
use crate::tag::NfcId;

const USER_AGENT: &str = concat!("spooltag/", env!("CARGO_PKG_VERSION"));

/// Repository backed by a Spoolman server's REST API.
#[derive(Debug, Clone)]
pub struct SpoolmanClient {
    client: reqwest::Client,
    base_url: String,
}

impl SpoolmanClient {
    /// Create a client for the server at `base_url`
    /// (e.g. `http://localhost:7912`). Requests time out after `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RepositoryError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| RepositoryError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    /// GET a JSON document; 404 maps to `None`.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, RepositoryError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| RepositoryError::Http {
                url: url.to_string(),
                source,
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        read_json(url, response).await.map(Some)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: &Value,
    ) -> Result<T, RepositoryError> {
        debug!("{} {}", method, url);
        let response = self
            .client
            .request(method, url)
            .json(body)
            .send()
            .await
            .map_err(|source| RepositoryError::Http {
                url: url.to_string(),
                source,
            })?;
        read_json(url, response).await
    }

    async fn all_spools(&self) -> Result<Vec<Spool>, RepositoryError> {
        let url = self.endpoint("spool");
        Ok(self.get_json(&url).await?.unwrap_or_default())
    }

    /// Spoolman replaces `extra` as a whole, so the spool's other extra
    /// fields are sent back alongside the new identifier.
    async fn patch_nfc_id(&self, spool: &Spool, nfc_id: &str) -> Result<(), RepositoryError> {
        let url = self.endpoint(&format!("spool/{}", spool.id));
        let mut extra = spool.extra.clone();
        extra.insert(NFC_ID_EXTRA.to_string(), encode_extra_value(&Value::from(nfc_id)));
        let body = json!({ "extra": extra });
        let _: Value = self.send_json(reqwest::Method::PATCH, &url, &body).await?;
        Ok(())
    }
}

async fn read_json<T: DeserializeOwned>(
    url: &str,
    response: reqwest::Response,
) -> Result<T, RepositoryError> {
    let status = response.status();
    if !status.is_success() {
        return Err(RepositoryError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| RepositoryError::InvalidResponse {
            url: url.to_string(),
            reason: e.to_string(),
        })
}

/// Spoolman stores every `extra` value as a JSON-encoded string.
fn encode_extra_value(value: &Value) -> Value {
    Value::String(value.to_string())
}

/// Copy of `fields` with its `extra` values encoded for Spoolman.
fn with_encoded_extra(fields: &Map<String, Value>) -> Map<String, Value> {
    let mut body = fields.clone();
    if let Some(Value::Object(extra)) = body.get_mut("extra") {
        for value in extra.values_mut() {
            *value = encode_extra_value(value);
        }
    }
    body
}

#[async_trait]
impl Repository for SpoolmanClient {
    async fn find_spool_by_nfc_id(&self, nfc_id: &NfcId) -> Result<Option<Spool>, RepositoryError> {
        let spools = self.all_spools().await?;
        debug!(count = spools.len(), %nfc_id, "Searching spools for nfc_id");
        Ok(spools.into_iter().find(|spool| spool.is_bound_to(nfc_id)))
    }

    async fn get_spool(&self, spool_id: u32) -> Result<Option<Spool>, RepositoryError> {
        let url = self.endpoint(&format!("spool/{}", spool_id));
        self.get_json(&url).await
    }

    async fn find_vendor_by_name(&self, name: &str) -> Result<Option<Vendor>, RepositoryError> {
        let url = self.endpoint(&format!("vendor?name={}", urlencoding::encode(name)));
        let vendors: Vec<Vendor> = self.get_json(&url).await?.unwrap_or_default();
        // The server filter is a substring match; keep exact names only.
        let wanted = name.trim().to_lowercase();
        Ok(vendors
            .into_iter()
            .find(|vendor| vendor.name.trim().to_lowercase() == wanted))
    }

    async fn create_vendor(&self, fields: &Map<String, Value>) -> Result<Vendor, RepositoryError> {
        let url = self.endpoint("vendor");
        let vendor: Vendor = self
            .send_json(reqwest::Method::POST, &url, &Value::Object(with_encoded_extra(fields)))
            .await?;
        info!(id = vendor.id, name = %vendor.name, "Created vendor in Spoolman");
        Ok(vendor)
    }

    async fn find_filament(&self, query: &FilamentQuery) -> Result<Option<Filament>, RepositoryError> {
        let url = self.endpoint(&format!("filament?vendor.id={}", query.vendor_id));
        let filaments: Vec<Filament> = self.get_json(&url).await?.unwrap_or_default();
        Ok(filaments.into_iter().find(|filament| query.matches(filament)))
    }

    async fn create_filament(&self, fields: &Map<String, Value>) -> Result<Filament, RepositoryError> {
        let url = self.endpoint("filament");
        let filament: Filament = self
            .send_json(reqwest::Method::POST, &url, &Value::Object(with_encoded_extra(fields)))
            .await?;
        info!(id = filament.id, name = ?filament.name, "Created filament in Spoolman");
        Ok(filament)
    }

    async fn create_spool(
        &self,
        filament_id: u32,
        nfc_id: &NfcId,
        fields: &Map<String, Value>,
    ) -> Result<Spool, RepositoryError> {
        let mut body = fields.clone();
        body.insert("filament_id".to_string(), Value::from(filament_id));
        let extra = body
            .entry("extra")
            .or_insert_with(|| Value::Object(Map::new()));
        if !extra.is_object() {
            *extra = Value::Object(Map::new());
        }
        if let Value::Object(extra) = extra {
            extra.insert(NFC_ID_EXTRA.to_string(), Value::from(nfc_id.as_str()));
        }

        let url = self.endpoint("spool");
        let spool: Spool = self
            .send_json(reqwest::Method::POST, &url, &Value::Object(with_encoded_extra(&body)))
            .await?;
        info!(id = spool.id, filament_id, %nfc_id, "Created spool in Spoolman");
        Ok(spool)
    }
}

#[async_trait]
impl NfcBinder for SpoolmanClient {
    async fn list_spools(&self) -> Result<Vec<Spool>, RepositoryError> {
        self.all_spools().await
    }

    async fn bind_nfc_id(&self, spool_id: u32, nfc_id: &NfcId) -> Result<bool, RepositoryError> {
        let Some(target) = self.get_spool(spool_id).await? else {
            return Ok(false);
        };

        for spool in self.all_spools().await? {
            if spool.id != spool_id && spool.is_bound_to(nfc_id) {
                info!(spool_id = spool.id, %nfc_id, "Clearing nfc_id from previous spool");
                self.patch_nfc_id(&spool, "").await?;
            }
        }

        self.patch_nfc_id(&target, nfc_id.as_str()).await?;
        info!(spool_id, %nfc_id, "Bound nfc_id to spool");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let client = SpoolmanClient::new("http://spoolman.lan:7912/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://spoolman.lan:7912");
        assert_eq!(client.endpoint("spool/3"), "http://spoolman.lan:7912/api/v1/spool/3");
    }

    #[test]
    fn test_extra_values_are_json_encoded() {
        let fields = json!({
            "name": "x",
            "extra": {"nfc_id": "aa:bb", "count": 3}
        });
        let encoded = with_encoded_extra(fields.as_object().unwrap());
        assert_eq!(encoded["extra"]["nfc_id"], json!("\"aa:bb\""));
        assert_eq!(encoded["extra"]["count"], json!("3"));
        assert_eq!(encoded["name"], json!("x"));
    }
}
