//! Device lookup against the LoRaWAN network server's internal search API

use crate::config::NetworkServerConfig;
use crate::error::ResolveError;
use crate::session::Session;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

/// Where to send a downlink for one meter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub application_id: String,
    pub device_eui: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<SearchResult>,
}

/// One hit from `/internal/search`; non-device hits leave the device fields out
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResult {
    #[serde(default)]
    kind: Option<String>,
    /// int64 ids arrive as JSON strings, but accept plain numbers too
    #[serde(rename = "applicationID", default)]
    application_id: Option<serde_json::Value>,
    #[serde(rename = "deviceDevEUI", default)]
    device_dev_eui: Option<String>,
}

impl SearchResult {
    fn into_identity(self) -> Option<DeviceIdentity> {
        let application_id = match self.application_id? {
            serde_json::Value::String(id) if !id.trim().is_empty() => id,
            serde_json::Value::Number(id) => id.to_string(),
            _ => return None,
        };
        let device_eui = self.device_dev_eui.filter(|eui| is_eui(eui))?;
        Some(DeviceIdentity {
            application_id,
            device_eui,
        })
    }
}

/// 64-bit EUI as 16 hex digits
fn is_eui(value: &str) -> bool {
    value.len() == 16 && hex::decode(value).is_ok()
}

pub struct NetworkServerClient {
    http: Client,
    config: NetworkServerConfig,
}

impl NetworkServerClient {
    pub fn new(http: Client, config: NetworkServerConfig) -> Self {
        Self { http, config }
    }

    /// Find the device registered for `entity_id`
    ///
    /// Takes the first hit as returned by the server. A first hit that is
    /// not a usable device (no application or EUI) counts as no match.
    pub async fn resolve(
        &self,
        session: &Session,
        entity_id: &str,
    ) -> Result<Option<DeviceIdentity>, ResolveError> {
        let url = format!("{}/internal/search", self.config.base_url);
        let limit = self.config.search_limit.to_string();

        let resp = self
            .http
            .get(&url)
            .bearer_auth(session.network_token.as_str())
            .query(&[("search", entity_id), ("limit", limit.as_str())])
            .send()
            .await
            .map_err(|source| ResolveError::Transport {
                entity: entity_id.to_string(),
                source,
            })?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ResolveError::AuthExpired);
        }
        if !status.is_success() {
            return Err(ResolveError::Status {
                entity: entity_id.to_string(),
                status,
            });
        }

        let body: SearchResponse = resp.json().await.map_err(|source| ResolveError::Decode {
            entity: entity_id.to_string(),
            source,
        })?;

        debug!("Search for {} returned {} hit(s)", entity_id, body.result.len());

        let Some(first) = body.result.into_iter().next() else {
            return Ok(None);
        };

        let kind = first.kind.clone();
        let identity = first.into_identity();
        if identity.is_none() {
            warn!(
                "First search hit for {} is not a usable device (kind: {})",
                entity_id,
                kind.as_deref().unwrap_or("unknown")
            );
        }
        Ok(identity)
    }
}
