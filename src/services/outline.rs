//! Key-management API client
//!
//! Creates and deletes access keys on a host's Outline-compatible management
//! API. The client does not retry or deduplicate; that is left to callers.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::hosts::Host;
use crate::types::{KeygateError, Result};

/// Connection parameters issued by a host for one access key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyData {
    pub access_url: String,
    pub key_id: String,
    pub port: u16,
    pub password: String,
    pub method: String,
}

/// Remote key management
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Create a key named `client_name` on `host`
    async fn create_key(&self, host: &Host, client_name: &str) -> Result<AccessKeyData>;

    /// Delete a key. True only when the host confirmed with 204.
    async fn delete_key(&self, host: &Host, key_id: &str) -> bool;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyResponse {
    access_url: Option<String>,
    id: Option<Value>,
    port: Option<Value>,
    password: Option<String>,
    method: Option<String>,
}

impl CreateKeyResponse {
    fn into_key_data(self) -> Result<AccessKeyData> {
        let missing = |field: &str| KeygateError::MalformedResponse(format!("missing {}", field));

        let access_url = self.access_url.ok_or_else(|| missing("accessUrl"))?;
        let key_id = match self.id.ok_or_else(|| missing("id"))? {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            other => {
                return Err(KeygateError::MalformedResponse(format!(
                    "unexpected id {}",
                    other
                )))
            }
        };
        let port = match self.port.ok_or_else(|| missing("port"))? {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(s) => s.parse::<u16>().ok(),
            _ => None,
        }
        .ok_or_else(|| KeygateError::MalformedResponse("port out of range".into()))?;

        Ok(AccessKeyData {
            access_url,
            key_id,
            port,
            password: self.password.ok_or_else(|| missing("password"))?,
            method: self.method.ok_or_else(|| missing("method"))?,
        })
    }
}

/// reqwest implementation of [`KeyManager`]
///
/// Hosts serve self-signed certificates, so certificate validation is off.
#[derive(Clone)]
pub struct OutlineClient {
    http_client: reqwest::Client,
}

impl OutlineClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .user_agent(concat!("keygate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| KeygateError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl KeyManager for OutlineClient {
    async fn create_key(&self, host: &Host, client_name: &str) -> Result<AccessKeyData> {
        let url = format!("{}/access-keys", host.api_base());

        let response = self
            .http_client
            .post(&url)
            .json(&serde_json::json!({ "name": client_name }))
            .send()
            .await
            .map_err(|e| {
                warn!(host = %host.host, error = %e, "Create key request failed");
                KeygateError::Network(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(host = %host.host, status = status.as_u16(), "Host rejected create key");
            return Err(KeygateError::RemoteRejected(status.as_u16()));
        }

        let body: CreateKeyResponse = response.json().await.map_err(|e| {
            if e.is_decode() {
                KeygateError::MalformedResponse(e.to_string())
            } else {
                KeygateError::Network(e.to_string())
            }
        })?;

        let key = body.into_key_data().inspect_err(|e| {
            warn!(host = %host.host, error = %e, "Unusable create key response");
        })?;

        debug!(host = %host.host, key_id = %key.key_id, "Access key created");
        Ok(key)
    }

    async fn delete_key(&self, host: &Host, key_id: &str) -> bool {
        let url = format!("{}/access-keys/{}", host.api_base(), key_id);

        match self.http_client.delete(&url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::NO_CONTENT => {
                debug!(host = %host.host, key_id = %key_id, "Access key deleted");
                true
            }
            Ok(response) => {
                warn!(
                    host = %host.host,
                    key_id = %key_id,
                    status = response.status().as_u16(),
                    "Host did not confirm key deletion"
                );
                false
            }
            Err(e) => {
                warn!(host = %host.host, key_id = %key_id, error = %e, "Delete key request failed");
                false
            }
        }
    }
}
