//! HashiCorp Vault secret engine.
//!
//! Reads a logical path over the HTTP API, handling both KV v1
//! (`data` is the secret map) and KV v2 (`data.data`) response shapes.
//! Client settings come from the standard `VAULT_ADDR` / `VAULT_TOKEN`
//! environment.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::{SecretError, SecretStore};

/// Environment variable naming the Vault address.
pub const ENV_VAULT_ADDR: &str = "VAULT_ADDR";

/// Environment variable carrying the Vault token.
pub const ENV_VAULT_TOKEN: &str = "VAULT_TOKEN";

/// Vault secret store over the HTTP API.
#[derive(Debug)]
pub struct VaultStore {
    client: reqwest::Client,
    address: String,
    token: String,
}

impl VaultStore {
    /// Builds the store from `VAULT_ADDR` / `VAULT_TOKEN`.
    ///
    /// # Errors
    ///
    /// [`SecretError::NotConfigured`] when the token is absent.
    pub fn from_env() -> Result<Self, SecretError> {
        let address = std::env::var(ENV_VAULT_ADDR)
            .unwrap_or_else(|_| "http://127.0.0.1:8200".to_string());
        let token = std::env::var(ENV_VAULT_TOKEN)
            .map_err(|_| SecretError::NotConfigured("VAULT_TOKEN is not set".to_string()))?;
        Ok(Self::new(address, token))
    }

    /// Builds the store with explicit address and token.
    #[must_use]
    pub fn new(address: String, token: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            address: address.trim_end_matches('/').to_string(),
            token,
        }
    }
}

#[async_trait]
impl SecretStore for VaultStore {
    async fn get_secrets(&self, path: &str) -> Result<HashMap<String, Vec<u8>>, SecretError> {
        let url = format!("{}/v1/{}", self.address, path.trim_start_matches('/'));
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| SecretError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SecretError::Request(format!(
                "vault returned {} for {path}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SecretError::Malformed(e.to_string()))?;
        secrets_from_response(&body)
    }
}

/// Extracts the secret map from a Vault logical-read response.
fn secrets_from_response(
    body: &serde_json::Value,
) -> Result<HashMap<String, Vec<u8>>, SecretError> {
    let data = body
        .get("data")
        .ok_or_else(|| SecretError::Malformed("response has no data field".to_string()))?;
    // KV v2 nests the secret map one level deeper.
    let map = match data.get("data") {
        Some(nested) if nested.is_object() => nested,
        _ => data,
    };
    let map = map
        .as_object()
        .ok_or_else(|| SecretError::Malformed("data is not an object".to_string()))?;

    let mut secrets = HashMap::with_capacity(map.len());
    for (name, value) in map {
        if let Some(text) = value.as_str() {
            secrets.insert(name.clone(), text.as_bytes().to_vec());
        }
    }
    Ok(secrets)
}
