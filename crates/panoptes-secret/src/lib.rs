//! # Panoptes-Stream Secrets
//!
//! Remote secret resolution and TLS assembly.
//!
//! A TLS field of the configuration holds either a filesystem path or a
//! remote reference of the form `<engine>::<path>`
//! (`vault::secret/panoptes/tls`). [`parse_remote_ref`] decides which;
//! [`tls::load_material`] materializes PEM bytes from either source.
//! Remote-store outages degrade to empty TLS material with an error
//! log, never a fatal: the collector must start while the secret store
//! is down.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod tls;
pub mod vault;

use std::collections::HashMap;

use async_trait::async_trait;

pub use tls::{client_tls_config, load_material, TlsMaterial};
pub use vault::VaultStore;

/// Errors from secret-store access.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// The reference names an engine this build does not know.
    #[error("unknown secret engine: {0}")]
    UnknownEngine(String),

    /// The engine is known but its client is not configured.
    #[error("secret engine not configured: {0}")]
    NotConfigured(String),

    /// A request to the secret store failed.
    #[error("secret store request failed: {0}")]
    Request(String),

    /// The store answered with something other than a secret map.
    #[error("secret store response malformed: {0}")]
    Malformed(String),
}

/// A remote secret store returning named PEM blobs.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetches the secret map at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError`] when the store is unreachable or the
    /// response is not a string map.
    async fn get_secrets(&self, path: &str) -> Result<HashMap<String, Vec<u8>>, SecretError>;
}

/// Splits a remote secret reference into `(engine, path)`.
///
/// Returns `None` for anything that is not a reference to a known
/// engine; the caller then treats the string as a filesystem path.
#[must_use]
pub fn parse_remote_ref(reference: &str) -> Option<(&str, &str)> {
    let (engine, path) = reference.split_once("::")?;
    if path.is_empty() {
        return None;
    }
    match engine {
        "vault" => Some((engine, path)),
        _ => None,
    }
}

/// Builds the secret store for a known engine from its process
/// environment.
///
/// # Errors
///
/// [`SecretError::UnknownEngine`] for unrecognized engines,
/// [`SecretError::NotConfigured`] when required environment is absent.
pub fn new_secret_store(engine: &str) -> Result<Box<dyn SecretStore>, SecretError> {
    match engine {
        "vault" => Ok(Box::new(VaultStore::from_env()?)),
        other => Err(SecretError::UnknownEngine(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote_ref() {
        assert_eq!(
            parse_remote_ref("vault::secret/panoptes/tls"),
            Some(("vault", "secret/panoptes/tls"))
        );
        assert_eq!(parse_remote_ref("/etc/certs/cert.pem"), None);
        assert_eq!(parse_remote_ref("vault::"), None);
        assert_eq!(parse_remote_ref("consul::kv/path"), None);
        assert_eq!(parse_remote_ref(""), None);
    }

    #[test]
    fn test_unknown_engine_rejected() {
        assert!(matches!(
            new_secret_store("keywhiz"),
            Err(SecretError::UnknownEngine(_))
        ));
    }
}
