//! TLS assembly from filesystem paths or remote secret references.
//!
//! Builds the PEM material a dialer needs from a [`TlsConfig`] block.
//! Either every populated field is a remote reference resolved through
//! one secret path, or every field is a filesystem path; the two modes
//! never mix for one endpoint.

use panoptes_config::TlsConfig;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};
use tracing::{error, warn};

use crate::{new_secret_store, parse_remote_ref};

/// Raw PEM material for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    /// Client certificate PEM.
    pub cert: Vec<u8>,
    /// Client key PEM.
    pub key: Vec<u8>,
    /// CA bundle PEM.
    pub ca: Vec<u8>,
    /// Skip server certificate verification where the consumer supports it.
    pub insecure_skip_verify: bool,
}

impl TlsMaterial {
    /// Whether no PEM material was resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cert.is_empty() && self.key.is_empty() && self.ca.is_empty()
    }
}

/// Materializes PEM bytes for a TLS block.
///
/// Secret-store failures and unreadable files degrade to empty
/// material with an error log: the caller dials without the missing
/// pieces and keeps retrying through its backoff path while the
/// operator rotates secrets.
pub async fn load_material(cfg: &TlsConfig) -> TlsMaterial {
    let mut material = TlsMaterial {
        insecure_skip_verify: cfg.insecure_skip_verify,
        ..TlsMaterial::default()
    };

    if let Some((engine, path)) = parse_remote_ref(&cfg.cert_file) {
        let store = match new_secret_store(engine) {
            Ok(store) => store,
            Err(e) => {
                error!(engine, error = %e, "secret engine unavailable, continuing without TLS material");
                return material;
            }
        };
        match store.get_secrets(path).await {
            Ok(mut secrets) => {
                material.cert = secrets.remove("cert").unwrap_or_default();
                material.key = secrets.remove("key").unwrap_or_default();
                material.ca = secrets.remove("ca").unwrap_or_default();
            }
            Err(e) => {
                error!(engine, path, error = %e, "secret fetch failed, continuing without TLS material");
            }
        }
        return material;
    }

    material.cert = read_optional(&cfg.cert_file);
    material.key = read_optional(&cfg.key_file);
    material.ca = read_optional(&cfg.ca_file);
    material
}

/// Builds a tonic client TLS configuration from resolved material.
///
/// tonic cannot disable server verification; when
/// `insecure_skip_verify` is set without a CA bundle the platform
/// roots are used instead and a warning is logged.
#[must_use]
pub fn client_tls_config(material: &TlsMaterial, domain: Option<&str>) -> ClientTlsConfig {
    let mut tls = ClientTlsConfig::new();

    if material.ca.is_empty() {
        if material.insecure_skip_verify {
            warn!("insecureSkipVerify is not supported for gRPC endpoints, using platform roots");
        }
        tls = tls.with_native_roots();
    } else {
        tls = tls.ca_certificate(Certificate::from_pem(material.ca.clone()));
    }

    if !material.cert.is_empty() && !material.key.is_empty() {
        tls = tls.identity(Identity::from_pem(
            material.cert.clone(),
            material.key.clone(),
        ));
    }

    if let Some(domain) = domain {
        tls = tls.domain_name(domain);
    }
    tls
}

fn read_optional(path: &str) -> Vec<u8> {
    if path.is_empty() {
        return Vec::new();
    }
    match std::fs::read(path) {
        Ok(pem) => pem,
        Err(e) => {
            error!(path, error = %e, "TLS file unreadable, continuing without it");
            Vec::new()
        }
    }
}
