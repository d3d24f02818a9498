//! Shared gRPC dialing for the dialect subscribers.

use std::time::Duration;

use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tracing::warn;

use panoptes_config::Device;
use panoptes_secret::{client_tls_config, load_material};

use crate::TelemetryError;

/// Connection establishment timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Subscribe-call establishment timeout.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Dials a device, assembling TLS material when the device asks for it.
///
/// # Errors
///
/// [`TelemetryError::InvalidEndpoint`] for an unbuildable URI,
/// [`TelemetryError::Transport`] when the connection fails.
pub(crate) async fn dial(device: &Device) -> Result<Channel, TelemetryError> {
    let scheme = if device.tls_config.enabled { "https" } else { "http" };
    let uri = format!("{scheme}://{}:{}", device.host, device.port);

    let dial_timeout = if device.timeout == 0 {
        DIAL_TIMEOUT
    } else {
        Duration::from_secs(device.timeout)
    };

    let mut endpoint = Endpoint::from_shared(uri.clone())
        .map_err(|e| TelemetryError::InvalidEndpoint(format!("{uri}: {e}")))?
        .connect_timeout(dial_timeout)
        .tcp_keepalive(Some(Duration::from_secs(30)));

    if device.tls_config.enabled {
        let material = load_material(&device.tls_config).await;
        endpoint = endpoint
            .tls_config(client_tls_config(&material, Some(&device.host)))
            .map_err(TelemetryError::Transport)?;
    }

    Ok(endpoint.connect().await?)
}

/// Attaches the device's credentials as request metadata.
pub(crate) fn attach_credentials<T>(request: &mut tonic::Request<T>, device: &Device) {
    if device.username.is_empty() {
        return;
    }
    match (
        MetadataValue::try_from(device.username.as_str()),
        MetadataValue::try_from(device.password.as_str()),
    ) {
        (Ok(username), Ok(password)) => {
            request.metadata_mut().insert("username", username);
            request.metadata_mut().insert("password", password);
        }
        _ => warn!(device = %device.key(), "credentials are not valid metadata, dialing without them"),
    }
}
