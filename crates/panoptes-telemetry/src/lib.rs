//! # Panoptes-Stream Telemetry
//!
//! The telemetry ingestion and dispatch engine: vendor-aware streaming
//! subscriptions (gNMI, Juniper JTI, Cisco MDT dial-in) decoded into a
//! uniform data point and pushed onto the bounded dispatch channel,
//! supervised by a single reconcile loop that converges the running
//! worker set with the configuration and cluster membership.
//!
//! ## Structure
//!
//! - [`datapoint`]: the [`ExtDataPoint`] record and its value union
//! - [`dispatch`]: the bounded, non-blocking channel to output adapters
//! - [`registry`]: service-tag → dialect resolution
//! - [`supervisor`]: desired-vs-running reconciliation
//! - [`proto`]: wire types and client stubs
//!
//! Within one worker, data points are emitted in notification order;
//! no ordering is guaranteed across workers.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod backoff;
pub mod datapoint;
pub mod dispatch;
pub mod metrics;
pub mod pathutil;
pub mod proto;
pub mod registry;
pub mod supervisor;

mod gnmi;
mod jti;
mod mdt;
mod transport;
mod worker;

pub use datapoint::{DataPoint, ExtDataPoint, FieldValue};
pub use dispatch::{channel, DispatchReceiver, DispatchSender};
pub use registry::Dialect;
pub use supervisor::Supervisor;

/// Errors from subscription streams.
///
/// Every variant except cancellation feeds the worker's
/// backoff/reconnect path.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Dial or connection-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The stream terminated with a gRPC status.
    #[error("stream error: {0}")]
    Stream(#[from] tonic::Status),

    /// The target half-closed the stream without an error status.
    #[error("stream closed by peer")]
    StreamClosed,

    /// The subscribe call did not establish within its deadline.
    #[error("subscribe call timed out")]
    SubscribeTimeout,

    /// The device's host/port does not form a dialable URI.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl TelemetryError {
    /// Whether this failure is an authentication or TLS problem, which
    /// logs at error level while the worker keeps retrying.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Stream(status) => matches!(
                status.code(),
                tonic::Code::Unauthenticated | tonic::Code::PermissionDenied
            ),
            Self::Transport(e) => e.to_string().contains("tls"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_classification() {
        assert!(TelemetryError::Stream(tonic::Status::unauthenticated("bad token")).is_auth());
        assert!(TelemetryError::Stream(tonic::Status::permission_denied("no")).is_auth());
        assert!(!TelemetryError::Stream(tonic::Status::unavailable("down")).is_auth());
        assert!(!TelemetryError::StreamClosed.is_auth());
    }
}
