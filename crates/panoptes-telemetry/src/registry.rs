//! Service-tag registry mapping sensors to their dialect.

/// A telemetry dialect the engine can subscribe with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// gNMI streaming subscriptions (Arista, Cisco, Juniper).
    Gnmi,
    /// Juniper Telemetry Interface kv frames.
    Jti,
    /// Cisco model-driven telemetry, gRPC dial-in.
    Mdt,
}

impl Dialect {
    /// Resolves a sensor's service tag.
    #[must_use]
    pub fn from_service(service: &str) -> Option<Self> {
        match service {
            "arista.gnmi" | "cisco.gnmi" | "juniper.gnmi" => Some(Self::Gnmi),
            "juniper.jti" => Some(Self::Jti),
            "cisco.mdt" => Some(Self::Mdt),
            _ => None,
        }
    }

    /// Every service tag the engine accepts.
    #[must_use]
    pub fn supported_services() -> &'static [&'static str] {
        &[
            "arista.gnmi",
            "cisco.gnmi",
            "juniper.gnmi",
            "juniper.jti",
            "cisco.mdt",
        ]
    }
}
