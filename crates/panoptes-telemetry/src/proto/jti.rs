//! Juniper OpenConfig telemetry protocol
//! (`telemetry.OpenConfigTelemetry`).

#![allow(missing_docs, clippy::pedantic)]

/// A request to subscribe to one or more sensor paths.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionRequest {
    #[prost(message, optional, tag = "1")]
    pub input: ::core::option::Option<SubscriptionInput>,
    #[prost(message, repeated, tag = "2")]
    pub path_list: ::prost::alloc::vec::Vec<Path>,
}

/// Collector endpoints the device may push to.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionInput {
    #[prost(message, repeated, tag = "1")]
    pub collector_list: ::prost::alloc::vec::Vec<Collector>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Collector {
    #[prost(string, tag = "1")]
    pub address: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
}

/// One subscribed sensor path.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Path {
    #[prost(string, tag = "1")]
    pub path: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub filter: ::prost::alloc::string::String,
    #[prost(bool, tag = "3")]
    pub suppress_unchanged: bool,
    #[prost(uint32, tag = "4")]
    pub max_silent_interval: u32,
    #[prost(uint32, tag = "5")]
    pub sample_frequency: u32,
    #[prost(bool, tag = "6")]
    pub need_eom: bool,
}

/// One telemetry frame: a batch of key/value pairs under a path.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OpenConfigData {
    #[prost(string, tag = "1")]
    pub system_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub component_id: u32,
    #[prost(uint32, tag = "3")]
    pub sub_component_id: u32,
    #[prost(string, tag = "4")]
    pub path: ::prost::alloc::string::String,
    #[prost(uint64, tag = "5")]
    pub sequence_number: u64,
    #[prost(uint64, tag = "6")]
    pub timestamp: u64,
    #[prost(message, repeated, tag = "7")]
    pub kv: ::prost::alloc::vec::Vec<KeyValue>,
    #[prost(bool, tag = "10")]
    pub sync_response: bool,
}

/// One key/value pair of a frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyValue {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(oneof = "key_value::Value", tags = "5, 6, 7, 8, 9, 10, 11")]
    pub value: ::core::option::Option<key_value::Value>,
}

/// Nested message and enum types in `KeyValue`.
pub mod key_value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(double, tag = "5")]
        DoubleValue(f64),
        #[prost(int64, tag = "6")]
        IntValue(i64),
        #[prost(uint64, tag = "7")]
        UintValue(u64),
        #[prost(sint64, tag = "8")]
        SintValue(i64),
        #[prost(bool, tag = "9")]
        BoolValue(bool),
        #[prost(string, tag = "10")]
        StrValue(::prost::alloc::string::String),
        #[prost(bytes, tag = "11")]
        BytesValue(::prost::alloc::vec::Vec<u8>),
    }
}

/// Generated client implementations.
pub mod open_config_telemetry_client {
    #![allow(
        unused_variables,
        dead_code,
        missing_docs,
        clippy::wildcard_imports,
        clippy::let_unit_value
    )]
    use tonic::codegen::http::Uri;
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct OpenConfigTelemetryClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl OpenConfigTelemetryClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> OpenConfigTelemetryClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        pub fn with_origin(inner: T, origin: Uri) -> Self {
            let inner = tonic::client::Grpc::with_origin(inner, origin);
            Self { inner }
        }

        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.inner = self.inner.max_decoding_message_size(limit);
            self
        }

        pub async fn telemetry_subscribe(
            &mut self,
            request: impl tonic::IntoRequest<super::SubscriptionRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::OpenConfigData>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/telemetry.OpenConfigTelemetry/telemetrySubscribe",
            );
            let mut req = request.into_request();
            req.extensions_mut().insert(GrpcMethod::new(
                "telemetry.OpenConfigTelemetry",
                "telemetrySubscribe",
            ));
            self.inner.server_streaming(req, path, codec).await
        }
    }
}
