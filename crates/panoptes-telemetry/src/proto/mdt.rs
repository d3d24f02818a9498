//! Cisco model-driven telemetry: the self-describing GPB key/value
//! payload and the IOS XR dial-in subscription service
//! (`IOSXRExtensibleManagabilityService.gRPCConfigOper`).

#![allow(missing_docs, clippy::pedantic)]

/// One telemetry message for a subscription.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Telemetry {
    #[prost(string, tag = "1")]
    pub node_id_str: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub subscription_id_str: ::prost::alloc::string::String,
    #[prost(string, tag = "6")]
    pub encoding_path: ::prost::alloc::string::String,
    #[prost(uint64, tag = "8")]
    pub collection_id: u64,
    #[prost(uint64, tag = "9")]
    pub collection_start_time: u64,
    #[prost(uint64, tag = "10")]
    pub msg_timestamp: u64,
    #[prost(message, repeated, tag = "11")]
    pub data_gpbkv: ::prost::alloc::vec::Vec<TelemetryField>,
    #[prost(uint64, tag = "13")]
    pub collection_end_time: u64,
}

/// A node of the self-describing key/value tree.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TelemetryField {
    #[prost(uint64, tag = "1")]
    pub timestamp: u64,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    #[prost(
        oneof = "telemetry_field::ValueByType",
        tags = "4, 5, 6, 7, 8, 9, 10, 11, 12"
    )]
    pub value_by_type: ::core::option::Option<telemetry_field::ValueByType>,
    #[prost(message, repeated, tag = "15")]
    pub fields: ::prost::alloc::vec::Vec<TelemetryField>,
}

/// Nested message and enum types in `TelemetryField`.
pub mod telemetry_field {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum ValueByType {
        #[prost(bytes, tag = "4")]
        BytesValue(::prost::alloc::vec::Vec<u8>),
        #[prost(string, tag = "5")]
        StringValue(::prost::alloc::string::String),
        #[prost(bool, tag = "6")]
        BoolValue(bool),
        #[prost(uint32, tag = "7")]
        Uint32Value(u32),
        #[prost(uint64, tag = "8")]
        Uint64Value(u64),
        #[prost(sint32, tag = "9")]
        Sint32Value(i32),
        #[prost(sint64, tag = "10")]
        Sint64Value(i64),
        #[prost(double, tag = "11")]
        DoubleValue(f64),
        #[prost(float, tag = "12")]
        FloatValue(f32),
    }
}

/// A dial-in subscription request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateSubsArgs {
    #[prost(int64, tag = "1")]
    pub req_id: i64,
    #[prost(int64, tag = "2")]
    pub encode: i64,
    #[prost(string, tag = "3")]
    pub subidstr: ::prost::alloc::string::String,
}

/// One dial-in stream message carrying an encoded [`Telemetry`] payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateSubsReply {
    #[prost(int64, tag = "1")]
    pub res_req_id: i64,
    #[prost(bytes = "vec", tag = "2")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "3")]
    pub errors: ::prost::alloc::string::String,
}

/// Self-describing GPB encoding selector for dial-in subscriptions.
pub const ENCODE_GPBKV: i64 = 3;

/// Generated client implementations.
pub mod grpc_config_oper_client {
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
    pub struct GrpcConfigOperClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl GrpcConfigOperClient<tonic::transport::Channel> {
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

    impl<T> GrpcConfigOperClient<T>
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

        pub async fn create_subs(
            &mut self,
            request: impl tonic::IntoRequest<super::CreateSubsArgs>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::CreateSubsReply>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/IOSXRExtensibleManagabilityService.gRPCConfigOper/CreateSubs",
            );
            let mut req = request.into_request();
            req.extensions_mut().insert(GrpcMethod::new(
                "IOSXRExtensibleManagabilityService.gRPCConfigOper",
                "CreateSubs",
            ));
            self.inner.server_streaming(req, path, codec).await
        }
    }
}
