//! gRPC feed transport using `tonic` (rustls).
//!
//! The event bus exposes one service with a bidirectional `Subscribe`
//! stream plus unary `GetSchema` and `GetTopic` lookups. The protobuf
//! messages are mirrored here with `prost` derives; tag numbers must be
//! exact for wire compatibility.
//!
//! Every call carries three metadata headers: `accesstoken` (with the
//! `Bearer ` prefix), `instanceurl`, and `tenantid`. They are fetched per
//! call from a [`CallCredentials`] implementation so a rotated token is
//! picked up without rebuilding the channel.
//!
//! # HTTP/2 Connection Tuning
//!
//! The channel keeps HTTP/2 PING frames flowing every 30 s so load
//! balancers do not silently drop the long-lived subscribe stream while
//! the server is quiet between batches.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, ClientTlsConfig};
use tonic::Status;
use tracing::debug;

use crate::cursor::ReplayCursor;
use crate::error::{FeedError, Result};
use crate::schema::SchemaSource;
use crate::transport::{
    EventTransport, FetchRequest, FetchResponse, RawEvent, ReplayMode, ResponseStream, TopicInfo,
};

const SUBSCRIBE_PATH: &str = "/eventbus.v1.PubSub/Subscribe";
const GET_SCHEMA_PATH: &str = "/eventbus.v1.PubSub/GetSchema";
const GET_TOPIC_PATH: &str = "/eventbus.v1.PubSub/GetTopic";

/// Convert a `tonic::Status` into a feed error.
///
/// Auth rejections are kept distinct so the session can invalidate the
/// cached token before reconnecting; everything else on an established
/// channel is a transport fault.
impl From<Status> for FeedError {
    fn from(status: Status) -> Self {
        let message = format!("{:?}: {}", status.code(), status.message());
        match status.code() {
            tonic::Code::Unauthenticated | tonic::Code::PermissionDenied => Self::auth(message),
            tonic::Code::DeadlineExceeded => Self::timeout(message),
            _ => Self::transport(message),
        }
    }
}

impl From<tonic::transport::Error> for FeedError {
    fn from(e: tonic::transport::Error) -> Self {
        Self::transport(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────
// Protobuf message types — mirrors of the eventbus.v1 proto
// ─────────────────────────────────────────────────────────────────

pub mod wire {
    /// Start position for a new subscription.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum ReplayPreset {
        Latest = 0,
        Earliest = 1,
        Custom = 2,
    }

    /// Flow-control request on the subscribe stream.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FetchRequest {
        #[prost(string, tag = "1")]
        pub topic_name: String,
        #[prost(enumeration = "ReplayPreset", tag = "2")]
        pub replay_preset: i32,
        #[prost(bytes = "vec", tag = "3")]
        pub replay_id: Vec<u8>,
        #[prost(int32, tag = "4")]
        pub num_requested: i32,
    }

    /// One published event.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ProducerEvent {
        #[prost(string, tag = "1")]
        pub id: String,
        #[prost(string, tag = "2")]
        pub schema_id: String,
        #[prost(bytes = "vec", tag = "3")]
        pub payload: Vec<u8>,
    }

    /// An event as delivered to a subscriber, with its stream position.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ConsumerEvent {
        #[prost(message, optional, tag = "1")]
        pub event: Option<ProducerEvent>,
        #[prost(bytes = "vec", tag = "2")]
        pub replay_id: Vec<u8>,
    }

    /// One batch (or keepalive) on the subscribe stream.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FetchResponse {
        #[prost(message, repeated, tag = "1")]
        pub events: Vec<ConsumerEvent>,
        #[prost(bytes = "vec", tag = "2")]
        pub latest_replay_id: Vec<u8>,
        #[prost(string, tag = "3")]
        pub rpc_id: String,
        #[prost(int32, tag = "4")]
        pub pending_num_requested: i32,
    }

    /// Schema lookup by id.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct SchemaRequest {
        #[prost(string, tag = "1")]
        pub schema_id: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct SchemaInfo {
        #[prost(string, tag = "1")]
        pub schema_json: String,
        #[prost(string, tag = "2")]
        pub rpc_id: String,
        #[prost(string, tag = "3")]
        pub schema_id: String,
    }

    /// Topic lookup by name.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TopicRequest {
        #[prost(string, tag = "1")]
        pub topic_name: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TopicInfo {
        #[prost(string, tag = "1")]
        pub topic_name: String,
        #[prost(string, tag = "2")]
        pub tenant_guid: String,
        #[prost(bool, tag = "3")]
        pub can_publish: bool,
        #[prost(bool, tag = "4")]
        pub can_subscribe: bool,
        #[prost(string, tag = "5")]
        pub schema_id: String,
        #[prost(string, tag = "6")]
        pub rpc_id: String,
    }
}

impl From<FetchRequest> for wire::FetchRequest {
    fn from(request: FetchRequest) -> Self {
        let (preset, replay_id) = match request.replay {
            ReplayMode::Latest => (wire::ReplayPreset::Latest, Vec::new()),
            ReplayMode::Earliest => (wire::ReplayPreset::Earliest, Vec::new()),
            ReplayMode::Custom(cursor) => {
                (wire::ReplayPreset::Custom, cursor.as_bytes().to_vec())
            }
        };
        Self {
            topic_name: request.topic,
            replay_preset: preset as i32,
            replay_id,
            num_requested: request.num_requested as i32,
        }
    }
}

impl From<wire::FetchResponse> for FetchResponse {
    fn from(response: wire::FetchResponse) -> Self {
        let events = response
            .events
            .into_iter()
            .filter_map(|consumer_event| {
                let event = consumer_event.event?;
                Some(RawEvent {
                    schema_id: event.schema_id,
                    payload: Bytes::from(event.payload),
                    replay_id: ReplayCursor::new(consumer_event.replay_id),
                })
            })
            .collect();
        Self {
            events,
            latest_replay_id: ReplayCursor::new(response.latest_replay_id),
            pending_num_requested: response.pending_num_requested.max(0) as u32,
            rpc_id: response.rpc_id,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Call credentials
// ─────────────────────────────────────────────────────────────────

/// Metadata attached to every RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMetadata {
    /// `accesstoken` header value, `Bearer ` prefix included.
    pub access_token: String,
    /// `instanceurl` header value.
    pub instance_url: String,
    /// `tenantid` header value.
    pub tenant_id: String,
}

/// Source of per-call auth metadata.
#[async_trait]
pub trait CallCredentials: Send + Sync {
    /// Metadata for the next call.
    async fn metadata(&self) -> Result<CallMetadata>;

    /// Drop cached credentials after the server rejects them.
    async fn invalidate(&self) {}
}

/// Fixed credentials, for pre-fetched tokens and tests.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub CallMetadata);

#[async_trait]
impl CallCredentials for StaticCredentials {
    async fn metadata(&self) -> Result<CallMetadata> {
        Ok(self.0.clone())
    }
}

#[cfg(feature = "oauth")]
#[async_trait]
impl CallCredentials for crate::auth::TokenProvider {
    async fn metadata(&self) -> Result<CallMetadata> {
        let token = self.token().await?;
        Ok(CallMetadata {
            access_token: token.bearer,
            instance_url: token.instance_url,
            tenant_id: token.tenant_id,
        })
    }

    async fn invalidate(&self) {
        self.invalidate().await;
    }
}

// ─────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────

/// gRPC implementation of [`EventTransport`].
///
/// The connection is established lazily on the first RPC, so construction
/// is synchronous and fails only on configuration problems.
#[derive(Clone)]
pub struct GrpcTransport {
    grpc: tonic::client::Grpc<Channel>,
    credentials: Arc<dyn CallCredentials>,
}

impl GrpcTransport {
    /// Create a transport for the given endpoint, e.g.
    /// `https://api.pubsub.salesforce.com:7443`.
    pub fn new(endpoint: &str, credentials: Arc<dyn CallCredentials>) -> Result<Self> {
        let user_agent = concat!("changefeed/", env!("CARGO_PKG_VERSION"));

        let endpoint = Channel::from_shared(endpoint.to_string())
            .map_err(|e| FeedError::config(format!("invalid endpoint: {e}")))?
            .user_agent(user_agent)
            .map_err(|e| FeedError::config(format!("invalid user-agent: {e}")))?
            .tls_config(ClientTlsConfig::new().with_native_roots())?
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .tcp_nodelay(true)
            // PING frames keep the idle subscribe stream alive behind
            // load balancers that kill quiet connections.
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(20))
            .keep_alive_while_idle(true);

        let channel = endpoint.connect_lazy();

        Ok(Self {
            grpc: tonic::client::Grpc::new(channel),
            credentials,
        })
    }

    /// Build a request with the auth metadata attached.
    async fn authed_request<T>(&self, message: T) -> Result<tonic::Request<T>> {
        let metadata = self.credentials.metadata().await?;
        let mut request = tonic::Request::new(message);
        let headers = request.metadata_mut();
        headers.insert("accesstoken", ascii_value("accesstoken", &metadata.access_token)?);
        headers.insert("instanceurl", ascii_value("instanceurl", &metadata.instance_url)?);
        headers.insert("tenantid", ascii_value("tenantid", &metadata.tenant_id)?);
        Ok(request)
    }

    async fn ready(&self) -> Result<tonic::client::Grpc<Channel>> {
        let mut grpc = self.grpc.clone();
        grpc.ready()
            .await
            .map_err(|e| FeedError::transport(format!("channel not ready: {e}")))?;
        Ok(grpc)
    }
}

fn ascii_value(key: &str, value: &str) -> Result<AsciiMetadataValue> {
    value
        .parse()
        .map_err(|_| FeedError::auth(format!("{key} metadata contains non-ASCII characters")))
}

#[async_trait]
impl SchemaSource for GrpcTransport {
    async fn fetch_schema(&self, schema_id: &str) -> Result<String> {
        let mut grpc = self.ready().await?;
        let request = self
            .authed_request(wire::SchemaRequest {
                schema_id: schema_id.to_string(),
            })
            .await?;

        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static(GET_SCHEMA_PATH);
        let response: tonic::Response<wire::SchemaInfo> =
            grpc.unary(request, path, codec).await?;

        let info = response.into_inner();
        debug!(schema_id, rpc_id = %info.rpc_id, "fetched schema");
        Ok(info.schema_json)
    }
}

#[async_trait]
impl EventTransport for GrpcTransport {
    async fn subscribe(&self, requests: mpsc::Receiver<FetchRequest>) -> Result<ResponseStream> {
        let mut grpc = self.ready().await?;

        let outbound = ReceiverStream::new(requests).map(wire::FetchRequest::from);
        let request = self.authed_request(outbound).await?;

        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static(SUBSCRIBE_PATH);
        let response: tonic::Response<tonic::Streaming<wire::FetchResponse>> =
            grpc.streaming(request, path, codec).await?;

        let stream = response.into_inner().map(|item| {
            item.map(FetchResponse::from).map_err(FeedError::from)
        });
        Ok(stream.boxed())
    }

    async fn topic_info(&self, topic: &str) -> Result<TopicInfo> {
        let mut grpc = self.ready().await?;
        let request = self
            .authed_request(wire::TopicRequest {
                topic_name: topic.to_string(),
            })
            .await?;

        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static(GET_TOPIC_PATH);
        let response: tonic::Response<wire::TopicInfo> = grpc.unary(request, path, codec).await?;

        let info = response.into_inner();
        Ok(TopicInfo {
            name: info.topic_name,
            can_subscribe: info.can_subscribe,
            schema_id: info.schema_id,
        })
    }

    async fn invalidate_auth(&self) {
        self.credentials.invalidate().await;
    }
}

impl std::fmt::Debug for GrpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcTransport")
            .field("transport", &"gRPC/tonic")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    // ── Protobuf wire tests ────────────────────────────────────

    #[test]
    fn test_fetch_request_roundtrip() {
        let request = wire::FetchRequest {
            topic_name: "/data/AccountChangeEvent".to_string(),
            replay_preset: wire::ReplayPreset::Custom as i32,
            replay_id: vec![0x0a, 0x0b],
            num_requested: 10,
        };
        let bytes = request.encode_to_vec();
        let decoded = wire::FetchRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_fetch_response_roundtrip() {
        let response = wire::FetchResponse {
            events: vec![wire::ConsumerEvent {
                event: Some(wire::ProducerEvent {
                    id: "e-1".to_string(),
                    schema_id: "schema-1".to_string(),
                    payload: vec![1, 2, 3],
                }),
                replay_id: vec![0xaa],
            }],
            latest_replay_id: vec![0xaa],
            rpc_id: "rpc-7".to_string(),
            pending_num_requested: 9,
        };
        let bytes = response.encode_to_vec();
        let decoded = wire::FetchResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, response);
    }

    // ── Domain conversions ─────────────────────────────────────

    #[test]
    fn test_replay_mode_to_wire() {
        let latest: wire::FetchRequest =
            FetchRequest::open("/data/ChangeEvents", ReplayMode::Latest, 10).into();
        assert_eq!(latest.replay_preset, wire::ReplayPreset::Latest as i32);
        assert!(latest.replay_id.is_empty());

        let custom: wire::FetchRequest = FetchRequest::open(
            "/data/ChangeEvents",
            ReplayMode::Custom(ReplayCursor::new(vec![0x01, 0x02])),
            10,
        )
        .into();
        assert_eq!(custom.replay_preset, wire::ReplayPreset::Custom as i32);
        assert_eq!(custom.replay_id, vec![0x01, 0x02]);
        assert_eq!(custom.num_requested, 10);
    }

    #[test]
    fn test_wire_response_to_domain() {
        let response: FetchResponse = wire::FetchResponse {
            events: vec![
                wire::ConsumerEvent {
                    event: Some(wire::ProducerEvent {
                        id: "e-1".to_string(),
                        schema_id: "schema-1".to_string(),
                        payload: vec![1, 2],
                    }),
                    replay_id: vec![0x01],
                },
                // Events without a payload envelope are dropped.
                wire::ConsumerEvent {
                    event: None,
                    replay_id: vec![0x02],
                },
            ],
            latest_replay_id: vec![0x02],
            rpc_id: "rpc-1".to_string(),
            pending_num_requested: -1,
        }
        .into();

        assert_eq!(response.events.len(), 1);
        assert_eq!(response.events[0].schema_id, "schema-1");
        assert_eq!(response.events[0].replay_id, ReplayCursor::new(vec![0x01]));
        assert_eq!(response.latest_replay_id, ReplayCursor::new(vec![0x02]));
        // Negative pending counts are clamped.
        assert_eq!(response.pending_num_requested, 0);
    }

    // ── Status mapping ─────────────────────────────────────────

    #[test]
    fn test_status_unauthenticated_maps_to_auth() {
        let err = FeedError::from(Status::unauthenticated("expired token"));
        assert!(matches!(err, FeedError::Auth(_)));

        let err = FeedError::from(Status::permission_denied("no subscribe"));
        assert!(matches!(err, FeedError::Auth(_)));
    }

    #[test]
    fn test_status_deadline_maps_to_timeout() {
        let err = FeedError::from(Status::deadline_exceeded("60s elapsed"));
        assert!(matches!(err, FeedError::Timeout(_)));
    }

    #[test]
    fn test_status_unavailable_maps_to_transport() {
        let err = FeedError::from(Status::unavailable("server restarting"));
        assert!(matches!(err, FeedError::Transport(_)));
        assert!(err.is_retriable());
    }

    // ── Construction ───────────────────────────────────────────

    fn credentials() -> Arc<dyn CallCredentials> {
        Arc::new(StaticCredentials(CallMetadata {
            access_token: "Bearer tok".to_string(),
            instance_url: "https://example.my.salesforce.com".to_string(),
            tenant_id: "00Dxx0000001gEREAY".to_string(),
        }))
    }

    #[tokio::test]
    async fn test_lazy_construction_does_not_connect() {
        let transport = GrpcTransport::new("https://api.pubsub.example.com:7443", credentials());
        assert!(transport.is_ok());
    }

    #[test]
    fn test_invalid_endpoint_is_config_error() {
        let err = GrpcTransport::new("not a url\n", credentials()).unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
    }

    #[tokio::test]
    async fn test_metadata_rejects_control_chars() {
        let transport = GrpcTransport::new(
            "https://api.pubsub.example.com:7443",
            Arc::new(StaticCredentials(CallMetadata {
                access_token: "Bearer bad\ntoken".to_string(),
                instance_url: "https://example".to_string(),
                tenant_id: "org".to_string(),
            })),
        )
        .unwrap();

        let err = transport.authed_request(()).await.unwrap_err();
        assert!(matches!(err, FeedError::Auth(_)));
    }

    #[tokio::test]
    async fn test_authed_request_carries_all_headers() {
        let transport =
            GrpcTransport::new("https://api.pubsub.example.com:7443", credentials()).unwrap();
        let request = transport.authed_request(()).await.unwrap();

        let metadata = request.metadata();
        assert_eq!(metadata.get("accesstoken").unwrap(), "Bearer tok");
        assert_eq!(
            metadata.get("instanceurl").unwrap(),
            "https://example.my.salesforce.com"
        );
        assert_eq!(metadata.get("tenantid").unwrap(), "00Dxx0000001gEREAY");
    }
}
