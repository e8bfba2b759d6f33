//! Transport abstraction for the event feed
//!
//! The session layer talks to the feed through [`EventTransport`], a thin
//! seam over the bidirectional subscribe stream and the schema/topic lookup
//! RPCs. The production implementation lives in [`crate::grpc`]; tests
//! substitute scripted doubles.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::cursor::ReplayCursor;
use crate::error::{FeedError, Result};
use crate::schema::SchemaSource;

/// Default number of events requested per fetch.
pub const DEFAULT_BATCH_SIZE: u32 = 10;

/// Where a new subscription starts reading the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayMode {
    /// Only events published after the subscription is established.
    Latest,
    /// All events inside the retention window.
    Earliest,
    /// Resume immediately after a previously observed cursor.
    Custom(ReplayCursor),
}

impl ReplayMode {
    /// Parse an operator-supplied start mode. `latest` and `earliest` are
    /// keywords (case-insensitive); anything else must parse as a cursor.
    pub fn parse(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "latest" => Ok(Self::Latest),
            "earliest" => Ok(Self::Earliest),
            "" => Err(FeedError::config("replay mode must not be empty")),
            _ => Ok(Self::Custom(ReplayCursor::parse(input)?)),
        }
    }
}

impl std::fmt::Display for ReplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Earliest => write!(f, "earliest"),
            Self::Custom(cursor) => write!(f, "custom({cursor})"),
        }
    }
}

/// One flow-control request sent on the subscribe stream.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    /// Topic to read from. Only meaningful on the first request of a stream.
    pub topic: String,
    /// Start position. Only meaningful on the first request of a stream.
    pub replay: ReplayMode,
    /// Number of additional events the client is ready to receive.
    pub num_requested: u32,
}

impl FetchRequest {
    /// Initial request opening a subscription.
    pub fn open(topic: impl Into<String>, replay: ReplayMode, num_requested: u32) -> Self {
        Self {
            topic: topic.into(),
            replay,
            num_requested,
        }
    }

    /// Follow-up request topping the server's event budget back up. The
    /// topic is repeated; the replay position is ignored by the server on
    /// non-initial requests.
    pub fn more(topic: impl Into<String>, num_requested: u32) -> Self {
        Self {
            topic: topic.into(),
            replay: ReplayMode::Latest,
            num_requested,
        }
    }
}

/// A single event as delivered by the transport, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// Id of the schema the payload was written with.
    pub schema_id: String,
    /// Avro-encoded payload bytes.
    pub payload: Bytes,
    /// Position of this event in the stream.
    pub replay_id: ReplayCursor,
}

/// One batch delivered on the subscribe stream.
///
/// A response with no events is a keepalive; its `latest_replay_id` is still
/// a valid position and `pending_num_requested` still drives flow control.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    /// Events in this batch, in stream order.
    pub events: Vec<RawEvent>,
    /// Latest position the server has scanned up to.
    pub latest_replay_id: ReplayCursor,
    /// Events still outstanding against previous requests. Zero means the
    /// client must send a new request before more events arrive.
    pub pending_num_requested: u32,
    /// Server-side correlation id, logged for supportability.
    pub rpc_id: String,
}

impl FetchResponse {
    /// Check whether this response is a keepalive (carries no events).
    pub fn is_keepalive(&self) -> bool {
        self.events.is_empty()
    }
}

/// Stream of fetch responses produced by a subscribe call.
pub type ResponseStream = BoxStream<'static, Result<FetchResponse>>;

/// Metadata about a topic, from the topic-lookup RPC.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicInfo {
    /// Fully qualified topic name.
    pub name: String,
    /// Whether the authenticated principal may subscribe.
    pub can_subscribe: bool,
    /// Id of the topic's current schema.
    pub schema_id: String,
}

/// Bidirectional feed transport.
///
/// `subscribe` opens one stream: fetch requests flow out through the channel
/// the caller keeps the sender of, responses flow back on the returned
/// stream. Dropping either side tears the stream down.
#[async_trait]
pub trait EventTransport: SchemaSource {
    /// Open a subscribe stream fed by `requests`.
    async fn subscribe(&self, requests: mpsc::Receiver<FetchRequest>) -> Result<ResponseStream>;

    /// Look up topic metadata.
    async fn topic_info(&self, topic: &str) -> Result<TopicInfo>;

    /// Drop any cached credentials so the next call re-authenticates.
    /// No-op for transports without an auth layer.
    async fn invalidate_auth(&self) {}
}
