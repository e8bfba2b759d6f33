//! # changefeed - change-event feed subscriber
//!
//! A resilient client for change-data-capture event feeds served over a
//! bidirectional gRPC stream: it authenticates, subscribes to a topic,
//! decodes Avro event payloads against lazily fetched schemas, expands the
//! changed-field bitmaps in each event header into field names, delivers
//! events to a pluggable sink, and persists a replay cursor so a restart
//! resumes where it left off.
//!
//! ## Features
//!
//! - `grpc` - gRPC transport via `tonic` (rustls)
//! - `oauth` - OAuth token exchange via `reqwest`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  FetchRequest   ┌──────────────────────────────┐
//! │  Event bus  │◀────────────────│      SubscriptionSession     │
//! │  (gRPC)     │────────────────▶│  flow control · keepalive    │
//! └─────────────┘  FetchResponse  │  reconnect w/ backoff        │
//!                                 └──┬─────────┬─────────────┬───┘
//!                                    ▼         ▼             ▼
//!                             ┌──────────┐ ┌─────────┐ ┌───────────┐
//!                             │ Decoder  │ │EventSink│ │CursorStore│
//!                             │ (Avro +  │ │         │ │ (atomic   │
//!                             │  bitmap) │ │         │ │  fsync)   │
//!                             └──────────┘ └─────────┘ └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(all(feature = "grpc", feature = "oauth"))]
//! # async fn example() -> changefeed::Result<()> {
//! use std::sync::Arc;
//! use changefeed::{
//!     CursorStore, GrpcTransport, LogSink, OAuthConfig, SubscriptionConfig,
//!     SubscriptionSession, TokenProvider,
//! };
//!
//! let tokens = Arc::new(TokenProvider::new(OAuthConfig::client_credentials(
//!     "https://login.salesforce.com",
//!     "client-id",
//!     "client-secret",
//! )));
//! let transport = Arc::new(GrpcTransport::new(
//!     "https://api.pubsub.salesforce.com:7443",
//!     tokens,
//! )?);
//!
//! let session = SubscriptionSession::new(
//!     transport,
//!     SubscriptionConfig::new("/data/AccountChangeEvent"),
//!     Arc::new(CursorStore::new("replay_cursor.json")),
//!     Arc::new(LogSink),
//! )?;
//! session.run().await
//! # }
//! ```

pub mod backoff;
pub mod bitmap;
pub mod cursor;
pub mod decoder;
pub mod error;
pub mod event;
pub mod schema;
pub mod session;
pub mod sink;
pub mod transport;

#[cfg(feature = "oauth")]
pub mod auth;
#[cfg(feature = "grpc")]
pub mod grpc;

pub use backoff::ExponentialBackoff;
pub use cursor::{CursorBackend, CursorStore, MemoryCursorStore, ReplayCursor};
pub use decoder::EventDecoder;
pub use error::{ErrorCategory, FeedError, Result};
pub use event::{ChangeEventHeader, DecodedEvent};
pub use schema::{EventSchema, SchemaCache, SchemaSource};
pub use session::{
    SessionState, ShutdownHandle, SubscriptionConfig, SubscriptionSession,
};
pub use sink::{ChannelSink, EventSink, LogSink, MemorySink};
pub use transport::{
    EventTransport, FetchRequest, FetchResponse, RawEvent, ReplayMode, ResponseStream, TopicInfo,
    DEFAULT_BATCH_SIZE,
};

#[cfg(feature = "oauth")]
pub use auth::{AccessToken, OAuthConfig, OAuthGrant, TokenProvider};
#[cfg(feature = "grpc")]
pub use grpc::{CallCredentials, CallMetadata, GrpcTransport, StaticCredentials};
