//! Error types for feed subscription and decoding
//!
//! Includes error classification for the reconnect loop: retriable errors
//! drive exponential backoff, fatal errors terminate the session.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Authentication / token errors
    Auth,
    /// Network and RPC errors (connection reset, stream closed, timeout)
    Network,
    /// Schema registry errors (fetch failed, unparseable document)
    Schema,
    /// Event payload decode errors (malformed binary, bad bitmap token)
    Decode,
    /// Replay cursor persistence errors
    Storage,
    /// Configuration errors (invalid replay cursor, invalid replay mode)
    Configuration,
    /// Downstream delivery errors
    Delivery,
    /// Other/unknown errors
    Other,
}

/// Feed subscription errors
#[derive(Error, Debug)]
pub enum FeedError {
    /// Token rejected or expired; re-authenticate and retry
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Connection reset, RPC failure, stream closed by server
    #[error("Transport error: {0}")]
    Transport(String),

    /// No events within the liveness window
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Schema fetch failed or the returned document failed to parse
    #[error("Schema fetch error: {0}")]
    SchemaFetch(String),

    /// Event payload failed to decode against its schema
    #[error("Payload decode error: {0}")]
    PayloadDecode(String),

    /// Replay cursor could not be persisted; fatal
    #[error("Cursor persistence error: {0}")]
    CursorPersist(String),

    /// Invalid replay cursor input, invalid replay mode; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Downstream sink rejected a delivered event
    #[error("Sink error: {0}")]
    Sink(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FeedError {
    /// Create a new authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new schema fetch error
    pub fn schema_fetch(msg: impl Into<String>) -> Self {
        Self::SchemaFetch(msg.into())
    }

    /// Create a new payload decode error
    pub fn payload_decode(msg: impl Into<String>) -> Self {
        Self::PayloadDecode(msg.into())
    }

    /// Create a new cursor persistence error
    pub fn cursor_persist(msg: impl Into<String>) -> Self {
        Self::CursorPersist(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new sink error
    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Retriable errors send the session into `Reconnecting`; the next
    /// attempt resumes from the last persisted cursor.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Auth(_) | Self::Transport(_) | Self::Timeout(_) | Self::Sink(_) => true,

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            // Per-event decode errors are skipped inline; they only surface
            // here after repeated failures, which still warrants a reconnect.
            Self::SchemaFetch(_) | Self::PayloadDecode(_) => true,

            Self::CursorPersist(_) | Self::Config(_) | Self::Json(_) => false,
        }
    }

    /// Check if this error must terminate the session.
    ///
    /// The session retries indefinitely on everything else.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CursorPersist(_) | Self::Config(_))
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Auth(_) => ErrorCategory::Auth,
            Self::Transport(_) => ErrorCategory::Network,
            Self::Timeout(_) => ErrorCategory::Network,
            Self::SchemaFetch(_) => ErrorCategory::Schema,
            Self::PayloadDecode(_) => ErrorCategory::Decode,
            Self::CursorPersist(_) => ErrorCategory::Storage,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Sink(_) => ErrorCategory::Delivery,
            Self::Io(_) => ErrorCategory::Network,
            Self::Json(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth_error",
            Self::Transport(_) => "transport_error",
            Self::Timeout(_) => "timeout",
            Self::SchemaFetch(_) => "schema_fetch_error",
            Self::PayloadDecode(_) => "payload_decode_error",
            Self::CursorPersist(_) => "cursor_persist_error",
            Self::Config(_) => "config_error",
            Self::Sink(_) => "sink_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}

/// Result type for feed operations
pub type Result<T> = std::result::Result<T, FeedError>;
