//! Event delivery seam
//!
//! The session hands each decoded event to an [`EventSink`]. Sink errors are
//! treated as transient delivery failures; whether the session advances past
//! the event anyway is a session-level policy.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::error::{FeedError, Result};
use crate::event::DecodedEvent;

/// Consumer of decoded change events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event. Events arrive in stream order, one at a time.
    async fn deliver(&self, event: &DecodedEvent) -> Result<()>;
}

/// Sink that logs each event as structured JSON.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn deliver(&self, event: &DecodedEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        info!(
            entity = %event.header.entity_name,
            change_type = %event.header.change_type,
            event = %json,
            "change event"
        );
        Ok(())
    }
}

/// Sink forwarding events into an mpsc channel.
///
/// Delivery fails once the receiving side is dropped, which the session
/// surfaces like any other delivery failure.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<DecodedEvent>,
}

impl ChannelSink {
    /// Create a sink plus the receiver its events arrive on.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<DecodedEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&self, event: &DecodedEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| FeedError::sink("event channel closed"))
    }
}

/// Sink that buffers events in memory, for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<DecodedEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything delivered so far.
    pub async fn events(&self) -> Vec<DecodedEvent> {
        self.events.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn deliver(&self, event: &DecodedEvent) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
