//! Subscription session orchestration
//!
//! A [`SubscriptionSession`] owns the full lifecycle of one topic
//! subscription: opening the subscribe stream, driving flow control,
//! decoding and delivering events, persisting the replay cursor, and
//! reconnecting with exponential backoff when the stream fails.
//!
//! # Flow control
//!
//! The server holds an event budget per stream: events flow only while the
//! budget is positive, and each `FetchResponse` reports how much is left in
//! `pending_num_requested`. The session tops the budget up with one
//! outstanding fetch at a time, so at most `2 * batch_size` events are ever
//! in flight. A zero-permit semaphore gates the request writer; the
//! response loop releases one permit when the budget hits zero.
//!
//! # Delivery guarantees
//!
//! The cursor is persisted only after a batch is fully processed, so a
//! crash between delivery and persistence redelivers that batch on the
//! next run. Consumers see at-least-once delivery in stream order.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::cursor::CursorBackend;
use crate::decoder::EventDecoder;
use crate::error::{FeedError, Result};
use crate::schema::SchemaCache;
use crate::sink::EventSink;
use crate::transport::{
    EventTransport, FetchRequest, FetchResponse, RawEvent, ReplayMode, DEFAULT_BATCH_SIZE,
};

/// Configuration for a subscription session.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Topic to subscribe to, e.g. `/data/AccountChangeEvent`.
    pub topic: String,
    /// Start position when no persisted cursor exists.
    pub replay: ReplayMode,
    /// Events requested per fetch.
    pub batch_size: u32,
    /// Maximum quiet time on the stream before the connection is declared
    /// dead. Must comfortably exceed the server's keepalive interval.
    pub keepalive_timeout: Duration,
    /// First reconnect delay.
    pub initial_backoff: Duration,
    /// Reconnect delay cap.
    pub max_backoff: Duration,
    /// Consecutive decode failures tolerated before the session gives up
    /// on the connection.
    pub max_decode_failures: u32,
    /// Whether to advance past an event the sink failed to accept. When
    /// false, a sink error tears the stream down and the batch is
    /// redelivered after reconnect.
    pub advance_on_sink_error: bool,
    /// Whether delivered events are reduced to the header plus the fields
    /// flagged as changed, nulled, or diffed.
    pub filtered_delivery: bool,
}

impl SubscriptionConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            replay: ReplayMode::Latest,
            batch_size: DEFAULT_BATCH_SIZE,
            keepalive_timeout: Duration::from_secs(600),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_decode_failures: 5,
            advance_on_sink_error: true,
            filtered_delivery: false,
        }
    }

    /// Start position used when no persisted cursor exists.
    pub fn with_replay(mut self, replay: ReplayMode) -> Self {
        self.replay = replay;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_max_decode_failures(mut self, max: u32) -> Self {
        self.max_decode_failures = max;
        self
    }

    pub fn with_advance_on_sink_error(mut self, advance: bool) -> Self {
        self.advance_on_sink_error = advance;
        self
    }

    pub fn with_filtered_delivery(mut self, filtered: bool) -> Self {
        self.filtered_delivery = filtered;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(FeedError::config("topic must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(FeedError::config("batch_size must be positive"));
        }
        Ok(())
    }
}

/// Observable lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Opening the subscribe stream.
    Connecting,
    /// Stream established, events flowing.
    Streaming,
    /// Waiting out a reconnect delay after a failure.
    Backoff,
    /// Session ended, by shutdown or a fatal error.
    Stopped,
}

/// Handle for requesting a graceful stop from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Ask the session to stop. Shutdown is observed between stream
    /// items: a batch already being processed is delivered to completion
    /// and its cursor persisted before the session returns.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// A running subscription to one topic.
pub struct SubscriptionSession {
    config: SubscriptionConfig,
    transport: Arc<dyn EventTransport>,
    decoder: EventDecoder,
    cursor_store: Arc<dyn CursorBackend>,
    sink: Arc<dyn EventSink>,
    backoff: ExponentialBackoff,
    state_tx: watch::Sender<SessionState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    topic_verified: bool,
    decode_failures: u32,
}

impl SubscriptionSession {
    /// Create a session. Nothing happens until [`run`](Self::run) is called.
    pub fn new<T>(
        transport: Arc<T>,
        config: SubscriptionConfig,
        cursor_store: Arc<dyn CursorBackend>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self>
    where
        T: EventTransport + 'static,
    {
        config.validate()?;

        let decoder = EventDecoder::new(SchemaCache::new(transport.clone()));
        let backoff = ExponentialBackoff::new(config.initial_backoff, config.max_backoff);
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            transport,
            decoder,
            cursor_store,
            sink,
            backoff,
            state_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            topic_verified: false,
            decode_failures: 0,
        })
    }

    /// Handle for stopping the session from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Watch the session's lifecycle state.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Run the subscription until shutdown or a fatal error.
    ///
    /// Retriable failures reconnect with exponential backoff; fatal ones
    /// (configuration problems, cursor persistence failures) end the
    /// session with the error.
    pub async fn run(mut self) -> Result<()> {
        let result = self.run_loop().await;
        let _ = self.state_tx.send(SessionState::Stopped);
        if let Err(e) = &result {
            error!(topic = %self.config.topic, error = %e, "subscription ended");
        } else {
            info!(topic = %self.config.topic, "subscription stopped");
        }
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            if *self.shutdown_rx.borrow() {
                return Ok(());
            }

            let _ = self.state_tx.send(SessionState::Connecting);
            match self.run_subscription().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    if matches!(e, FeedError::Auth(_)) {
                        self.transport.invalidate_auth().await;
                    }
                    let delay = self.backoff.next_backoff();
                    warn!(
                        topic = %self.config.topic,
                        error = %e,
                        attempt = self.backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "subscription failed, reconnecting"
                    );
                    let _ = self.state_tx.send(SessionState::Backoff);

                    let mut shutdown = self.shutdown_rx.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return Ok(()),
                    }
                }
            }
        }
    }

    /// One connection attempt: open the stream and pump it until it fails
    /// or shutdown is requested. Returns `Ok(())` only on shutdown.
    async fn run_subscription(&mut self) -> Result<()> {
        if !self.topic_verified {
            let info = self.transport.topic_info(&self.config.topic).await?;
            if !info.can_subscribe {
                return Err(FeedError::config(format!(
                    "not allowed to subscribe to {}",
                    info.name
                )));
            }
            self.topic_verified = true;
        }

        let replay = match self.cursor_store.load().await? {
            Some(cursor) => {
                info!(topic = %self.config.topic, %cursor, "resuming from persisted cursor");
                ReplayMode::Custom(cursor)
            }
            None => self.config.replay.clone(),
        };

        let (request_tx, request_rx) = mpsc::channel(1);
        let mut stream = self.transport.subscribe(request_rx).await?;

        request_tx
            .send(FetchRequest::open(
                &self.config.topic,
                replay,
                self.config.batch_size,
            ))
            .await
            .map_err(|_| FeedError::transport("subscribe stream closed before first fetch"))?;

        let _ = self.state_tx.send(SessionState::Streaming);
        info!(topic = %self.config.topic, "subscription established");

        // Request writer: one follow-up fetch per permit. Permits are
        // released by the response loop when the server budget hits zero,
        // so a second fetch is never outstanding.
        let fetch_gate = Arc::new(Semaphore::new(0));
        let writer = {
            let gate = Arc::clone(&fetch_gate);
            let topic = self.config.topic.clone();
            let batch_size = self.config.batch_size;
            tokio::spawn(async move {
                loop {
                    let permit = match gate.acquire().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    permit.forget();
                    if request_tx
                        .send(FetchRequest::more(&topic, batch_size))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            })
        };

        let mut shutdown = self.shutdown_rx.clone();
        let mut deadline = Instant::now() + self.config.keepalive_timeout;

        let result = loop {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break Ok(()),
                _ = tokio::time::sleep_until(deadline) => {
                    break Err(FeedError::timeout(format!(
                        "no traffic on subscribe stream for {:?}",
                        self.config.keepalive_timeout
                    )));
                }
                item = stream.next() => match item {
                    None => break Err(FeedError::transport("subscribe stream ended")),
                    Some(Err(e)) => break Err(e),
                    Some(Ok(response)) => {
                        deadline = Instant::now() + self.config.keepalive_timeout;
                        if let Err(e) = self.process_response(response, &fetch_gate).await {
                            break Err(e);
                        }
                    }
                }
            }
        };

        fetch_gate.close();
        writer.abort();
        result
    }

    async fn process_response(
        &mut self,
        response: FetchResponse,
        fetch_gate: &Semaphore,
    ) -> Result<()> {
        if response.is_keepalive() {
            debug!(
                topic = %self.config.topic,
                rpc_id = %response.rpc_id,
                cursor = %response.latest_replay_id,
                "keepalive"
            );
            // The scanned-up-to position is a valid resume point; saving it
            // keeps a restart from rescanning a quiet retention window.
            if !response.latest_replay_id.is_empty() {
                self.cursor_store.save(&response.latest_replay_id).await?;
            }
        } else {
            let count = response.events.len();
            let mut last_cursor = None;
            for raw in &response.events {
                if self.process_event(raw).await? {
                    last_cursor = Some(raw.replay_id.clone());
                }
            }

            // Persist once per batch, after every event was handled.
            let cursor = if response.latest_replay_id.is_empty() {
                last_cursor
            } else {
                Some(response.latest_replay_id.clone())
            };
            if let Some(cursor) = cursor {
                self.cursor_store.save(&cursor).await?;
            }
            self.backoff.reset();
            debug!(
                topic = %self.config.topic,
                events = count,
                rpc_id = %response.rpc_id,
                "processed batch"
            );
        }

        if response.pending_num_requested == 0 {
            fetch_gate.add_permits(1);
        }
        Ok(())
    }

    /// Decode and deliver one event. Returns whether the session may
    /// advance past it.
    async fn process_event(&mut self, raw: &RawEvent) -> Result<bool> {
        let decoded = match self.decoder.decode(&raw.schema_id, &raw.payload).await {
            Ok(decoded) => {
                self.decode_failures = 0;
                decoded
            }
            Err(e) => {
                self.decode_failures += 1;
                warn!(
                    schema_id = %raw.schema_id,
                    cursor = %raw.replay_id,
                    failures = self.decode_failures,
                    error = %e,
                    "failed to decode event, skipping"
                );
                if self.decode_failures >= self.config.max_decode_failures {
                    return Err(e);
                }
                return Ok(true);
            }
        };

        let event = if self.config.filtered_delivery {
            decoded.filtered()
        } else {
            decoded
        };

        if let Err(e) = self.sink.deliver(&event).await {
            if self.config.advance_on_sink_error {
                warn!(
                    entity = %event.header.entity_name,
                    cursor = %raw.replay_id,
                    error = %e,
                    "sink rejected event, advancing past it"
                );
                return Ok(true);
            }
            return Err(e);
        }
        Ok(true)
    }
}

impl std::fmt::Debug for SubscriptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSession")
            .field("topic", &self.config.topic)
            .finish()
    }
}
