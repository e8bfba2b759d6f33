//! Schema resolution and caching
//!
//! Event payloads reference their schema by a server-assigned id; the schema
//! document itself is fetched lazily over the transport and parsed once.
//! Schema ids for a given topic are few and stable, so entries are retained
//! for the process lifetime and never evicted.

use std::sync::Arc;

use apache_avro::Schema as AvroSchema;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{FeedError, Result};

/// Source of raw schema documents, keyed by schema id.
///
/// Implemented by the transport (`GetSchema` RPC) and by test doubles.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Fetch the JSON schema document for the given id.
    async fn fetch_schema(&self, schema_id: &str) -> Result<String>;
}

/// A parsed event schema together with its raw document.
#[derive(Clone)]
pub struct EventSchema {
    id: String,
    raw: String,
    avro: AvroSchema,
}

impl EventSchema {
    /// Parse a schema document fetched for the given id.
    pub fn parse(id: impl Into<String>, raw: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let raw = raw.into();
        let avro = AvroSchema::parse_str(&raw)
            .map_err(|e| FeedError::schema_fetch(format!("schema {id} failed to parse: {e}")))?;
        Ok(Self { id, raw, avro })
    }

    /// Server-assigned schema id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Raw JSON schema document.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Parsed Avro schema.
    pub fn avro(&self) -> &AvroSchema {
        &self.avro
    }
}

impl std::fmt::Debug for EventSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSchema").field("id", &self.id).finish()
    }
}

/// Process-lifetime schema cache with single-flight fetches.
///
/// Concurrent callers requesting the same uncached id share one in-flight
/// fetch; a failed fetch leaves the entry empty, so the next event that
/// references the id retries instead of caching the failure.
pub struct SchemaCache {
    source: Arc<dyn SchemaSource>,
    entries: DashMap<String, Arc<OnceCell<Arc<EventSchema>>>>,
}

impl SchemaCache {
    /// Create a cache backed by the given schema source.
    pub fn new(source: Arc<dyn SchemaSource>) -> Self {
        Self {
            source,
            entries: DashMap::new(),
        }
    }

    /// Resolve a schema id, fetching and parsing the document on first use.
    pub async fn get(&self, schema_id: &str) -> Result<Arc<EventSchema>> {
        let cell = self
            .entries
            .entry(schema_id.to_string())
            .or_default()
            .clone();

        let schema = cell
            .get_or_try_init(|| async {
                debug!(schema_id, "fetching schema");
                let raw = self.source.fetch_schema(schema_id).await?;
                Ok::<_, FeedError>(Arc::new(EventSchema::parse(schema_id, raw)?))
            })
            .await?;

        Ok(Arc::clone(schema))
    }

    /// Number of cached schemas.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    /// Check whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SchemaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}
