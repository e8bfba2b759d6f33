//! Replay cursor persistence
//!
//! The feed identifies stream positions with an opaque, server-ordered byte
//! sequence. Persisting it after each fully processed batch is what makes
//! the subscription resumable: after a restart the session replays from the
//! saved position, possibly redelivering the last batch but never skipping
//! events.
//!
//! The store writes a small versioned JSON record (cursor bytes as hex plus
//! an optional decimal rendering) with write-temp-then-rename and fsync, so
//! a reader never observes a partially written cursor and a crash after
//! `save` returns cannot lose it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{FeedError, Result};

/// Width the feed uses when a cursor is supplied as a decimal integer.
const DECIMAL_CURSOR_WIDTH: usize = 10;

/// Opaque stream position, totally ordered by the server.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplayCursor(Vec<u8>);

impl ReplayCursor {
    /// Wrap raw cursor bytes as returned by the server.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw cursor bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Check whether the cursor is empty (servers send empty cursors on
    /// responses that carry no position update).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Decimal rendering (big-endian integer value), for cursors up to
    /// 16 bytes wide.
    pub fn to_decimal(&self) -> Option<String> {
        if self.0.is_empty() || self.0.len() > 16 {
            return None;
        }
        let value = self.0.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128);
        Some(value.to_string())
    }

    /// Parse a hex-encoded cursor.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.is_empty() || hex.len() % 2 != 0 {
            return Err(FeedError::config(format!(
                "replay cursor hex {hex:?} has invalid length"
            )));
        }
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|_| {
                FeedError::config(format!("replay cursor {hex:?} is not valid hex"))
            })?;
        Ok(Self(bytes))
    }

    /// Parse an operator-supplied cursor: a decimal integer (encoded as a
    /// fixed-width big-endian byte string) or a hex string. A value that is
    /// neither is a fatal configuration error.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if let Ok(value) = input.parse::<u128>() {
            let bytes = value.to_be_bytes();
            if bytes[..bytes.len() - DECIMAL_CURSOR_WIDTH]
                .iter()
                .any(|b| *b != 0)
            {
                return Err(FeedError::config(format!(
                    "replay cursor {input} exceeds {DECIMAL_CURSOR_WIDTH} bytes"
                )));
            }
            return Ok(Self(bytes[bytes.len() - DECIMAL_CURSOR_WIDTH..].to_vec()));
        }
        Self::from_hex(input)
    }
}

impl std::fmt::Debug for ReplayCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReplayCursor({})", self.to_hex())
    }
}

impl std::fmt::Display for ReplayCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// On-disk record format. Versioned so the layout can evolve.
#[derive(Debug, Serialize, Deserialize)]
struct CursorRecord {
    version: u32,
    cursor_hex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cursor_decimal: Option<String>,
    saved_at: u64,
}

const CURSOR_RECORD_VERSION: u32 = 1;

/// Trait for cursor storage backends.
#[async_trait]
pub trait CursorBackend: Send + Sync {
    /// Persist the cursor durably before returning.
    async fn save(&self, cursor: &ReplayCursor) -> Result<()>;
    /// Load the last persisted cursor; `None` on first run.
    async fn load(&self) -> Result<Option<ReplayCursor>>;
}

/// File-backed cursor store with atomic, fsynced writes.
///
/// The file is exclusively owned by one subscription session; there is no
/// multi-writer coordination.
pub struct CursorStore {
    path: PathBuf,
    fsync: bool,
}

impl CursorStore {
    /// Create a store writing to the given path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            fsync: true,
        }
    }

    /// Create a store with fsync disabled (testing only; durability is lost).
    pub fn with_options(path: impl AsRef<Path>, fsync: bool) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            fsync,
        }
    }

    /// Path of the cursor file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CursorBackend for CursorStore {
    async fn save(&self, cursor: &ReplayCursor) -> Result<()> {
        let record = CursorRecord {
            version: CURSOR_RECORD_VERSION,
            cursor_hex: cursor.to_hex(),
            cursor_decimal: cursor.to_decimal(),
            saved_at: current_timestamp(),
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| FeedError::cursor_persist(e.to_string()))?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(|e| FeedError::cursor_persist(e.to_string()))?;

        file.write_all(json.as_bytes())
            .await
            .map_err(|e| FeedError::cursor_persist(e.to_string()))?;

        if self.fsync {
            file.sync_all()
                .await
                .map_err(|e| FeedError::cursor_persist(e.to_string()))?;
        }
        drop(file);

        // Atomic rename
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| FeedError::cursor_persist(e.to_string()))?;

        debug!(cursor = %cursor, path = %self.path.display(), "saved replay cursor");
        Ok(())
    }

    async fn load(&self) -> Result<Option<ReplayCursor>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FeedError::Io(e)),
        };

        let record: CursorRecord = serde_json::from_str(&contents).map_err(|e| {
            FeedError::config(format!(
                "cursor file {} is corrupt: {e}",
                self.path.display()
            ))
        })?;
        if record.version != CURSOR_RECORD_VERSION {
            return Err(FeedError::config(format!(
                "cursor file {} has unsupported version {}",
                self.path.display(),
                record.version
            )));
        }

        Ok(Some(ReplayCursor::from_hex(&record.cursor_hex)?))
    }
}

/// In-memory cursor store (for testing or when persistence isn't needed).
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursor: RwLock<Option<ReplayCursor>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorBackend for MemoryCursorStore {
    async fn save(&self, cursor: &ReplayCursor) -> Result<()> {
        *self.cursor.write().await = Some(cursor.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<ReplayCursor>> {
        Ok(self.cursor.read().await.clone())
    }
}

/// Get current Unix timestamp in seconds.
fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_hex_round_trip() {
        let cursor = ReplayCursor::new(vec![0x00, 0x1a, 0xff]);
        assert_eq!(cursor.to_hex(), "001aff");
        assert_eq!(ReplayCursor::from_hex("001aff").unwrap(), cursor);
    }

    #[test]
    fn test_decimal_rendering() {
        let cursor = ReplayCursor::new(vec![0x01, 0x00]);
        assert_eq!(cursor.to_decimal(), Some("256".to_string()));

        assert_eq!(ReplayCursor::new(vec![]).to_decimal(), None);
        assert_eq!(ReplayCursor::new(vec![0xab; 17]).to_decimal(), None);
    }

    #[test]
    fn test_parse_decimal_is_fixed_width() {
        let cursor = ReplayCursor::parse("256").unwrap();
        assert_eq!(cursor.as_bytes().len(), 10);
        assert_eq!(cursor.to_decimal(), Some("256".to_string()));
    }

    #[test]
    fn test_parse_hex_fallback() {
        let cursor = ReplayCursor::parse("0a0b0c").unwrap();
        assert_eq!(cursor.as_bytes(), &[0x0a, 0x0b, 0x0c]);
    }

    #[test]
    fn test_parse_garbage_is_config_error() {
        let err = ReplayCursor::parse("not-a-cursor").unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));

        // Odd-length hex is also rejected rather than truncated.
        assert!(ReplayCursor::parse("abc").is_err());
    }

    #[tokio::test]
    async fn test_load_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let store = CursorStore::new(dir.path().join("replay_cursor.json"));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = CursorStore::new(dir.path().join("replay_cursor.json"));

        let cursor = ReplayCursor::new(vec![0xde, 0xad, 0xbe, 0xef]);
        store.save(&cursor).await.unwrap();

        // A fresh store over the same path simulates a restart.
        let store2 = CursorStore::new(store.path());
        assert_eq!(store2.load().await.unwrap(), Some(cursor));
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_cursor() {
        let dir = tempdir().unwrap();
        let store = CursorStore::new(dir.path().join("replay_cursor.json"));

        store.save(&ReplayCursor::new(vec![0x01])).await.unwrap();
        store.save(&ReplayCursor::new(vec![0x02])).await.unwrap();

        assert_eq!(
            store.load().await.unwrap(),
            Some(ReplayCursor::new(vec![0x02]))
        );
    }

    #[tokio::test]
    async fn test_corrupt_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replay_cursor.json");
        tokio::fs::write(&path, "garbage").await.unwrap();

        let err = CursorStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCursorStore::new();
        assert_eq!(store.load().await.unwrap(), None);

        let cursor = ReplayCursor::new(vec![0x42]);
        store.save(&cursor).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(cursor));
    }

    #[tokio::test]
    async fn test_record_is_versioned_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replay_cursor.json");
        let store = CursorStore::new(&path);
        store
            .save(&ReplayCursor::new(vec![0x01, 0x02]))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let record: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(record["version"], 1);
        assert_eq!(record["cursor_hex"], "0102");
        assert_eq!(record["cursor_decimal"], "258");
    }
}
