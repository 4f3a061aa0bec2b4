//! Durable snapshot store.
//!
//! Session snapshots are written to a key-value cache with a TTL equal to
//! the session idle timeout, so stale records expire on their own and
//! metadata survives a process restart. Durability is a convenience: every
//! failure here is reported to the manager, logged, and the service keeps
//! running on in-memory state alone.

use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::Mutex;

use protocol::SessionRecord;

/// Key prefix for persisted session snapshots.
const KEY_PREFIX: &str = "terminal_session:";

/// Batch size for SCAN during restore.
const SCAN_COUNT: u32 = 100;

/// Failures talking to the durable cache.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The cache itself failed (connection, command).
    #[error("durable cache unavailable: {0}")]
    Cache(#[from] redis::RedisError),

    /// A snapshot could not be encoded.
    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

fn session_key(session_id: &str) -> String {
    format!("{KEY_PREFIX}{session_id}")
}

/// Snapshot store with interchangeable backends.
pub enum Store {
    /// Redis-backed durable cache.
    Redis(RedisStore),
    /// In-process map; used in tests and as the explicit cache-less mode.
    Memory(MemoryStore),
}

impl Store {
    /// Persist one snapshot, refreshing its TTL.
    pub async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        match self {
            Store::Redis(store) => store.save(record).await,
            Store::Memory(store) => store.save(record).await,
        }
    }

    /// Remove one snapshot.
    pub async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        match self {
            Store::Redis(store) => store.delete(session_id).await,
            Store::Memory(store) => store.delete(session_id).await,
        }
    }

    /// Load every non-expired snapshot.
    pub async fn load_all(&self) -> Result<Vec<SessionRecord>, StoreError> {
        match self {
            Store::Redis(store) => store.load_all().await,
            Store::Memory(store) => store.load_all().await,
        }
    }
}

/// Redis-backed snapshot store.
pub struct RedisStore {
    conn: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisStore {
    /// Connect to the cache at `url`; snapshots expire after `ttl_seconds`.
    pub async fn connect(url: &str, ttl_seconds: u64) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, ttl_seconds })
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = session_key(&record.session_id);
        let value = serde_json::to_string(record)?;
        conn.set_ex::<_, _, ()>(&key, value, self.ttl_seconds)
            .await?;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(session_key(session_id)).await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut records = Vec::new();

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(format!("{KEY_PREFIX}*"))
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            cursor = next_cursor;

            if !keys.is_empty() {
                let values: Vec<Option<String>> = redis::cmd("MGET")
                    .arg(keys)
                    .query_async(&mut conn)
                    .await?;
                for value in values.into_iter().flatten() {
                    match serde_json::from_str::<SessionRecord>(&value) {
                        Ok(record) => records.push(record),
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping malformed session snapshot");
                        }
                    }
                }
            }

            if cursor == 0 {
                break;
            }
        }

        Ok(records)
    }
}

/// In-memory snapshot store.
///
/// Values are kept serialized so the encode/decode path is exercised the
/// same way the cache-backed store exercises it.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let value = serde_json::to_string(record)?;
        let mut entries = self.entries.lock().await;
        entries.insert(record.session_id.clone(), value);
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.remove(session_id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let entries = self.entries.lock().await;
        let mut records = Vec::new();
        for value in entries.values() {
            match serde_json::from_str::<SessionRecord>(value) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed session snapshot");
                }
            }
        }
        Ok(records)
    }

    /// Insert a raw value, bypassing encoding. Test hook for malformed and
    /// hand-crafted snapshots.
    #[cfg(test)]
    pub async fn insert_raw(&self, session_id: &str, value: &str) {
        let mut entries = self.entries.lock().await;
        entries.insert(session_id.to_string(), value.to_string());
    }

    /// Number of stored snapshots.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the store holds no snapshots.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
