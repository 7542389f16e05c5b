//! Redis-backed presence store shared by every hub process.
//!
//! All records live in one hash:
//!
//! ```text
//! HSET <key> <connection-id> {"identity": "...", "room": "..."}
//! ```
//!
//! `HSET`/`HDEL` are atomic per field, which is the only guarantee the hub
//! relies on. Room queries read the whole hash and filter locally.

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use std::collections::HashMap;

use super::{sort_records, PresenceEntry, PresenceError, PresenceRecord, PresenceStore};
use crate::protocol::ConnectionId;

/// Presence store over a Redis hash.
///
/// Cheap to clone: the connection manager is shared and reconnects after a
/// dropped link.
#[derive(Clone)]
pub struct RedisPresenceStore {
    connection: ConnectionManager,
    key: String,
}

impl RedisPresenceStore {
    /// Connect to `redis_url` and keep records under the hash `key`.
    pub async fn connect(redis_url: &str, key: impl Into<String>) -> Result<Self, PresenceError> {
        // Do not log the URL, it may carry credentials.
        let client = Client::open(redis_url).map_err(|e| {
            log::error!("Failed to open Redis client for presence: {e}");
            PresenceError::Backend(format!("Failed to open Redis client: {e}"))
        })?;
        let connection = client.get_connection_manager().await.map_err(|e| {
            log::error!("Failed to connect to Redis for presence: {e}");
            PresenceError::Backend(format!("Failed to connect to Redis: {e}"))
        })?;

        Ok(Self {
            connection,
            key: key.into(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn parse(field: &str, value: &str) -> Result<PresenceRecord, PresenceError> {
        let id: ConnectionId = field
            .parse()
            .map_err(|e| PresenceError::Corrupt(format!("bad connection id {field:?}: {e}")))?;
        let entry: PresenceEntry = serde_json::from_str(value)
            .map_err(|e| PresenceError::Corrupt(format!("bad entry for {field}: {e}")))?;
        Ok(PresenceRecord::new(id, entry))
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn upsert(&self, id: ConnectionId, entry: PresenceEntry) -> Result<(), PresenceError> {
        let value = serde_json::to_string(&entry)
            .map_err(|e| PresenceError::Corrupt(e.to_string()))?;
        let mut conn = self.connection.clone();
        conn.hset::<_, _, _, ()>(&self.key, id.to_string(), value).await?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<PresenceRecord>, PresenceError> {
        let mut conn = self.connection.clone();
        let raw: HashMap<String, String> = conn.hgetall(&self.key).await?;

        let mut records = Vec::with_capacity(raw.len());
        for (field, value) in &raw {
            match Self::parse(field, value) {
                Ok(record) => records.push(record),
                // One bad field must not hide the rest of the roster.
                Err(e) => log::warn!("Skipping presence field in {}: {e}", self.key),
            }
        }
        sort_records(&mut records);
        Ok(records)
    }

    async fn list_in_room(&self, room: &str) -> Result<Vec<PresenceRecord>, PresenceError> {
        let mut records = self.list_all().await?;
        records.retain(|r| r.room == room);
        Ok(records)
    }

    async fn remove(&self, id: ConnectionId) -> Result<(), PresenceError> {
        let mut conn = self.connection.clone();
        conn.hdel::<_, _, ()>(&self.key, id.to_string()).await?;
        Ok(())
    }
}
