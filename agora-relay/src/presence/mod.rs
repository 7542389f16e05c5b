//! Presence store: which identities are live in which rooms.
//!
//! ```text
//! join ──────────┐
//! heartbeat ─────┼──► upsert(connection_id, {identity, room})
//!                │
//! disconnect ────┴──► remove(connection_id)
//!
//! roster queries ───► list_in_room(room) / list_all()
//! ```
//!
//! The store is shared by every hub process. Each key is a connection id,
//! which is never written by two connections, so per-key atomic upsert and
//! remove are all the concurrency safety the hub needs.

pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::protocol::ConnectionId;

pub use self::redis::RedisPresenceStore;

/// Value half of a presence record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub identity: String,
    pub room: String,
}

/// "This identity is live in this room", keyed by connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub connection_id: ConnectionId,
    pub identity: String,
    pub room: String,
}

impl PresenceRecord {
    pub fn new(connection_id: ConnectionId, entry: PresenceEntry) -> Self {
        Self {
            connection_id,
            identity: entry.identity,
            room: entry.room,
        }
    }
}

/// Stable roster order: identity, then connection id.
pub(crate) fn sort_records(records: &mut [PresenceRecord]) {
    records.sort_by(|a, b| {
        a.identity
            .cmp(&b.identity)
            .then_with(|| a.connection_id.cmp(&b.connection_id))
    });
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PresenceError {
    #[error("Presence backend error: {0}")]
    Backend(String),
    #[error("Presence record is corrupt: {0}")]
    Corrupt(String),
}

impl From<::redis::RedisError> for PresenceError {
    fn from(e: ::redis::RedisError) -> Self {
        PresenceError::Backend(e.to_string())
    }
}

/// Shared presence key-value store.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Insert or overwrite the record for `id`.
    async fn upsert(&self, id: ConnectionId, entry: PresenceEntry) -> Result<(), PresenceError>;

    async fn list_all(&self) -> Result<Vec<PresenceRecord>, PresenceError>;

    async fn list_in_room(&self, room: &str) -> Result<Vec<PresenceRecord>, PresenceError>;

    /// Remove the record for `id`. Removing an absent record is not an error.
    async fn remove(&self, id: ConnectionId) -> Result<(), PresenceError>;
}

/// In-process presence store.
///
/// Only correct for a single hub process; multi-process deployments use
/// [`RedisPresenceStore`].
#[derive(Default)]
pub struct MemoryPresenceStore {
    records: RwLock<HashMap<ConnectionId, PresenceEntry>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn get(&self, id: ConnectionId) -> Option<PresenceEntry> {
        self.records.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn upsert(&self, id: ConnectionId, entry: PresenceEntry) -> Result<(), PresenceError> {
        self.records.write().await.insert(id, entry);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<PresenceRecord>, PresenceError> {
        let mut records: Vec<PresenceRecord> = self
            .records
            .read()
            .await
            .iter()
            .map(|(id, entry)| PresenceRecord::new(*id, entry.clone()))
            .collect();
        sort_records(&mut records);
        Ok(records)
    }

    async fn list_in_room(&self, room: &str) -> Result<Vec<PresenceRecord>, PresenceError> {
        let mut records: Vec<PresenceRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.room == room)
            .map(|(id, entry)| PresenceRecord::new(*id, entry.clone()))
            .collect();
        sort_records(&mut records);
        Ok(records)
    }

    async fn remove(&self, id: ConnectionId) -> Result<(), PresenceError> {
        self.records.write().await.remove(&id);
        Ok(())
    }
}
