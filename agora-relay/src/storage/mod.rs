//! Durable log for relayed room events.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   append(event)   ┌──────────────┐
//! │ Relay       │ ────────────────► │ DurableLog   │
//! │ (per event) │ ◄──────────────── │              │
//! └──────┬──────┘    message id     └──────┬───────┘
//!        │                                 │
//!        │ publish only after              │ back-ends
//!        ▼ the append returned             ▼
//! ┌─────────────┐              ┌──────────────────────────────┐
//! │ Backplane   │              │ MemoryEventLog: tests, dev  │
//! └─────────────┘              │ RocksEventLog: RocksDB       │
//!                              └──────────────────────────────┘
//! ```
//!
//! The relay awaits every append before broadcasting. A failed append fails
//! the whole relay operation.

pub mod rocks;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::protocol::RoomEvent;

pub use rocks::{RocksEventLog, StoreConfig};

/// Persistence-assigned id of a stored event.
pub type MessageId = String;

/// Durable log errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LogError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Storage task failed: {0}")]
    Task(String),
    #[error("Log unavailable: {0}")]
    Unavailable(String),
}

/// Append-only store for emitted room events.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Persist `event` and return its id. The event's own `message_id` is
    /// ignored.
    async fn append(&self, event: &RoomEvent) -> Result<MessageId, LogError>;
}

/// In-memory log.
///
/// Keeps every appended event with its id attached, in append order.
#[derive(Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<RoomEvent>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<RoomEvent> {
        self.events.lock().await.clone()
    }

    pub async fn events_in_room(&self, room: &str) -> Vec<RoomEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.room == room)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

#[async_trait]
impl DurableLog for MemoryEventLog {
    async fn append(&self, event: &RoomEvent) -> Result<MessageId, LogError> {
        let id = Uuid::new_v4().to_string();
        let mut stored = event.clone();
        stored.message_id = Some(id.clone());
        self.events.lock().await.push(stored);
        Ok(id)
    }
}
