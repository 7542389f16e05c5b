//! Validation and construction of relayed room events.
//!
//! The hub drives the side effects (append, publish, reply); this module
//! decides whether a content request is acceptable and what event it
//! becomes.

use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::RelayError;
use crate::protocol::{ContentKind, RoomEvent};
use crate::session::{required_string, Binding};

/// A validated content request.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentRequest {
    pub kind: ContentKind,
    /// Target room as requested, which may differ from the joined room.
    pub room: String,
    pub value: String,
}

impl ContentRequest {
    pub fn parse(kind: ContentKind, data: &Value) -> Result<Self, RelayError> {
        let room = required_string(data, "room")?;
        let value = required_string(data, kind.field())?;
        Ok(Self { kind, room, value })
    }

    /// Stamp the request into an event sent by `sender`.
    pub fn into_event(self, sender: &Binding, time: u64) -> RoomEvent {
        RoomEvent {
            room: self.room,
            time,
            kind: self.kind,
            content: self.kind.content(self.value),
            identity: sender.identity.clone(),
            avatar: sender.avatar.clone(),
            message_id: None,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
