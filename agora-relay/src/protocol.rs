//! JSON wire protocol between relay clients and the hub.
//!
//! Every WebSocket text frame carries one JSON object.
//!
//! ```text
//! client ──► server   {"event": "session-update", "ack": 7, "data": {"room": "r1", "game": "chess"}}
//! server ──► client   {"ack": 7, "data": { ...RoomEvent... }}        (success)
//!                     {"ack": 7, "error": "Must pass a parameter…"}  (failure)
//! server ──► client   {"event": "presence", "data": {"numUsers": 3}}
//!                     {"event": "room", "room": "r1", "data": { ...RoomMessage... }}
//! ```
//!
//! Validation and authorization failures share the same ack shape: a plain
//! error string, so unauthenticated callers learn nothing about hub state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::presence::PresenceRecord;

/// Opaque, globally unique id of one transport connection.
///
/// Assigned by the transport layer on accept. Unique across hub processes,
/// which lets a broadcast exclude its sender after crossing the backplane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl std::str::FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ───────────────────────────────────────────────────────────────────
// Room content events
// ───────────────────────────────────────────────────────────────────

/// The three relayable content event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    SessionUpdate,
    StudentResponse,
    Mousemove,
}

impl ContentKind {
    pub const ALL: [ContentKind; 3] = [
        ContentKind::SessionUpdate,
        ContentKind::StudentResponse,
        ContentKind::Mousemove,
    ];

    /// Wire event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            ContentKind::SessionUpdate => "session-update",
            ContentKind::StudentResponse => "student-response",
            ContentKind::Mousemove => "mousemove",
        }
    }

    /// Name of the required string field carried by this event type.
    pub fn field(&self) -> &'static str {
        match self {
            ContentKind::SessionUpdate => "game",
            ContentKind::StudentResponse => "response",
            ContentKind::Mousemove => "position",
        }
    }

    pub fn content(&self, value: String) -> EventContent {
        match self {
            ContentKind::SessionUpdate => EventContent::Game { game: value },
            ContentKind::StudentResponse => EventContent::Response { response: value },
            ContentKind::Mousemove => EventContent::Position { position: value },
        }
    }
}

/// Type-specific payload of a [`RoomEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventContent {
    Game { game: String },
    Response { response: String },
    Position { position: String },
}

impl EventContent {
    pub fn value(&self) -> &str {
        match self {
            EventContent::Game { game } => game,
            EventContent::Response { response } => response,
            EventContent::Position { position } => position,
        }
    }
}

/// A relayed content event.
///
/// `time` is stamped by the relay (ms since the Unix epoch), never taken
/// from the client. `message_id` is filled in once the durable log accepts
/// the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomEvent {
    pub room: String,
    pub time: u64,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub content: EventContent,
    pub identity: String,
    pub avatar: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

// ───────────────────────────────────────────────────────────────────
// Roster updates
// ───────────────────────────────────────────────────────────────────

/// Which delivery path carried a `user-joined-session` update.
///
/// The joiner gets the `Direct` copy; everyone else in the room gets the
/// `Broadcast` copy through the backplane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryPath {
    Direct,
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RosterUpdate {
    #[serde(rename_all = "camelCase")]
    UserJoinedSession {
        num_users: usize,
        /// The `id` exactly as the joiner supplied it.
        id: Value,
        role: String,
        users: Vec<PresenceRecord>,
        from: DeliveryPath,
    },
    #[serde(rename_all = "camelCase")]
    UserDisconnected {
        identity: String,
        avatar: String,
        users: Vec<PresenceRecord>,
        num_users: usize,
    },
}

/// Anything delivered to a room topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoomMessage {
    Roster(RosterUpdate),
    Event(RoomEvent),
}

// ───────────────────────────────────────────────────────────────────
// Frames
// ───────────────────────────────────────────────────────────────────

/// Inbound request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

impl ClientFrame {
    pub fn new(event: impl Into<String>, ack: Option<u64>, data: Value) -> Self {
        Self {
            event: event.into(),
            ack,
            data,
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Inbound operations recognised by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Join,
    Content(ContentKind),
}

impl Inbound {
    pub fn from_event(name: &str) -> Option<Self> {
        match name {
            "join-session" | "join" => Some(Inbound::Join),
            "session-update" => Some(Inbound::Content(ContentKind::SessionUpdate)),
            "student-response" => Some(Inbound::Content(ContentKind::StudentResponse)),
            "mousemove" => Some(Inbound::Content(ContentKind::Mousemove)),
            _ => None,
        }
    }
}

/// Successful join reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinReply {
    pub identity: String,
    pub avatar: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceCount {
    pub num_users: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckFrame {
    pub ack: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PushFrame {
    Presence { data: PresenceCount },
    Room { room: String, data: RoomMessage },
}

/// Outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Ack(AckFrame),
    Push(PushFrame),
}

impl ServerFrame {
    pub fn ack_ok(ack: u64, data: Value) -> Self {
        ServerFrame::Ack(AckFrame {
            ack,
            error: None,
            data: Some(data),
        })
    }

    pub fn ack_err(ack: u64, error: impl Into<String>) -> Self {
        ServerFrame::Ack(AckFrame {
            ack,
            error: Some(error.into()),
            data: None,
        })
    }

    pub fn presence(num_users: usize) -> Self {
        ServerFrame::Push(PushFrame::Presence {
            data: PresenceCount { num_users },
        })
    }

    pub fn room(room: impl Into<String>, data: RoomMessage) -> Self {
        ServerFrame::Push(PushFrame::Room {
            room: room.into(),
            data,
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Timed out waiting for reply")]
    Timeout,
}
