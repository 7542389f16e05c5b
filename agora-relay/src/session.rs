//! Per-connection session state machine.
//!
//! ```text
//!            join ok
//! Connected ─────────► Authenticated(Binding) ──┐
//!     │                                          │ disconnect
//!     └──────────────── disconnect ──────────────┴──► Terminated
//! ```
//!
//! A session is owned by the task serving its socket and is never shared,
//! so transitions need no locking. The binding is written once and is
//! immutable afterwards.

use serde_json::Value;
use std::sync::Arc;

use crate::broadcast::Mailbox;
use crate::error::RelayError;
use crate::protocol::ConnectionId;

/// Identity, room and avatar fixed by a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub identity: String,
    pub room: String,
    pub avatar: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticated(Binding),
    Terminated,
}

/// One live transport connection.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    state: SessionState,
    outbound: Mailbox,
}

impl Session {
    pub fn new(id: ConnectionId, outbound: Mailbox) -> Self {
        Self {
            id,
            state: SessionState::Connected,
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn binding(&self) -> Option<&Binding> {
        match &self.state {
            SessionState::Authenticated(binding) => Some(binding),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.binding().is_some()
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    /// Binding required by every non-join event.
    pub fn require_binding(&self) -> Result<&Binding, RelayError> {
        self.binding().ok_or(RelayError::Unauthenticated)
    }

    /// Checks that a join may proceed from the current state.
    pub fn check_can_join(&self) -> Result<(), RelayError> {
        match self.state {
            SessionState::Connected => Ok(()),
            SessionState::Authenticated(_) => {
                Err(RelayError::Validation("Already joined a session".into()))
            }
            SessionState::Terminated => Err(RelayError::Unauthenticated),
        }
    }

    pub(crate) fn authenticate(&mut self, binding: Binding) -> Result<(), RelayError> {
        self.check_can_join()?;
        self.state = SessionState::Authenticated(binding);
        Ok(())
    }

    /// Move to `Terminated`, returning the binding the session held.
    pub(crate) fn terminate(&mut self) -> Option<Binding> {
        match std::mem::replace(&mut self.state, SessionState::Terminated) {
            SessionState::Authenticated(binding) => Some(binding),
            _ => None,
        }
    }

    pub fn outbound(&self) -> &Mailbox {
        &self.outbound
    }

    /// Queue a frame for this connection only. Returns false if the
    /// mailbox was full or closed.
    pub(crate) fn push(&self, frame: Arc<str>) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Direct frame to {} dropped: {e}", self.id);
                false
            }
        }
    }
}

/// Validated join request.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    pub room: String,
    pub role: String,
    /// The id as supplied, echoed back in the roster update.
    pub id: Value,
}

impl JoinRequest {
    pub fn parse(data: &Value) -> Result<Self, RelayError> {
        let room = required_string(data, "room")?;
        let role = required_string(data, "role")?;
        let id = match data.get("id") {
            Some(id) if !crate::identity::is_falsy(id) => id.clone(),
            _ => {
                return Err(RelayError::Validation(
                    "Must pass a parameter `id` which is an integer".into(),
                ))
            }
        };
        Ok(Self { room, role, id })
    }
}

/// Fetch a non-empty string field from a request payload.
pub(crate) fn required_string(data: &Value, field: &str) -> Result<String, RelayError> {
    match data.get(field).and_then(Value::as_str) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(RelayError::missing_string(field)),
    }
}
