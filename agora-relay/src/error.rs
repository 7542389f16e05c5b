//! Caller-facing errors for hub operations.

use crate::backplane::BackplaneError;
use crate::storage::LogError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RelayError {
    /// Missing or wrong-typed field, or a repeated join.
    #[error("{0}")]
    Validation(String),
    #[error("Can't send a message until you are authenticated")]
    Unauthenticated,
    #[error("Failed to store message")]
    Persistence(LogError),
    #[error("Failed to deliver message")]
    Delivery(BackplaneError),
    #[error("Failed to generate identity: {0}")]
    Identity(String),
}

impl RelayError {
    pub(crate) fn missing_string(field: &str) -> Self {
        RelayError::Validation(format!("Must pass a parameter `{field}` which is a string"))
    }

    /// Text sent back in the ack frame. Collaborator details stay in the logs.
    pub fn wire_message(&self) -> String {
        self.to_string()
    }

    /// True for errors the caller caused and can fix by resending.
    pub fn is_client_error(&self) -> bool {
        matches!(self, RelayError::Validation(_) | RelayError::Unauthenticated)
    }
}
