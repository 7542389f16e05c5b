//! Cross-process fan-out backplane.
//!
//! ```text
//!  hub process A                                   hub process B
//! ┌───────────────┐   publish(topic, envelope)   ┌───────────────┐
//! │ Relay ────────┼──────────►┌──────────┐       │               │
//! │               │           │ pub/sub  │──────►│ pump task     │
//! │ pump task ◄───┼───────────│ (Redis / │       │   │           │
//! │   │           │           │  local)  │       │   ▼           │
//! │   ▼           │           └──────────┘       │ RoomRegistry  │
//! │ RoomRegistry  │                              │ (local socks) │
//! └───────────────┘                              └───────────────┘
//! ```
//!
//! Every hub subscribes to one topic at startup and publishes every room
//! broadcast into it, including broadcasts for its own sockets. Local
//! delivery therefore has exactly one path: the subscription. A hub whose
//! subscription ends resubscribes with [`Backoff`].

pub mod local;
pub mod redis;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::ConnectionId;

pub use local::LocalBackplane;
pub use self::redis::RedisBackplane;

/// Stream of raw payloads for one subscription.
pub type Subscription = BoxStream<'static, Vec<u8>>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackplaneError {
    #[error("Backplane connection error: {0}")]
    Connection(String),
    #[error("Backplane publish failed: {0}")]
    Publish(String),
    #[error("Backplane subscribe failed: {0}")]
    Subscribe(String),
    #[error("Envelope codec error: {0}")]
    Codec(String),
}

/// Technology-independent publish/subscribe channel.
#[async_trait]
pub trait Backplane: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackplaneError>;

    /// Subscribe to `topic`. The subscription is live once this returns.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BackplaneError>;
}

/// Doubling delay between resubscribe attempts, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the next call waits twice as long.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(5))
    }
}

/// One room broadcast in transit.
///
/// `frame` is the fully encoded JSON text frame, so receiving processes
/// forward it to sockets without re-encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub room: String,
    /// Connection that must not receive this frame (the sender).
    pub except: Option<ConnectionId>,
    pub frame: String,
}

impl Envelope {
    pub fn new(room: impl Into<String>, except: Option<ConnectionId>, frame: String) -> Self {
        Self {
            room: room.into(),
            except,
            frame,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BackplaneError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| BackplaneError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BackplaneError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| BackplaneError::Codec(e.to_string()))?;
        Ok(envelope)
    }
}
