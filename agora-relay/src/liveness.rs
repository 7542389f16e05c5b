//! Heartbeat-driven presence refresh and the transport keep-alive.
//!
//! ```text
//! ping every `interval` ──► pong ──► KeepAlive::touch
//!                                └─► LivenessMonitor::on_heartbeat ──► upsert
//!
//! no inbound frame for `interval + timeout` ──► close ──► disconnect
//! ```
//!
//! Presence records are only ever refreshed here and removed on
//! disconnect. There is no sweep: a record outlives its connection only if
//! the owning process dies before running the disconnect.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::presence::{PresenceEntry, PresenceError, PresenceStore};
use crate::session::Session;

/// Default ping interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(25_000);
/// Default extra grace after a missed ping before the connection is closed.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(20_000);

/// Keeps presence records fresh for authenticated sessions.
#[derive(Clone)]
pub struct LivenessMonitor {
    presence: Arc<dyn PresenceStore>,
}

impl LivenessMonitor {
    pub fn new(presence: Arc<dyn PresenceStore>) -> Self {
        Self { presence }
    }

    /// Refresh the session's presence record.
    ///
    /// Returns `Ok(false)` without touching the store when the session has
    /// not joined.
    pub async fn on_heartbeat(&self, session: &Session) -> Result<bool, PresenceError> {
        let Some(binding) = session.binding() else {
            return Ok(false);
        };
        let entry = PresenceEntry {
            identity: binding.identity.clone(),
            room: binding.room.clone(),
        };
        self.presence.upsert(session.id(), entry).await?;
        log::trace!("Heartbeat refreshed presence for {}", session.id());
        Ok(true)
    }
}

/// Per-connection inactivity deadline.
#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    interval: Duration,
    timeout: Duration,
    last_seen: Instant,
}

impl KeepAlive {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            last_seen: Instant::now(),
        }
    }

    /// Record inbound traffic.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Instant after which the connection is considered dead.
    pub fn deadline(&self) -> Instant {
        self.last_seen + self.interval + self.timeout
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT)
    }
}
