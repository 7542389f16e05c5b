//! Local room fan-out with backpressure.
//!
//! Each connection owns one bounded mailbox. Joining a room registers that
//! mailbox under the room; delivering a frame walks the room's members and
//! `try_send`s the shared `Arc<str>` into each mailbox. A full mailbox drops
//! the frame for that member only, so one slow socket never stalls a room.
//!
//! The registry only knows about sockets attached to this process. Frames
//! arrive here from the backplane pump, never straight from a relay call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::ConnectionId;

/// Sending half of a connection's outbound queue.
pub type Mailbox = mpsc::Sender<Arc<str>>;

/// Create a connection mailbox holding at most `capacity` frames.
pub fn mailbox(capacity: usize) -> (Mailbox, mpsc::Receiver<Arc<str>>) {
    mpsc::channel(capacity.max(1))
}

/// Snapshot of registry counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanoutStats {
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub active_rooms: usize,
}

/// Members of one room on this process.
#[derive(Default)]
struct RoomGroup {
    members: HashMap<ConnectionId, Mailbox>,
}

/// Room name to local members.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, RoomGroup>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register `mailbox` as a member of `room`. Re-subscribing replaces
    /// the previous mailbox.
    pub async fn subscribe(&self, room: &str, id: ConnectionId, mailbox: Mailbox) {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.to_string())
            .or_default()
            .members
            .insert(id, mailbox);
    }

    /// Remove `id` from `room`. Empty rooms are dropped.
    pub async fn unsubscribe(&self, room: &str, id: ConnectionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(group) = rooms.get_mut(room) else {
            return false;
        };
        let removed = group.members.remove(&id).is_some();
        if group.members.is_empty() {
            rooms.remove(room);
        }
        removed
    }

    /// Deliver `frame` to every local member of `room` except `except`.
    ///
    /// Returns the number of mailboxes that accepted the frame.
    pub async fn deliver(&self, room: &str, except: Option<ConnectionId>, frame: Arc<str>) -> usize {
        let rooms = self.rooms.read().await;
        let Some(group) = rooms.get(room) else {
            return 0;
        };

        let mut accepted = 0;
        for (id, mailbox) in &group.members {
            if Some(*id) == except {
                continue;
            }
            match mailbox.try_send(frame.clone()) {
                Ok(()) => accepted += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Mailbox full for {id} in room {room}, frame dropped");
                }
                // Socket is closing; its disconnect will unsubscribe it.
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.delivered.fetch_add(accepted as u64, Ordering::Relaxed);
        accepted
    }

    pub async fn member_count(&self, room: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room)
            .map_or(0, |group| group.members.len())
    }

    pub async fn is_member(&self, room: &str, id: ConnectionId) -> bool {
        self.rooms
            .read()
            .await
            .get(room)
            .is_some_and(|group| group.members.contains_key(&id))
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn stats(&self) -> FanoutStats {
        FanoutStats {
            frames_delivered: self.delivered.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            active_rooms: self.room_count().await,
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
