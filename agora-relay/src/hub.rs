//! The relay hub: one per process.
//!
//! ```text
//!  transport task (per socket)                 backplane
//!  ┌───────────────────────────┐          ┌────────────────┐
//!  │ connect ─► presence count │          │                │
//!  │ join    ─► Session ───────┼─upsert──►│ PresenceStore  │
//!  │ relay   ─► DurableLog ────┼─publish─►│ Backplane ─────┼──┐
//!  │ heartbeat ► Liveness ─────┼─upsert   │                │  │
//!  │ disconnect ───────────────┼─remove   └────────────────┘  │
//!  └───────────────────────────┘                              │
//!                                    pump task ◄──────────────┘
//!                                        │
//!                                        ▼
//!                                  RoomRegistry ──► local mailboxes
//! ```
//!
//! The hub never writes room frames to local sockets directly. Every room
//! broadcast goes out through the backplane and comes back through the
//! pump, so local and remote sockets see identical delivery.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backplane::{Backoff, Backplane, BackplaneError, Envelope, Subscription};
use crate::broadcast::{mailbox, RoomRegistry};
use crate::error::RelayError;
use crate::identity;
use crate::liveness::LivenessMonitor;
use crate::presence::{PresenceEntry, PresenceError, PresenceRecord, PresenceStore};
use crate::protocol::{
    ClientFrame, ConnectionId, ContentKind, DeliveryPath, Inbound, JoinReply, RoomEvent,
    RoomMessage, RosterUpdate, ServerFrame,
};
use crate::relay::{now_millis, ContentRequest};
use crate::session::{Binding, JoinRequest, Session};
use crate::storage::DurableLog;

pub const DEFAULT_CHANNEL: &str = "agora-relay#broadcast";
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Hub settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Backplane topic shared by every hub process.
    pub channel: String,
    /// Frames buffered per connection before drops start.
    pub outbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub events_relayed: u64,
    pub frames_dropped: u64,
    pub persistence_failures: u64,
    pub presence_failures: u64,
    /// Times the pump re-established a lost backplane subscription.
    pub backplane_resubscribes: u64,
    /// Resubscribe attempts that failed.
    pub backplane_subscribe_failures: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicHubStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    events_relayed: AtomicU64,
    direct_dropped: AtomicU64,
    persistence_failures: AtomicU64,
    presence_failures: AtomicU64,
}

/// Counters written by the pump task.
#[derive(Default)]
struct PumpStats {
    resubscribes: AtomicU64,
    subscribe_failures: AtomicU64,
}

/// Relay hub for one process.
pub struct Hub {
    config: HubConfig,
    presence: Arc<dyn PresenceStore>,
    log: Arc<dyn DurableLog>,
    backplane: Arc<dyn Backplane>,
    registry: Arc<RoomRegistry>,
    liveness: LivenessMonitor,
    stats: AtomicHubStats,
    pump_stats: Arc<PumpStats>,
    pump: JoinHandle<()>,
}

impl Hub {
    /// Subscribe to the backplane and start the delivery pump.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn start(
        config: HubConfig,
        presence: Arc<dyn PresenceStore>,
        log: Arc<dyn DurableLog>,
        backplane: Arc<dyn Backplane>,
    ) -> Result<Self, BackplaneError> {
        let registry = Arc::new(RoomRegistry::new());
        let subscription = backplane.subscribe(&config.channel).await?;
        let pump_stats = Arc::new(PumpStats::default());
        let pump = tokio::spawn(run_pump(
            backplane.clone(),
            config.channel.clone(),
            subscription,
            registry.clone(),
            pump_stats.clone(),
        ));

        log::info!("Hub subscribed to backplane channel {}", config.channel);

        Ok(Self {
            liveness: LivenessMonitor::new(presence.clone()),
            config,
            presence,
            log,
            backplane,
            registry,
            stats: AtomicHubStats::default(),
            pump_stats,
            pump,
        })
    }

    /// Open a session for a freshly accepted connection and tell it how
    /// many users are present across all rooms.
    pub async fn connect(&self) -> (Session, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mailbox(self.config.outbound_capacity);
        let session = Session::new(ConnectionId::new(), tx);

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        match self.presence.list_all().await {
            Ok(users) => self.push(&session, &ServerFrame::presence(users.len())),
            Err(e) => self.presence_failed("count presence", e),
        }

        (session, rx)
    }

    /// Dispatch one client frame. Returns the ack to send back, if the
    /// client asked for one.
    pub async fn handle(&self, session: &mut Session, frame: ClientFrame) -> Option<ServerFrame> {
        let ClientFrame { event, ack, data } = frame;

        let result = match Inbound::from_event(&event) {
            Some(Inbound::Join) => {
                if ack.is_none() {
                    log::debug!("Ignoring join without ack from {}", session.id());
                    return None;
                }
                self.join(session, &data).await.map(|reply| to_data(&reply))
            }
            Some(Inbound::Content(kind)) => {
                self.relay(session, kind, &data).await.map(|event| to_data(&event))
            }
            None => {
                log::debug!("Unknown event {event:?} from {}", session.id());
                Err(RelayError::Validation(format!("Unknown event `{event}`")))
            }
        };

        let ack = ack?;
        Some(match result {
            Ok(data) => ServerFrame::ack_ok(ack, data),
            Err(e) => ServerFrame::ack_err(ack, e.wire_message()),
        })
    }

    /// Join handshake: bind an identity and room to the session.
    pub async fn join(&self, session: &mut Session, data: &Value) -> Result<JoinReply, RelayError> {
        session.check_can_join()?;
        let request = JoinRequest::parse(data)?;

        let identity = identity::generate(&request.role, &identity::id_text(&request.id))?;
        let avatar = identity::avatar_url(&identity);
        let binding = Binding {
            identity: identity.clone(),
            room: request.room.clone(),
            avatar: avatar.clone(),
        };
        session.authenticate(binding)?;

        let id = session.id();
        let room = request.room;
        self.registry
            .subscribe(&room, id, session.outbound().clone())
            .await;

        let entry = PresenceEntry {
            identity: identity.clone(),
            room: room.clone(),
        };
        if let Err(e) = self.presence.upsert(id, entry).await {
            self.presence_failed("record join", e);
        }

        let users = self.roster(&room).await;
        let joined = |from| {
            RoomMessage::Roster(RosterUpdate::UserJoinedSession {
                num_users: users.len(),
                id: request.id.clone(),
                role: request.role.clone(),
                users: users.clone(),
                from,
            })
        };

        self.push(session, &ServerFrame::room(room.as_str(), joined(DeliveryPath::Direct)));
        if let Err(e) = self.publish(&room, Some(id), joined(DeliveryPath::Broadcast)).await {
            log::error!("Failed to broadcast join of {identity} to room {room}: {e}");
        }

        log::info!("{identity} joined room {room} ({} present)", users.len());
        Ok(JoinReply { identity, avatar })
    }

    /// Validate, persist and broadcast one content event.
    ///
    /// The event goes to the room named in the request. The sender is
    /// excluded from the broadcast and gets the event back as the reply.
    pub async fn relay(
        &self,
        session: &Session,
        kind: ContentKind,
        data: &Value,
    ) -> Result<RoomEvent, RelayError> {
        let sender = session.require_binding()?;
        let request = ContentRequest::parse(kind, data)?;
        let mut event = request.into_event(sender, now_millis());

        let message_id = self.log.append(&event).await.map_err(|e| {
            self.stats.persistence_failures.fetch_add(1, Ordering::Relaxed);
            log::error!("Failed to persist {} in room {}: {e}", kind.event_name(), event.room);
            RelayError::Persistence(e)
        })?;
        event.message_id = Some(message_id);

        self.publish(&event.room, Some(session.id()), RoomMessage::Event(event.clone()))
            .await
            .map_err(|e| {
                log::error!("Failed to publish {} to room {}: {e}", kind.event_name(), event.room);
                RelayError::Delivery(e)
            })?;

        self.stats.events_relayed.fetch_add(1, Ordering::Relaxed);
        if kind == ContentKind::Mousemove {
            log::trace!("mousemove from {} in room {}", event.identity, event.room);
        } else {
            log::debug!("{} from {} in room {}", kind.event_name(), event.identity, event.room);
        }
        Ok(event)
    }

    /// Transport heartbeat: refresh presence if the session has joined.
    pub async fn heartbeat(&self, session: &Session) {
        if let Err(e) = self.liveness.on_heartbeat(session).await {
            self.presence_failed("refresh presence", e);
        }
    }

    /// Tear down a session. Idempotent.
    pub async fn disconnect(&self, session: &mut Session) {
        if session.is_terminated() {
            return;
        }
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);

        let id = session.id();
        let Some(binding) = session.terminate() else {
            log::debug!("Connection {id} closed before joining");
            return;
        };

        self.registry.unsubscribe(&binding.room, id).await;
        if let Err(e) = self.presence.remove(id).await {
            self.presence_failed("remove presence", e);
        }

        let users = self.roster(&binding.room).await;
        let left = RoomMessage::Roster(RosterUpdate::UserDisconnected {
            identity: binding.identity.clone(),
            avatar: binding.avatar,
            num_users: users.len(),
            users,
        });
        if let Err(e) = self.publish(&binding.room, Some(id), left).await {
            log::error!("Failed to broadcast disconnect of {}: {e}", binding.identity);
        }

        log::info!("{} left room {}", binding.identity, binding.room);
    }

    pub async fn stats(&self) -> HubStats {
        let fanout = self.registry.stats().await;
        HubStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            events_relayed: self.stats.events_relayed.load(Ordering::Relaxed),
            frames_dropped: fanout.frames_dropped
                + self.stats.direct_dropped.load(Ordering::Relaxed),
            persistence_failures: self.stats.persistence_failures.load(Ordering::Relaxed),
            presence_failures: self.stats.presence_failures.load(Ordering::Relaxed),
            backplane_resubscribes: self.pump_stats.resubscribes.load(Ordering::Relaxed),
            backplane_subscribe_failures: self
                .pump_stats
                .subscribe_failures
                .load(Ordering::Relaxed),
            active_rooms: fanout.active_rooms,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Current roster for `room`. A store failure yields an empty roster.
    async fn roster(&self, room: &str) -> Vec<PresenceRecord> {
        match self.presence.list_in_room(room).await {
            Ok(users) => users,
            Err(e) => {
                self.presence_failed("list room", e);
                Vec::new()
            }
        }
    }

    async fn publish(
        &self,
        room: &str,
        except: Option<ConnectionId>,
        message: RoomMessage,
    ) -> Result<(), BackplaneError> {
        let frame = ServerFrame::room(room, message)
            .encode()
            .map_err(|e| BackplaneError::Codec(e.to_string()))?;
        let payload = Envelope::new(room, except, frame).encode()?;
        self.backplane.publish(&self.config.channel, payload).await
    }

    fn push(&self, session: &Session, frame: &ServerFrame) {
        match frame.encode() {
            Ok(text) => {
                if !session.push(Arc::from(text)) {
                    self.stats.direct_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => log::error!("Failed to encode frame for {}: {e}", session.id()),
        }
    }

    fn presence_failed(&self, action: &str, e: PresenceError) {
        self.stats.presence_failures.fetch_add(1, Ordering::Relaxed);
        log::warn!("Presence store failed to {action}: {e}");
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Forward backplane envelopes to local room members.
///
/// When the subscription ends the pump resubscribes with backoff. Frames
/// published while no subscription is live are lost for this process.
async fn run_pump(
    backplane: Arc<dyn Backplane>,
    channel: String,
    mut subscription: Subscription,
    registry: Arc<RoomRegistry>,
    stats: Arc<PumpStats>,
) {
    let mut backoff = Backoff::default();
    loop {
        while let Some(payload) = subscription.next().await {
            match Envelope::decode(&payload) {
                Ok(envelope) => {
                    registry
                        .deliver(&envelope.room, envelope.except, Arc::from(envelope.frame))
                        .await;
                }
                Err(e) => log::warn!("Dropping undecodable backplane payload: {e}"),
            }
        }
        log::error!("Backplane subscription to {channel} ended, resubscribing");

        subscription = loop {
            let delay = backoff.next_delay();
            tokio::time::sleep(delay).await;
            match backplane.subscribe(&channel).await {
                Ok(subscription) => break subscription,
                Err(e) => {
                    stats.subscribe_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Resubscribe to {channel} failed after {delay:?} backoff: {e}");
                }
            }
        };
        backoff.reset();
        stats.resubscribes.fetch_add(1, Ordering::Relaxed);
        log::info!("Resubscribed to backplane channel {channel}");
    }
}

fn to_data<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::LocalBackplane;
    use crate::presence::MemoryPresenceStore;
    use crate::protocol::PushFrame;
    use crate::storage::MemoryEventLog;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn hub() -> (Hub, Arc<MemoryPresenceStore>, Arc<MemoryEventLog>) {
        let presence = Arc::new(MemoryPresenceStore::new());
        let log = Arc::new(MemoryEventLog::new());
        let hub = Hub::start(
            HubConfig::default(),
            presence.clone(),
            log.clone(),
            Arc::new(LocalBackplane::default()),
        )
        .await
        .unwrap();
        (hub, presence, log)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Arc<str>>) -> ServerFrame {
        let text = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("mailbox closed");
        ServerFrame::decode(&text).unwrap()
    }

    #[tokio::test]
    async fn test_connect_sends_presence_count() {
        let (hub, _, _) = hub().await;
        let (_session, mut rx) = hub.connect().await;

        assert_eq!(next_frame(&mut rx).await, ServerFrame::presence(0));
        let stats = hub.stats().await;
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.active_connections, 1);
    }

    #[tokio::test]
    async fn test_join_binds_session_and_records_presence() {
        let (hub, presence, _) = hub().await;
        let (mut session, mut rx) = hub.connect().await;
        next_frame(&mut rx).await;

        let reply = hub
            .join(&mut session, &json!({ "room": "r1", "role": "T", "id": 5 }))
            .await
            .unwrap();

        assert!(reply.identity.starts_with("T_5_"));
        assert_eq!(reply.avatar, identity::avatar_url(&reply.identity));
        assert_eq!(session.binding().map(|b| b.room.as_str()), Some("r1"));
        assert_eq!(presence.get(session.id()).await.map(|e| e.identity), Some(reply.identity));

        match next_frame(&mut rx).await {
            ServerFrame::Push(PushFrame::Room {
                room,
                data: RoomMessage::Roster(RosterUpdate::UserJoinedSession { from, num_users, .. }),
            }) => {
                assert_eq!(room, "r1");
                assert_eq!(from, DeliveryPath::Direct);
                assert_eq!(num_users, 1);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_join_rejected() {
        let (hub, _, _) = hub().await;
        let (mut session, _rx) = hub.connect().await;
        let data = json!({ "room": "r1", "role": "T", "id": 5 });

        let first = hub.join(&mut session, &data).await.unwrap();
        let err = hub.join(&mut session, &data).await.unwrap_err();

        assert!(matches!(err, RelayError::Validation(_)));
        assert_eq!(session.binding().map(|b| b.identity.clone()), Some(first.identity));
    }

    #[tokio::test]
    async fn test_relay_requires_join() {
        let (hub, _, log) = hub().await;
        let (session, _rx) = hub.connect().await;

        let err = hub
            .relay(&session, ContentKind::SessionUpdate, &json!({ "room": "r1", "game": "chess" }))
            .await
            .unwrap_err();

        assert_eq!(err, RelayError::Unauthenticated);
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn test_relay_attaches_message_id() {
        let (hub, _, log) = hub().await;
        let (mut session, _rx) = hub.connect().await;
        hub.join(&mut session, &json!({ "room": "r1", "role": "S", "id": "9" }))
            .await
            .unwrap();

        let event = hub
            .relay(&session, ContentKind::StudentResponse, &json!({ "room": "r1", "response": "42" }))
            .await
            .unwrap();

        let stored = log.events().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(event.message_id, stored[0].message_id);
        assert!(event.message_id.is_some());
        assert_eq!(hub.stats().await.events_relayed, 1);
    }

    #[tokio::test]
    async fn test_handle_builds_acks() {
        let (hub, _, _) = hub().await;
        let (mut session, _rx) = hub.connect().await;

        let reply = hub
            .handle(&mut session, ClientFrame::new("mousemove", Some(1), json!({})))
            .await;
        assert_eq!(
            reply,
            Some(ServerFrame::ack_err(1, "Can't send a message until you are authenticated"))
        );

        let reply = hub
            .handle(&mut session, ClientFrame::new("chat", Some(2), json!({})))
            .await;
        assert_eq!(reply, Some(ServerFrame::ack_err(2, "Unknown event `chat`")));

        let reply = hub
            .handle(
                &mut session,
                ClientFrame::new("join-session", None, json!({ "room": "r1", "role": "T", "id": 1 })),
            )
            .await;
        assert_eq!(reply, None);
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (hub, presence, _) = hub().await;
        let (mut session, _rx) = hub.connect().await;
        hub.join(&mut session, &json!({ "room": "r1", "role": "T", "id": 1 }))
            .await
            .unwrap();

        hub.disconnect(&mut session).await;
        hub.disconnect(&mut session).await;

        assert!(presence.is_empty().await);
        assert_eq!(hub.stats().await.active_connections, 0);
        assert!(!hub.registry().is_member("r1", session.id()).await);
        assert_eq!(
            hub.relay(&session, ContentKind::Mousemove, &json!({ "room": "r1", "position": "1" }))
                .await
                .unwrap_err(),
            RelayError::Unauthenticated
        );
    }
}
