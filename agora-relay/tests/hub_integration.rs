//! Hub-level tests for presence, fan-out and collaborator failures.
//!
//! These tests skip the WebSocket layer and drive `Hub` directly, reading
//! each session's outbound mailbox. Failing collaborators are local test
//! doubles.

use agora_relay::backplane::{Backplane, BackplaneError, LocalBackplane, Subscription};
use agora_relay::hub::{Hub, HubConfig};
use agora_relay::presence::{
    MemoryPresenceStore, PresenceEntry, PresenceError, PresenceRecord, PresenceStore,
};
use agora_relay::protocol::{
    ConnectionId, ContentKind, PushFrame, RoomEvent, RoomMessage, RosterUpdate, ServerFrame,
};
use agora_relay::storage::{DurableLog, LogError, MemoryEventLog, MessageId};
use agora_relay::RelayError;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

// ─── Test doubles ────────────────────────────────────────────────────────────

/// Durable log that rejects every append.
#[derive(Default)]
struct FailingLog {
    attempts: AtomicUsize,
}

#[async_trait]
impl DurableLog for FailingLog {
    async fn append(&self, _event: &RoomEvent) -> Result<MessageId, LogError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(LogError::Unavailable("disk detached".into()))
    }
}

/// Presence store that is down.
struct DownPresence;

#[async_trait]
impl PresenceStore for DownPresence {
    async fn upsert(&self, _id: ConnectionId, _entry: PresenceEntry) -> Result<(), PresenceError> {
        Err(PresenceError::Backend("connection refused".into()))
    }
    async fn list_all(&self) -> Result<Vec<PresenceRecord>, PresenceError> {
        Err(PresenceError::Backend("connection refused".into()))
    }
    async fn list_in_room(&self, _room: &str) -> Result<Vec<PresenceRecord>, PresenceError> {
        Err(PresenceError::Backend("connection refused".into()))
    }
    async fn remove(&self, _id: ConnectionId) -> Result<(), PresenceError> {
        Err(PresenceError::Backend("connection refused".into()))
    }
}

/// Backplane that subscribes fine but refuses to publish.
#[derive(Default)]
struct MuteBackplane {
    inner: LocalBackplane,
}

#[async_trait]
impl Backplane for MuteBackplane {
    async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), BackplaneError> {
        Err(BackplaneError::Publish("broken pipe".into()))
    }
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BackplaneError> {
        self.inner.subscribe(topic).await
    }
}

/// Backplane whose first subscription ends after `first_len` payloads and
/// whose next `failures` subscribe attempts are refused.
struct DroppingBackplane {
    inner: LocalBackplane,
    first_len: usize,
    failures: usize,
    calls: AtomicUsize,
}

impl DroppingBackplane {
    fn new(first_len: usize, failures: usize) -> Self {
        Self {
            inner: LocalBackplane::default(),
            first_len,
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Backplane for DroppingBackplane {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackplaneError> {
        self.inner.publish(topic, payload).await
    }
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BackplaneError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            let stream = self.inner.subscribe(topic).await?;
            return Ok(stream.take(self.first_len).boxed());
        }
        if call <= self.failures {
            return Err(BackplaneError::Subscribe("connection reset".into()));
        }
        self.inner.subscribe(topic).await
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn start_hub(
    presence: Arc<dyn PresenceStore>,
    log: Arc<dyn DurableLog>,
    backplane: Arc<dyn Backplane>,
) -> Hub {
    Hub::start(HubConfig::default(), presence, log, backplane)
        .await
        .unwrap()
}

async fn memory_hub() -> (Hub, Arc<MemoryPresenceStore>, Arc<MemoryEventLog>) {
    let presence = Arc::new(MemoryPresenceStore::new());
    let log = Arc::new(MemoryEventLog::new());
    let hub = start_hub(presence.clone(), log.clone(), Arc::new(LocalBackplane::default())).await;
    (hub, presence, log)
}

async fn recv_frame(rx: &mut mpsc::Receiver<Arc<str>>) -> ServerFrame {
    let text = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("mailbox closed");
    ServerFrame::decode(&text).unwrap()
}

async fn recv_room_message(rx: &mut mpsc::Receiver<Arc<str>>) -> RoomMessage {
    loop {
        match recv_frame(rx).await {
            ServerFrame::Push(PushFrame::Room { data, .. }) => return data,
            ServerFrame::Push(PushFrame::Presence { .. }) => continue,
            other => panic!("Unexpected frame {other:?}"),
        }
    }
}

/// Let the backplane pumps deliver whatever is in flight.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Discard every queued frame once in-flight broadcasts have landed.
async fn drain(rx: &mut mpsc::Receiver<Arc<str>>) {
    settle().await;
    while rx.try_recv().is_ok() {}
}

async fn assert_no_frames(rx: &mut mpsc::Receiver<Arc<str>>) {
    if let Ok(Some(text)) = timeout(Duration::from_millis(150), rx.recv()).await {
        panic!("Expected no frames, got {text}");
    }
}

fn join_data(room: &str, role: &str, id: u32) -> serde_json::Value {
    json!({ "room": room, "role": role, "id": id })
}

// ─── Presence ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_roster_spans_hub_processes() {
    let presence = Arc::new(MemoryPresenceStore::new());
    let backplane = Arc::new(LocalBackplane::default());
    let p1 = start_hub(presence.clone(), Arc::new(MemoryEventLog::new()), backplane.clone()).await;
    let p2 = start_hub(presence.clone(), Arc::new(MemoryEventLog::new()), backplane.clone()).await;

    let (mut a, mut rx_a) = p1.connect().await;
    let (mut b, mut rx_b) = p2.connect().await;
    p1.join(&mut a, &join_data("r1", "T", 1)).await.unwrap();
    drain(&mut rx_a).await;
    p2.join(&mut b, &join_data("r1", "S", 2)).await.unwrap();

    match recv_room_message(&mut rx_b).await {
        RoomMessage::Roster(RosterUpdate::UserJoinedSession { users, num_users, .. }) => {
            assert_eq!(num_users, 2);
            let ids: Vec<ConnectionId> = users.iter().map(|u| u.connection_id).collect();
            assert!(ids.contains(&a.id()));
            assert!(ids.contains(&b.id()));
        }
        other => panic!("Expected roster, got {other:?}"),
    }

    p2.disconnect(&mut b).await;
    match recv_room_message(&mut rx_a).await {
        RoomMessage::Roster(RosterUpdate::UserJoinedSession { .. }) => {}
        other => panic!("Expected B's join first, got {other:?}"),
    }
    match recv_room_message(&mut rx_a).await {
        RoomMessage::Roster(RosterUpdate::UserDisconnected { users, num_users, .. }) => {
            assert_eq!(num_users, 1);
            assert_eq!(users[0].connection_id, a.id());
        }
        other => panic!("Expected user-disconnected, got {other:?}"),
    }
    assert_eq!(presence.len().await, 1);
}

#[tokio::test]
async fn test_heartbeats_never_duplicate_records() {
    let (hub, presence, _) = memory_hub().await;
    let (mut session, _rx) = hub.connect().await;

    hub.heartbeat(&session).await;
    assert!(presence.is_empty().await, "unauthenticated heartbeat must not create a record");

    hub.join(&mut session, &join_data("r1", "T", 1)).await.unwrap();
    for _ in 0..10 {
        hub.heartbeat(&session).await;
    }

    assert_eq!(presence.len().await, 1);
    assert_eq!(presence.list_in_room("r1").await.unwrap().len(), 1);

    hub.disconnect(&mut session).await;
    hub.heartbeat(&session).await;
    assert!(presence.is_empty().await, "heartbeat after disconnect must not resurrect");
}

#[tokio::test]
async fn test_presence_outage_does_not_block_join() {
    let log = Arc::new(MemoryEventLog::new());
    let hub = start_hub(Arc::new(DownPresence), log.clone(), Arc::new(LocalBackplane::default())).await;

    let (mut session, mut rx) = hub.connect().await;
    let reply = hub.join(&mut session, &join_data("r1", "T", 1)).await.unwrap();
    assert!(reply.identity.starts_with("T_1_"));

    match recv_room_message(&mut rx).await {
        RoomMessage::Roster(RosterUpdate::UserJoinedSession { users, num_users, .. }) => {
            assert!(users.is_empty());
            assert_eq!(num_users, 0);
        }
        other => panic!("Expected roster, got {other:?}"),
    }

    hub.heartbeat(&session).await;
    hub.disconnect(&mut session).await;

    // list_all on connect, upsert, list_in_room, heartbeat, remove, list_in_room
    assert_eq!(hub.stats().await.presence_failures, 6);
}

// ─── Relay failures ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_persistence_failure_suppresses_broadcast() {
    let log = Arc::new(FailingLog::default());
    let hub = start_hub(
        Arc::new(MemoryPresenceStore::new()),
        log.clone(),
        Arc::new(LocalBackplane::default()),
    )
    .await;

    let (mut a, _rx_a) = hub.connect().await;
    let (mut b, mut rx_b) = hub.connect().await;
    hub.join(&mut a, &join_data("r1", "T", 1)).await.unwrap();
    settle().await;
    hub.join(&mut b, &join_data("r1", "S", 2)).await.unwrap();
    drain(&mut rx_b).await;

    let err = hub
        .relay(&a, ContentKind::SessionUpdate, &json!({ "room": "r1", "game": "chess" }))
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::Persistence(_)));
    assert_eq!(err.wire_message(), "Failed to store message");
    assert_eq!(log.attempts.load(Ordering::SeqCst), 1);
    assert_no_frames(&mut rx_b).await;

    let stats = hub.stats().await;
    assert_eq!(stats.persistence_failures, 1);
    assert_eq!(stats.events_relayed, 0);
}

#[tokio::test]
async fn test_publish_failure_after_append_is_reported() {
    let log = Arc::new(MemoryEventLog::new());
    let hub = start_hub(
        Arc::new(MemoryPresenceStore::new()),
        log.clone(),
        Arc::new(MuteBackplane::default()),
    )
    .await;

    let (mut a, _rx) = hub.connect().await;
    hub.join(&mut a, &join_data("r1", "T", 1)).await.unwrap();

    let err = hub
        .relay(&a, ContentKind::Mousemove, &json!({ "room": "r1", "position": "3,4" }))
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::Delivery(BackplaneError::Publish(_))));
    assert_eq!(err.wire_message(), "Failed to deliver message");
    // Persisted but undelivered.
    assert_eq!(log.len().await, 1);
}

#[tokio::test]
async fn test_validation_failure_touches_nothing() {
    let (hub, _, log) = memory_hub().await;
    let (mut a, _rx_a) = hub.connect().await;
    let (mut b, mut rx_b) = hub.connect().await;
    hub.join(&mut a, &join_data("r1", "T", 1)).await.unwrap();
    settle().await;
    hub.join(&mut b, &join_data("r1", "S", 2)).await.unwrap();
    drain(&mut rx_b).await;

    for (kind, data) in [
        (ContentKind::Mousemove, json!({ "room": "r1" })),
        (ContentKind::SessionUpdate, json!({ "game": "chess" })),
        (ContentKind::StudentResponse, json!({ "room": "r1", "response": "" })),
    ] {
        let err = hub.relay(&a, kind, &data).await.unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    assert!(log.is_empty().await);
    assert_no_frames(&mut rx_b).await;
}

// ─── Fan-out ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_relay_reaches_every_other_member_once() {
    let (hub, _, _) = memory_hub().await;

    let mut sessions = Vec::new();
    for i in 0..4 {
        let (mut session, rx) = hub.connect().await;
        hub.join(&mut session, &join_data("r1", "S", i + 1)).await.unwrap();
        settle().await;
        sessions.push((session, rx));
    }
    for (_, rx) in sessions.iter_mut() {
        drain(rx).await;
    }

    let sender = &sessions[0].0;
    let sent = hub
        .relay(sender, ContentKind::SessionUpdate, &json!({ "room": "r1", "game": "go" }))
        .await
        .unwrap();

    for (_, rx) in sessions.iter_mut().skip(1) {
        assert_eq!(recv_room_message(rx).await, RoomMessage::Event(sent.clone()));
        assert_no_frames(rx).await;
    }
    assert_no_frames(&mut sessions[0].1).await;
}

#[tokio::test]
async fn test_slow_member_drops_frames_without_stalling_room() {
    let presence = Arc::new(MemoryPresenceStore::new());
    let config = HubConfig {
        outbound_capacity: 2,
        ..HubConfig::default()
    };
    let hub = Hub::start(
        config,
        presence,
        Arc::new(MemoryEventLog::new()),
        Arc::new(LocalBackplane::default()),
    )
    .await
    .unwrap();

    let (mut sender, _rx_sender) = hub.connect().await;
    let (mut slow, _rx_slow) = hub.connect().await;
    hub.join(&mut slow, &join_data("r1", "S", 2)).await.unwrap();
    hub.join(&mut sender, &join_data("r1", "T", 1)).await.unwrap();

    for i in 0..5 {
        let data = json!({ "room": "r1", "position": i.to_string() });
        hub.relay(&sender, ContentKind::Mousemove, &data).await.unwrap();
    }

    // The relay never blocked; let the pump finish and count the drops.
    let mut dropped = 0;
    for _ in 0..40 {
        dropped = hub.stats().await.frames_dropped;
        if dropped >= 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(dropped >= 5, "expected drops for the full mailbox, got {dropped}");
    assert_eq!(hub.stats().await.events_relayed, 5);
}

// ─── Backplane recovery ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_pump_resubscribes_after_subscription_ends() {
    let hub = start_hub(
        Arc::new(MemoryPresenceStore::new()),
        Arc::new(MemoryEventLog::new()),
        Arc::new(DroppingBackplane::new(1, 1)),
    )
    .await;

    // The first join's broadcast is the only payload the first
    // subscription carries.
    let (mut a, _rx_a) = hub.connect().await;
    hub.join(&mut a, &join_data("r1", "T", 1)).await.unwrap();

    let mut stats = hub.stats().await;
    for _ in 0..80 {
        if stats.backplane_resubscribes >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        stats = hub.stats().await;
    }
    assert_eq!(stats.backplane_resubscribes, 1);
    assert_eq!(stats.backplane_subscribe_failures, 1);

    let (mut b, mut rx_b) = hub.connect().await;
    hub.join(&mut b, &join_data("r1", "S", 2)).await.unwrap();
    drain(&mut rx_b).await;

    let sent = hub
        .relay(&a, ContentKind::SessionUpdate, &json!({ "room": "r1", "game": "chess" }))
        .await
        .unwrap();
    assert_eq!(recv_room_message(&mut rx_b).await, RoomMessage::Event(sent));
}
