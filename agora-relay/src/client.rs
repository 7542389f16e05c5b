//! WebSocket client for the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Request/ack round trips with correlation ids
//! - A push-event channel for presence counts and room messages
//! - Manual heartbeats (WebSocket pings)
//!
//! Incoming server pings are answered by the WebSocket layer, so a client
//! whose reader task is running stays alive without calling `heartbeat`.
//!
//! The event channel holds [`EVENT_BUFFER`] pushes. Once it is full, further
//! pushes are dropped with a warning so that acks keep flowing to callers
//! that never drain it.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{AckFrame, ClientFrame, JoinReply, ProtocolError, PushFrame, RoomMessage, ServerFrame};

/// Pushes buffered for `take_event_rx` before new ones are dropped.
pub const EVENT_BUFFER: usize = 256;

/// Default time to wait for an ack.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Pushes delivered by the server outside of any request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Global presence count, sent once on connect.
    Presence(usize),
    /// A roster update or content event for `room`.
    Room { room: String, message: RoomMessage },
    /// Connection lost
    Disconnected,
}

/// Outcome of a request that expected an ack.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EmitError {
    /// The server answered with an error string.
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<AckFrame>>>>;

/// The relay client.
pub struct RelayClient {
    url: String,
    outgoing_tx: mpsc::Sender<Message>,
    pending: PendingAcks,
    next_ack: AtomicU64,
    state: Arc<RwLock<ConnectionState>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    reply_timeout: Duration,
}

impl RelayClient {
    /// Connect to `url` (for example `ws://127.0.0.1:3000`).
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(url: impl Into<String>) -> Result<Self, ProtocolError> {
        let url = url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| {
                log::warn!("Failed to connect to {url}: {e}");
                ProtocolError::ConnectionClosed
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        // Writer task: forward outgoing channel to WebSocket
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: route acks to their waiters, everything else to events
        let reader_pending = pending.clone();
        let reader_state = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerFrame::decode(text.as_str()) {
                        Ok(ServerFrame::Ack(ack)) => {
                            if let Some(waiter) = reader_pending.lock().await.remove(&ack.ack) {
                                let _ = waiter.send(ack);
                            }
                        }
                        Ok(ServerFrame::Push(PushFrame::Presence { data })) => {
                            forward_event(&event_tx, ClientEvent::Presence(data.num_users));
                        }
                        Ok(ServerFrame::Push(PushFrame::Room { room, data })) => {
                            forward_event(&event_tx, ClientEvent::Room { room, message: data });
                        }
                        Err(e) => log::warn!("Ignoring undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: fail every outstanding request.
            *reader_state.write().await = ConnectionState::Disconnected;
            reader_pending.lock().await.clear();
            forward_event(&event_tx, ClientEvent::Disconnected);
        });

        Ok(Self {
            url,
            outgoing_tx,
            pending,
            next_ack: AtomicU64::new(1),
            state,
            event_rx: Some(event_rx),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        })
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Send `event` and wait for its ack.
    pub async fn emit(&self, event: &str, data: Value) -> Result<Value, EmitError> {
        let ack = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(ack, tx);

        if let Err(e) = self.send_frame(&ClientFrame::new(event, Some(ack), data)).await {
            self.pending.lock().await.remove(&ack);
            return Err(e.into());
        }

        let reply = match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => {
                self.pending.lock().await.remove(&ack);
                return Err(ProtocolError::Timeout.into());
            }
        };

        match reply.error {
            Some(error) => Err(EmitError::Rejected(error)),
            None => Ok(reply.data.unwrap_or(Value::Null)),
        }
    }

    /// Send `event` without asking for an ack.
    pub async fn send(&self, event: &str, data: Value) -> Result<(), ProtocolError> {
        self.send_frame(&ClientFrame::new(event, None, data)).await
    }

    /// Join `room` as `role`/`id`.
    pub async fn join(&self, room: &str, role: &str, id: Value) -> Result<JoinReply, EmitError> {
        let data = self
            .emit(
                "join-session",
                serde_json::json!({ "room": room, "role": role, "id": id }),
            )
            .await?;
        serde_json::from_value(data).map_err(|e| ProtocolError::Malformed(e.to_string()).into())
    }

    /// Send a WebSocket ping.
    pub async fn heartbeat(&self) -> Result<(), ProtocolError> {
        self.outgoing_tx
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Send a close frame. The reader task reports `Disconnected` once the
    /// server acknowledges.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.outgoing_tx
            .send(Message::Close(None))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Requests still waiting for an ack.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), ProtocolError> {
        let text = frame.encode()?;
        self.outgoing_tx
            .send(Message::text(text))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

/// Hand a push to the event channel without blocking the reader task.
fn forward_event(event_tx: &mpsc::Sender<ClientEvent>, event: ClientEvent) -> bool {
    match event_tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            log::warn!("Event channel full, dropping {event:?}");
            false
        }
        // Receiver dropped: nobody is listening.
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
