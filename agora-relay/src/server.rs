//! WebSocket transport for the relay hub.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── PresenceStore
//!             ├── connection task ── Hub ── DurableLog
//! Client B ──┘   (one per socket)     └── Backplane ── other hub processes
//! ```
//!
//! Each connection task owns its `Session` and runs one `select!` loop over
//! three sources: inbound WebSocket frames, the session's outbound mailbox,
//! and the ping timer. Handlers for one connection run strictly in order.
//! Whatever ends the loop (close frame, socket error, keep-alive expiry),
//! the hub's disconnect transition runs exactly once afterwards.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::RelayConfig;
use crate::hub::{Hub, HubStats};
use crate::liveness::KeepAlive;
use crate::protocol::ClientFrame;
use crate::session::Session;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    interval: Duration,
    timeout: Duration,
}

/// Pause after an accept error that is not tied to one connection.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors that only affect the connection being accepted.
fn is_connection_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(e.kind(), ConnectionRefused | ConnectionAborted | ConnectionReset)
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    hub: Arc<Hub>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, hub: Arc<Hub>) -> Self {
        Self { config, hub }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Serve connections from an already bound listener.
    ///
    /// Accept errors are logged and never end the loop.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay server listening on {}", listener.local_addr()?);

        let heartbeat = Heartbeat {
            interval: self.config.heartbeat_interval,
            timeout: self.config.heartbeat_timeout,
        };

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) if is_connection_error(&e) => {
                    log::debug!("Accept dropped a failed connection: {e}");
                    continue;
                }
                Err(e) => {
                    // EMFILE and friends clear once other sockets close.
                    log::warn!("Accept failed, retrying in {ACCEPT_RETRY_DELAY:?}: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub, heartbeat).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> HubStats {
        self.hub.stats().await
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }
}

/// Handle a single WebSocket connection from handshake to disconnect.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<Hub>,
    heartbeat: Heartbeat,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (mut session, mut outbound) = hub.connect().await;
    log::info!("WebSocket connection {} established from {addr}", session.id());

    let result = serve(
        &hub,
        &mut session,
        &mut ws_sender,
        &mut ws_receiver,
        &mut outbound,
        heartbeat,
    )
    .await;

    hub.disconnect(&mut session).await;
    log::info!("Connection {} from {addr} closed", session.id());
    result
}

async fn serve(
    hub: &Hub,
    session: &mut Session,
    ws_sender: &mut WsSink,
    ws_receiver: &mut WsSource,
    outbound: &mut mpsc::Receiver<Arc<str>>,
    heartbeat: Heartbeat,
) -> Result<(), BoxError> {
    let mut keep_alive = KeepAlive::new(heartbeat.interval, heartbeat.timeout);
    let mut ping = tokio::time::interval(heartbeat.interval);
    // The first tick fires immediately.
    ping.tick().await;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        keep_alive.touch();
                        match ClientFrame::decode(text.as_str()) {
                            Ok(frame) => {
                                log::debug!("{} -> {} (ack {:?})", session.id(), frame.event, frame.ack);
                                if let Some(reply) = hub.handle(session, frame).await {
                                    ws_sender.send(Message::text(reply.encode()?)).await?;
                                }
                            }
                            Err(e) => log::warn!("Dropping malformed frame from {}: {e}", session.id()),
                        }
                    }

                    Some(Ok(Message::Ping(data))) => {
                        keep_alive.touch();
                        hub.heartbeat(session).await;
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Ok(Message::Pong(_))) => {
                        keep_alive.touch();
                        hub.heartbeat(session).await;
                    }

                    Some(Ok(Message::Binary(_))) => {
                        keep_alive.touch();
                        log::debug!("Ignoring binary frame from {}", session.id());
                    }

                    Some(Ok(Message::Close(_))) | None => break,

                    Some(Err(e)) => {
                        log::warn!("WebSocket error on {}: {e}", session.id());
                        break;
                    }

                    Some(Ok(Message::Frame(_))) => {}
                }
            }

            frame = outbound.recv() => {
                match frame {
                    Some(text) => ws_sender.send(Message::text(text.to_string())).await?,
                    None => break,
                }
            }

            _ = ping.tick() => {
                ws_sender.send(Message::Ping(Vec::new().into())).await?;
            }

            _ = tokio::time::sleep_until(keep_alive.deadline()) => {
                log::info!("Connection {} missed its heartbeat deadline", session.id());
                break;
            }
        }
    }

    let _ = ws_sender.close().await;
    Ok(())
}
