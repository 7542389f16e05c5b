//! # agora-relay: real-time room relay with shared presence
//!
//! Clients join a named room over WebSocket, exchange typed events with
//! everyone else in that room, and see a live roster. Hub processes can be
//! replicated: presence lives in a shared store and room broadcasts cross
//! processes over a pub/sub backplane.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WebSocket     ┌──────────────┐      ┌───────────────┐
//! │ RelayClient  │ ◄──────────────► │ RelayServer  │ ───► │ Hub           │
//! │ (per user)   │   JSON + acks    │ (per process)│      │ session gate  │
//! └──────────────┘                  └──────────────┘      │ relay         │
//!                                                         │ liveness      │
//!                                                         └──┬────┬────┬──┘
//!                                          ┌─────────────────┘    │    └──────────────┐
//!                                          ▼                      ▼                   ▼
//!                                   ┌──────────────┐      ┌──────────────┐    ┌──────────────┐
//!                                   │PresenceStore │      │ DurableLog   │    │ Backplane    │
//!                                   │ memory/redis │      │ memory/rocks │    │ local/redis  │
//!                                   └──────────────┘      └──────────────┘    └──────┬───────┘
//!                                                                                    │ pump
//!                                                                                    ▼
//!                                                                            ┌──────────────┐
//!                                                                            │ RoomRegistry │
//!                                                                            │ (fan-out)    │
//!                                                                            └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire frames and room payloads
//! - [`session`]: Per-connection state machine and join validation
//! - [`identity`]: Identity and avatar derivation
//! - [`relay`]: Content event validation
//! - [`hub`]: Orchestrates sessions, presence, persistence and fan-out
//! - [`liveness`]: Heartbeat presence refresh and keep-alive deadline
//! - [`broadcast`]: Local room fan-out with backpressure
//! - [`backplane`]: Cross-process pub/sub
//! - [`presence`]: Shared presence store
//! - [`storage`]: Durable event log
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client with ack correlation
//! - [`config`]: Environment configuration

pub mod backplane;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod identity;
pub mod liveness;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use backplane::{Backplane, BackplaneError, Envelope, LocalBackplane, RedisBackplane};
pub use broadcast::{FanoutStats, RoomRegistry};
pub use client::{ClientEvent, ConnectionState, EmitError, RelayClient};
pub use config::{ConfigError, RelayConfig};
pub use error::RelayError;
pub use hub::{Hub, HubConfig, HubStats};
pub use liveness::{KeepAlive, LivenessMonitor};
pub use presence::{
    MemoryPresenceStore, PresenceEntry, PresenceError, PresenceRecord, PresenceStore,
    RedisPresenceStore,
};
pub use protocol::{
    ClientFrame, ConnectionId, ContentKind, DeliveryPath, EventContent, JoinReply,
    ProtocolError, RoomEvent, RoomMessage, RosterUpdate, ServerFrame,
};
pub use server::RelayServer;
pub use session::{Binding, Session, SessionState};
pub use storage::{DurableLog, LogError, MemoryEventLog, RocksEventLog, StoreConfig};
