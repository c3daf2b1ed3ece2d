//! Realtime channel to the SupportKit backend.
//!
//! This module provides:
//! - Connection management with heartbeat and auto-reconnect
//! - Visitor and session authentication on the connection URL
//! - A pluggable [`Transport`] so tests can drive the channel by hand
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 ConnectionManager                   │
//! │   (owns auth, timers and the single active channel) │
//! └─────────────────────────────────────────────────────┘
//!           │ open(url, sink)          ▲ ChannelSink
//!           ▼                          │ (generation-tagged)
//!   ┌──────────────────────┐   ┌──────────────────────┐
//!   │      Transport       │──▶│       Channel        │
//!   │ (tungstenite / mock) │   │  send_text / close   │
//!   └──────────────────────┘   └──────────────────────┘
//!                                      │ RealtimeEvent
//!                                      ▼
//!                         ┌──────────────────────────┐
//!                         │  subscribers (stores via │
//!                         │  SupportClient, UI, …)   │
//!                         └──────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = ConnectionManager::new(
//!     config.ws_url.clone(),
//!     ConnectionConfig::default(),
//!     Rc::new(TungsteniteTransport::new()),
//!     Rc::new(TokioScheduler::new()),
//! );
//! let _sub = manager.subscribe(|event| {
//!     println!("{}", event.event_type());
//!     Ok(())
//! });
//! manager.connect(ConnectionAuth::visitor(visitor_id).website_id(website_id));
//! ```

mod auth;
mod connection;
mod manager;

pub use auth::{build_connection_url, AuthCredentials, AuthKind, ConnectionAuth, ResolvedAuth};
pub use connection::{
    Channel, ChannelEvent, ChannelSink, ConnectionConfig, ConnectionError, ConnectionState,
    ConnectionStatus, InboundFrame, Transport,
};
#[cfg(not(target_arch = "wasm32"))]
pub use connection::TungsteniteTransport;
pub use manager::{ConnectionManager, EventHandler, RawHandler};
