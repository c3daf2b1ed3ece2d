//! SupportKit client SDK
//!
//! Keeps a UI in sync with the SupportKit backend over a persistent
//! realtime channel and the REST API. The pieces:
//!
//! - [`ws::ConnectionManager`]: one authenticated channel with heartbeats
//!   and capped exponential reconnects.
//! - [`stores`]: normalized, reference-stable entity stores fed by fetches,
//!   optimistic writes and realtime events.
//! - [`SupportClient`]: the facade that wires both to the REST API.
//!
//! Everything runs on a single thread. Timers and deferred notifications go
//! through a [`scheduler::Scheduler`] so tests can run on a virtual clock.

pub mod logging;

pub mod api_client;
pub mod client;
pub mod config;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod stores;
#[doc(hidden)]
pub mod testing;
pub mod typing_reporter;
pub mod ws;

pub use api_client::{ApiClient, SupportApi};
pub use client::{
    ClientError, IdentifyParams, InitiateConversationParams, SendMessageParams, SupportClient,
    VisitorSession,
};
pub use config::ClientConfig;
pub use scheduler::{Scheduler, TokioScheduler, VirtualScheduler};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
pub use store::{Store, Unsubscribe};
pub use typing_reporter::{TypingReporter, TypingReporterConfig, TypingSignal};
pub use ws::{ConnectionAuth, ConnectionConfig, ConnectionError, ConnectionManager, ConnectionState};
