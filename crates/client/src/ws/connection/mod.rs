//! Channel abstraction used by the connection manager.
//!
//! This module provides the shared types (state, config, errors, the
//! transport seam) and the platform transport implementation.

use std::rc::Weak;
use std::time::Duration;

use url::Url;

/// Lifecycle of the single logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Observable connection state. Mutated only by the connection manager.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub error: Option<ConnectionError>,
    pub connection_id: Option<String>,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.status == ConnectionStatus::Connecting
    }
}

/// Timing for heartbeats and reconnect backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    /// Maximum silence tolerated before the channel is considered dead.
    pub heartbeat_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    /// `min(base * 2^attempt, max)`
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.reconnect_base_delay
            .checked_mul(factor)
            .unwrap_or(self.reconnect_max_delay)
            .min(self.reconnect_max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("invalid connection url: {0}")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server error: {message}")]
    Server { message: String },
    #[error("connection closed permanently ({code}): {reason}")]
    PermanentClose { code: u16, reason: String },
    #[error("event handler failed: {0}")]
    Handler(String),
    #[error("failed to serialize event: {0}")]
    Serialize(String),
}

/// One inbound frame as delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl InboundFrame {
    /// Normalize to text; invalid UTF-8 is replaced rather than rejected.
    pub fn into_text(self) -> String {
        match self {
            InboundFrame::Text(text) => text,
            InboundFrame::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            },
        }
    }
}

/// Something that happened on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Frame(InboundFrame),
    Closed { code: u16, reason: String },
    Errored(String),
}

/// Receiver of channel events, implemented by the connection manager.
pub(crate) trait ChannelListener {
    fn on_channel_event(&self, generation: u64, event: ChannelEvent);
}

/// Where a transport reports events for one channel.
///
/// Each sink is stamped with the generation of the channel it was created
/// for; events reported after that channel was replaced are ignored.
#[derive(Clone)]
pub struct ChannelSink {
    listener: Weak<dyn ChannelListener>,
    generation: u64,
}

impl ChannelSink {
    pub(crate) fn new(listener: Weak<dyn ChannelListener>, generation: u64) -> Self {
        Self {
            listener,
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn opened(&self) {
        self.emit(ChannelEvent::Opened);
    }

    pub fn frame(&self, frame: InboundFrame) {
        self.emit(ChannelEvent::Frame(frame));
    }

    pub fn closed(&self, code: u16, reason: impl Into<String>) {
        self.emit(ChannelEvent::Closed {
            code,
            reason: reason.into(),
        });
    }

    pub fn errored(&self, message: impl Into<String>) {
        self.emit(ChannelEvent::Errored(message.into()));
    }

    fn emit(&self, event: ChannelEvent) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_channel_event(self.generation, event);
        }
    }
}

impl std::fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSink")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Opens channels. Implementations must report through `sink` and never
/// call it synchronously from inside `open`.
pub trait Transport {
    fn open(&self, url: &Url, sink: ChannelSink) -> Result<Box<dyn Channel>, ConnectionError>;
}

/// Write half of an open (or opening) channel.
pub trait Channel {
    fn send_text(&self, text: &str) -> Result<(), ConnectionError>;

    /// Ask the peer to close. The close is reported back through the sink,
    /// unless the manager already moved on to a newer channel.
    fn close(&self, code: u16, reason: &str);
}

#[cfg(not(target_arch = "wasm32"))]
mod connection_native;
#[cfg(not(target_arch = "wasm32"))]
pub use connection_native::TungsteniteTransport;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let config = ConnectionConfig::default();
        let delays: Vec<u64> = (0..10)
            .map(|n| config.reconnect_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![500, 1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000, 30000]
        );
    }

    #[test]
    fn backoff_never_overflows() {
        let config = ConnectionConfig::default();
        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let delay = config.reconnect_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
    }

    #[test]
    fn binary_frames_normalize_to_text() {
        assert_eq!(InboundFrame::Binary(b"pong".to_vec()).into_text(), "pong");
        assert_eq!(
            InboundFrame::Binary(vec![b'o', b'k', 0xff]).into_text(),
            "ok\u{fffd}"
        );
    }
}
