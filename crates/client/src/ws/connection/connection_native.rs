//! Native WebSocket transport using tokio-tungstenite.

use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use supportkit_shared::close_code;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use url::Url;

use super::{Channel, ChannelSink, ConnectionError, InboundFrame, Transport};

/// Commands queued from the manager to the socket task.
#[derive(Debug)]
enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Production transport. Each `open` spawns one local task that owns the
/// socket for the channel's whole life, so it must run inside a
/// [`tokio::task::LocalSet`].
#[derive(Debug, Default, Clone)]
pub struct TungsteniteTransport;

impl TungsteniteTransport {
    pub fn new() -> Self {
        Self
    }
}

struct TungsteniteChannel {
    sender: UnboundedSender<Outbound>,
}

impl Channel for TungsteniteChannel {
    fn send_text(&self, text: &str) -> Result<(), ConnectionError> {
        self.sender
            .unbounded_send(Outbound::Text(text.to_string()))
            .map_err(|_| ConnectionError::NotConnected)
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.sender.unbounded_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

impl Transport for TungsteniteTransport {
    fn open(&self, url: &Url, sink: ChannelSink) -> Result<Box<dyn Channel>, ConnectionError> {
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ConnectionError::InvalidUrl(format!(
                    "unsupported scheme `{other}`"
                )))
            }
        }

        let (sender, mut receiver) = unbounded::<Outbound>();
        let url = url.to_string();

        tokio::task::spawn_local(async move {
            let ws_stream = match connect_async(url.as_str()).await {
                Ok((ws_stream, _response)) => ws_stream,
                Err(e) => {
                    crate::log_error!("WebSocket connect failed: {}", e);
                    sink.errored(e.to_string());
                    sink.closed(close_code::ABNORMAL, e.to_string());
                    return;
                }
            };
            crate::log_debug!("WebSocket connected (generation {})", sink.generation());
            sink.opened();

            let (mut write, mut read) = ws_stream.split();

            let (code, reason) = loop {
                tokio::select! {
                    outbound = receiver.next() => match outbound {
                        Some(Outbound::Text(text)) => {
                            if let Err(e) = write.send(Message::Text(text.into())).await {
                                crate::log_error!("WebSocket send failed: {}", e);
                                sink.errored(e.to_string());
                                break (close_code::ABNORMAL, e.to_string());
                            }
                        }
                        Some(Outbound::Close { code, reason }) => {
                            let frame = CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.clone().into(),
                            };
                            let _ = write.send(Message::Close(Some(frame))).await;
                            break (code, reason);
                        }
                        None => {
                            // Channel handle dropped without an explicit close.
                            let _ = write.send(Message::Close(None)).await;
                            break (close_code::NORMAL, String::new());
                        }
                    },
                    inbound = read.next() => match inbound {
                        Some(Ok(Message::Text(text))) => {
                            sink.frame(InboundFrame::Text(text.as_str().to_owned()));
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            sink.frame(InboundFrame::Binary(bytes.to_vec()));
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break match frame {
                                Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                                None => (close_code::NO_STATUS, String::new()),
                            };
                        }
                        Some(Ok(_)) => {
                            // Protocol-level ping/pong is answered by tungstenite.
                        }
                        Some(Err(e)) => {
                            crate::log_error!("WebSocket read error: {}", e);
                            sink.errored(e.to_string());
                            break (close_code::ABNORMAL, e.to_string());
                        }
                        None => break (close_code::ABNORMAL, "stream ended".to_string()),
                    },
                }
            };

            crate::log_info!("WebSocket closed ({}): {}", code, reason);
            sink.closed(code, reason);
        });

        Ok(Box::new(TungsteniteChannel { sender }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ChannelEvent, ChannelListener};
    use super::*;

    struct Nobody;

    impl ChannelListener for Nobody {
        fn on_channel_event(&self, _generation: u64, _event: ChannelEvent) {}
    }

    #[test]
    fn rejects_non_websocket_schemes() {
        let transport = TungsteniteTransport::new();
        let url = Url::parse("https://api.example.com/ws").unwrap();
        let sink = ChannelSink::new(std::rc::Weak::<Nobody>::new(), 0);
        let err = transport.open(&url, sink).err().unwrap();
        assert!(matches!(err, ConnectionError::InvalidUrl(_)));
    }
}
