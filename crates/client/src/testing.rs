//! Test doubles for driving the realtime channel without a network.
//!
//! [`MockTransport`] records every channel it opens. The `simulate_*`
//! methods act on the most recently opened channel, the `*_on` variants on
//! a specific one.

use std::cell::RefCell;
use std::rc::Rc;

use url::Url;

use crate::ws::{Channel, ChannelSink, ConnectionError, InboundFrame, Transport};

#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Rc<RefCell<MockState>>,
}

#[derive(Default)]
struct MockState {
    channels: Vec<MockChannelRecord>,
    fail_next_open: Option<ConnectionError>,
}

struct MockChannelRecord {
    url: Url,
    sink: ChannelSink,
    io: Rc<RefCell<MockIo>>,
}

#[derive(Default)]
struct MockIo {
    sent: Vec<String>,
    close_request: Option<(u16, String)>,
}

struct MockChannel {
    io: Rc<RefCell<MockIo>>,
}

impl Channel for MockChannel {
    fn send_text(&self, text: &str) -> Result<(), ConnectionError> {
        let mut io = self.io.borrow_mut();
        if io.close_request.is_some() {
            return Err(ConnectionError::NotConnected);
        }
        io.sent.push(text.to_string());
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        self.io
            .borrow_mut()
            .close_request
            .get_or_insert_with(|| (code, reason.to_string()));
    }
}

impl Transport for MockTransport {
    fn open(&self, url: &Url, sink: ChannelSink) -> Result<Box<dyn Channel>, ConnectionError> {
        let mut state = self.inner.borrow_mut();
        if let Some(error) = state.fail_next_open.take() {
            return Err(error);
        }
        let io = Rc::new(RefCell::new(MockIo::default()));
        state.channels.push(MockChannelRecord {
            url: url.clone(),
            sink,
            io: io.clone(),
        });
        Ok(Box::new(MockChannel { io }))
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of channels opened so far.
    pub fn connection_count(&self) -> usize {
        self.inner.borrow().channels.len()
    }

    pub fn urls(&self) -> Vec<Url> {
        self.inner
            .borrow()
            .channels
            .iter()
            .map(|channel| channel.url.clone())
            .collect()
    }

    pub fn last_url(&self) -> Option<Url> {
        self.inner
            .borrow()
            .channels
            .last()
            .map(|channel| channel.url.clone())
    }

    /// Make the next `open` fail with `error`.
    pub fn fail_next_open(&self, error: ConnectionError) {
        self.inner.borrow_mut().fail_next_open = Some(error);
    }

    /// Frames sent on the latest channel.
    pub fn sent_frames(&self) -> Vec<String> {
        self.inner
            .borrow()
            .channels
            .last()
            .map(|channel| channel.io.borrow().sent.clone())
            .unwrap_or_default()
    }

    /// Frames sent on the channel at `index`.
    pub fn sent_frames_on(&self, index: usize) -> Vec<String> {
        self.inner
            .borrow()
            .channels
            .get(index)
            .map(|channel| channel.io.borrow().sent.clone())
            .unwrap_or_default()
    }

    /// Close requested by the client on the channel at `index`.
    pub fn close_request(&self, index: usize) -> Option<(u16, String)> {
        self.inner
            .borrow()
            .channels
            .get(index)
            .and_then(|channel| channel.io.borrow().close_request.clone())
    }

    pub fn simulate_open(&self) {
        if let Some(sink) = self.latest_sink() {
            sink.opened();
        }
    }

    pub fn simulate_message(&self, text: &str) {
        if let Some(sink) = self.latest_sink() {
            sink.frame(InboundFrame::Text(text.to_string()));
        }
    }

    pub fn simulate_binary(&self, bytes: &[u8]) {
        if let Some(sink) = self.latest_sink() {
            sink.frame(InboundFrame::Binary(bytes.to_vec()));
        }
    }

    pub fn simulate_close(&self, code: u16, reason: &str) {
        if let Some(sink) = self.latest_sink() {
            sink.closed(code, reason);
        }
    }

    pub fn simulate_close_on(&self, index: usize, code: u16, reason: &str) {
        let sink = self
            .inner
            .borrow()
            .channels
            .get(index)
            .map(|channel| channel.sink.clone());
        if let Some(sink) = sink {
            sink.closed(code, reason);
        }
    }

    pub fn simulate_error(&self, message: &str) {
        if let Some(sink) = self.latest_sink() {
            sink.errored(message);
        }
    }

    // The borrow must end before the sink calls back into the manager.
    fn latest_sink(&self) -> Option<ChannelSink> {
        self.inner
            .borrow()
            .channels
            .last()
            .map(|channel| channel.sink.clone())
    }
}

/// Builders for model values used across unit and integration tests.
pub mod fixtures {
    use chrono::{DateTime, TimeDelta, Utc};
    use supportkit_shared::{
        Conversation, ConversationStatus, TimelineItem, TimelineItemType, TimelineItemVisibility,
        TimelinePart,
    };

    pub const ORGANIZATION_ID: &str = "org_1";
    pub const WEBSITE_ID: &str = "ws_1";
    pub const VISITOR_ID: &str = "vis_1";

    /// 2026-01-01T00:00:00Z plus `seconds`.
    pub fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_225_600, 0).unwrap_or_default()
            + TimeDelta::seconds(seconds)
    }

    /// A visitor-authored text message.
    pub fn message(id: &str, conversation_id: &str, seconds: i64) -> TimelineItem {
        TimelineItem {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            organization_id: ORGANIZATION_ID.to_string(),
            item_type: TimelineItemType::Message,
            text: Some(format!("message {id}")),
            parts: vec![TimelinePart::Text {
                text: format!("message {id}"),
            }],
            visibility: TimelineItemVisibility::Public,
            user_id: None,
            ai_agent_id: None,
            visitor_id: Some(VISITOR_ID.to_string()),
            created_at: at(seconds),
            deleted_at: None,
        }
    }

    pub fn conversation(id: &str, seconds: i64) -> Conversation {
        Conversation {
            id: id.to_string(),
            title: None,
            status: ConversationStatus::Open,
            visitor_id: VISITOR_ID.to_string(),
            website_id: WEBSITE_ID.to_string(),
            created_at: at(seconds),
            updated_at: at(seconds),
            deleted_at: None,
            last_item: None,
        }
    }
}
