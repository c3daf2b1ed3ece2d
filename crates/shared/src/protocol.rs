//! Realtime wire protocol: control literals, close codes, event tags and the
//! typed payload each tag carries.
//!
//! Every frame on the channel is UTF-8 text. A frame is either one of the
//! literal control tokens below or a single JSON object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EventDecodeError;
use crate::models::{Actor, ActorType, Conversation, TimelineItem};

/// Outbound keep-alive literal.
pub const PING_FRAME: &str = "ping";
/// Inbound reply to [`PING_FRAME`].
pub const PONG_FRAME: &str = "pong";
/// Outbound presence keep-alive literal.
pub const PRESENCE_PING_FRAME: &str = "presence:ping";
/// `type` of the control envelope sent once the server accepted a socket.
pub const CONNECTION_ESTABLISHED: &str = "CONNECTION_ESTABLISHED";

/// WebSocket close codes with meaning to the client.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    /// Credentials rejected.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Session rejected by the server.
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Application code used by the client when the heartbeat timed out.
    pub const HEARTBEAT_TIMEOUT: u16 = 4000;
}

/// Closes that must not be retried with the same credentials.
pub fn is_permanent_close(code: u16) -> bool {
    matches!(
        code,
        close_code::POLICY_VIOLATION | close_code::INTERNAL_ERROR
    )
}

// --- Event tags ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RealtimeEventType {
    #[serde(rename = "conversationCreated")]
    ConversationCreated,
    #[serde(rename = "conversationUpdated")]
    ConversationUpdated,
    #[serde(rename = "timelineItemCreated")]
    TimelineItemCreated,
    #[serde(rename = "timelineItemUpdated")]
    TimelineItemUpdated,
    #[serde(rename = "conversationSeen")]
    ConversationSeen,
    #[serde(rename = "conversationTyping")]
    ConversationTyping,
    #[serde(rename = "visitorIdentified")]
    VisitorIdentified,
    #[serde(rename = "userConnected")]
    UserConnected,
    #[serde(rename = "userDisconnected")]
    UserDisconnected,
    #[serde(rename = "visitorConnected")]
    VisitorConnected,
    #[serde(rename = "visitorDisconnected")]
    VisitorDisconnected,
    #[serde(rename = "userPresenceUpdate")]
    UserPresenceUpdate,
}

impl RealtimeEventType {
    pub const ALL: [RealtimeEventType; 12] = [
        RealtimeEventType::ConversationCreated,
        RealtimeEventType::ConversationUpdated,
        RealtimeEventType::TimelineItemCreated,
        RealtimeEventType::TimelineItemUpdated,
        RealtimeEventType::ConversationSeen,
        RealtimeEventType::ConversationTyping,
        RealtimeEventType::VisitorIdentified,
        RealtimeEventType::UserConnected,
        RealtimeEventType::UserDisconnected,
        RealtimeEventType::VisitorConnected,
        RealtimeEventType::VisitorDisconnected,
        RealtimeEventType::UserPresenceUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RealtimeEventType::ConversationCreated => "conversationCreated",
            RealtimeEventType::ConversationUpdated => "conversationUpdated",
            RealtimeEventType::TimelineItemCreated => "timelineItemCreated",
            RealtimeEventType::TimelineItemUpdated => "timelineItemUpdated",
            RealtimeEventType::ConversationSeen => "conversationSeen",
            RealtimeEventType::ConversationTyping => "conversationTyping",
            RealtimeEventType::VisitorIdentified => "visitorIdentified",
            RealtimeEventType::UserConnected => "userConnected",
            RealtimeEventType::UserDisconnected => "userDisconnected",
            RealtimeEventType::VisitorConnected => "visitorConnected",
            RealtimeEventType::VisitorDisconnected => "visitorDisconnected",
            RealtimeEventType::UserPresenceUpdate => "userPresenceUpdate",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl std::fmt::Display for RealtimeEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Payloads ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    pub organization_id: String,
    pub website_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    pub conversation_id: String,
    pub conversation: Conversation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItemPayload {
    pub organization_id: String,
    pub website_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    pub conversation_id: String,
    pub item: TimelineItem,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSeenPayload {
    pub organization_id: String,
    pub website_id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_type: Option<ActorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_agent_id: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

impl ConversationSeenPayload {
    pub fn actor(&self) -> Option<Actor> {
        Actor::resolve(
            self.actor_type,
            self.actor_id.as_deref(),
            self.user_id.as_deref(),
            self.visitor_id.as_deref(),
            self.ai_agent_id.as_deref(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTypingPayload {
    pub organization_id: String,
    pub website_id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_agent_id: Option<String>,
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visitor_preview: Option<String>,
}

impl ConversationTypingPayload {
    /// Who is typing. `visitorId` doubles as routing information on events
    /// about team members and agents, so it is only the actor when no user
    /// or AI agent is named.
    pub fn actor(&self) -> Option<Actor> {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        present(&self.user_id)
            .map(Actor::user)
            .or_else(|| present(&self.ai_agent_id).map(Actor::ai_agent))
            .or_else(|| present(&self.visitor_id).map(Actor::visitor))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisitorIdentifiedPayload {
    pub organization_id: String,
    pub website_id: String,
    pub visitor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub organization_id: String,
    pub website_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Tag plus typed payload. Deserializing through this enum is the schema
/// check every inbound event goes through.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum RealtimeEventPayload {
    #[serde(rename = "conversationCreated")]
    ConversationCreated(ConversationPayload),
    #[serde(rename = "conversationUpdated")]
    ConversationUpdated(ConversationPayload),
    #[serde(rename = "timelineItemCreated")]
    TimelineItemCreated(TimelineItemPayload),
    #[serde(rename = "timelineItemUpdated")]
    TimelineItemUpdated(TimelineItemPayload),
    #[serde(rename = "conversationSeen")]
    ConversationSeen(ConversationSeenPayload),
    #[serde(rename = "conversationTyping")]
    ConversationTyping(ConversationTypingPayload),
    #[serde(rename = "visitorIdentified")]
    VisitorIdentified(VisitorIdentifiedPayload),
    #[serde(rename = "userConnected")]
    UserConnected(PresencePayload),
    #[serde(rename = "userDisconnected")]
    UserDisconnected(PresencePayload),
    #[serde(rename = "visitorConnected")]
    VisitorConnected(PresencePayload),
    #[serde(rename = "visitorDisconnected")]
    VisitorDisconnected(PresencePayload),
    #[serde(rename = "userPresenceUpdate")]
    UserPresenceUpdate(PresencePayload),
}

impl RealtimeEventPayload {
    pub fn event_type(&self) -> RealtimeEventType {
        match self {
            Self::ConversationCreated(_) => RealtimeEventType::ConversationCreated,
            Self::ConversationUpdated(_) => RealtimeEventType::ConversationUpdated,
            Self::TimelineItemCreated(_) => RealtimeEventType::TimelineItemCreated,
            Self::TimelineItemUpdated(_) => RealtimeEventType::TimelineItemUpdated,
            Self::ConversationSeen(_) => RealtimeEventType::ConversationSeen,
            Self::ConversationTyping(_) => RealtimeEventType::ConversationTyping,
            Self::VisitorIdentified(_) => RealtimeEventType::VisitorIdentified,
            Self::UserConnected(_) => RealtimeEventType::UserConnected,
            Self::UserDisconnected(_) => RealtimeEventType::UserDisconnected,
            Self::VisitorConnected(_) => RealtimeEventType::VisitorConnected,
            Self::VisitorDisconnected(_) => RealtimeEventType::VisitorDisconnected,
            Self::UserPresenceUpdate(_) => RealtimeEventType::UserPresenceUpdate,
        }
    }

    /// `(organizationId, websiteId, visitorId)` as carried by the payload.
    fn routing(&self) -> (&str, &str, Option<&str>) {
        match self {
            Self::ConversationCreated(p) | Self::ConversationUpdated(p) => (
                p.organization_id.as_str(),
                p.website_id.as_str(),
                p.visitor_id.as_deref(),
            ),
            Self::TimelineItemCreated(p) | Self::TimelineItemUpdated(p) => (
                p.organization_id.as_str(),
                p.website_id.as_str(),
                p.visitor_id.as_deref(),
            ),
            Self::ConversationSeen(p) => (
                p.organization_id.as_str(),
                p.website_id.as_str(),
                p.visitor_id.as_deref(),
            ),
            Self::ConversationTyping(p) => (
                p.organization_id.as_str(),
                p.website_id.as_str(),
                p.visitor_id.as_deref(),
            ),
            Self::VisitorIdentified(p) => (
                p.organization_id.as_str(),
                p.website_id.as_str(),
                Some(p.visitor_id.as_str()),
            ),
            Self::UserConnected(p)
            | Self::UserDisconnected(p)
            | Self::VisitorConnected(p)
            | Self::VisitorDisconnected(p)
            | Self::UserPresenceUpdate(p) => (
                p.organization_id.as_str(),
                p.website_id.as_str(),
                p.visitor_id.as_deref(),
            ),
        }
    }
}

// --- Envelope ---

/// A structured realtime event, inbound or outbound.
///
/// Serializes to `{type, payload, organizationId, websiteId, visitorId?}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    #[serde(flatten)]
    pub payload: RealtimeEventPayload,
    pub organization_id: String,
    pub website_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
}

impl RealtimeEvent {
    /// Build an event whose routing fields are lifted from the payload.
    pub fn new(payload: RealtimeEventPayload) -> Self {
        let (organization_id, website_id, visitor_id) = {
            let (org, site, visitor) = payload.routing();
            (org.to_string(), site.to_string(), visitor.map(str::to_string))
        };
        Self {
            payload,
            organization_id,
            website_id,
            visitor_id,
        }
    }

    /// Validate a raw payload against the schema of `event_type`.
    pub fn from_parts(
        event_type: RealtimeEventType,
        payload: Value,
    ) -> Result<Self, EventDecodeError> {
        let tag = event_type.as_str();
        let Some(fields) = payload.as_object() else {
            return Err(EventDecodeError::Schema {
                event_type: tag.to_string(),
                message: "payload is not an object".to_string(),
            });
        };
        for field in ["organizationId", "websiteId"] {
            if !fields.get(field).is_some_and(Value::is_string) {
                return Err(EventDecodeError::MissingField {
                    event_type: tag.to_string(),
                    field,
                });
            }
        }

        let tagged = serde_json::json!({ "type": tag, "payload": payload });
        let payload = serde_json::from_value::<RealtimeEventPayload>(tagged).map_err(|e| {
            EventDecodeError::Schema {
                event_type: tag.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(Self::new(payload))
    }

    pub fn event_type(&self) -> RealtimeEventType {
        self.payload.event_type()
    }

    /// Conversation the event is scoped to, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        match &self.payload {
            RealtimeEventPayload::ConversationCreated(p)
            | RealtimeEventPayload::ConversationUpdated(p) => Some(p.conversation_id.as_str()),
            RealtimeEventPayload::TimelineItemCreated(p)
            | RealtimeEventPayload::TimelineItemUpdated(p) => Some(p.conversation_id.as_str()),
            RealtimeEventPayload::ConversationSeen(p) => Some(p.conversation_id.as_str()),
            RealtimeEventPayload::ConversationTyping(p) => Some(p.conversation_id.as_str()),
            _ => None,
        }
    }
}

// --- Inbound decoding ---

/// What a single inbound text frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Pong,
    ConnectionEstablished { connection_id: Option<String> },
    ServerError { message: String },
    /// A known event tag; the payload has not been validated yet.
    Event {
        event_type: RealtimeEventType,
        payload: Value,
    },
    /// Anything else. Dropped by the client.
    Invalid,
}

/// Classify one inbound frame. Never fails: unparseable input is `Invalid`.
pub fn decode_inbound(text: &str) -> InboundMessage {
    let trimmed = text.trim();
    if trimmed == PONG_FRAME {
        return InboundMessage::Pong;
    }

    let Ok(Value::Object(mut fields)) = serde_json::from_str::<Value>(trimmed) else {
        return InboundMessage::Invalid;
    };

    let tag = fields.get("type").and_then(Value::as_str).map(str::to_string);

    if tag.as_deref() == Some(CONNECTION_ESTABLISHED) {
        let connection_id = fields
            .get("payload")
            .and_then(|p| p.get("connectionId"))
            .and_then(Value::as_str)
            .map(str::to_string);
        return InboundMessage::ConnectionEstablished { connection_id };
    }

    if fields.contains_key("error") {
        if let Some(message) = fields.get("message").and_then(Value::as_str) {
            return InboundMessage::ServerError {
                message: message.to_string(),
            };
        }
    }

    match tag.as_deref().and_then(RealtimeEventType::from_tag) {
        Some(event_type) => InboundMessage::Event {
            event_type,
            payload: fields.remove("payload").unwrap_or(Value::Null),
        },
        None => InboundMessage::Invalid,
    }
}
