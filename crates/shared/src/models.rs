//! Shared data models for the SupportKit REST API and realtime payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Actors ---

/// Kind of participant that can author items, read conversations or type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ActorType {
    Visitor,
    User,
    AiAgent,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Visitor => "visitor",
            ActorType::User => "user",
            ActorType::AiAgent => "aiAgent",
        }
    }
}

/// A resolved actor: who did something, independent of which optional
/// `userId` / `visitorId` / `aiAgentId` field carried it on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Actor {
    pub actor_type: ActorType,
    pub actor_id: String,
}

impl Actor {
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
        }
    }

    pub fn visitor(id: impl Into<String>) -> Self {
        Self::new(ActorType::Visitor, id)
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(ActorType::User, id)
    }

    pub fn ai_agent(id: impl Into<String>) -> Self {
        Self::new(ActorType::AiAgent, id)
    }

    /// Resolve an actor from optional explicit fields, then from the first
    /// non-empty of `user_id`, `visitor_id`, `ai_agent_id` (in that order).
    pub fn resolve(
        explicit_type: Option<ActorType>,
        explicit_id: Option<&str>,
        user_id: Option<&str>,
        visitor_id: Option<&str>,
        ai_agent_id: Option<&str>,
    ) -> Option<Self> {
        fn present(value: Option<&str>) -> Option<&str> {
            value.map(str::trim).filter(|v| !v.is_empty())
        }

        if let (Some(actor_type), Some(id)) = (explicit_type, present(explicit_id)) {
            return Some(Self::new(actor_type, id));
        }
        if let Some(id) = present(user_id) {
            return Some(Self::user(id));
        }
        if let Some(id) = present(visitor_id) {
            return Some(Self::visitor(id));
        }
        present(ai_agent_id).map(Self::ai_agent)
    }
}

// --- Conversations ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConversationStatus {
    #[default]
    Open,
    Resolved,
    Spam,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub status: ConversationStatus,
    pub visitor_id: String,
    pub website_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Most recent timeline item, when the backend includes it in listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_item: Option<TimelineItem>,
}

/// Page-number pagination used by the conversation listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationsPagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub has_more: bool,
}

// --- Timeline ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TimelineItemType {
    #[default]
    Message,
    Event,
    Identification,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TimelineItemVisibility {
    #[default]
    Public,
    Private,
}

/// One renderable part of a timeline item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TimelinePart {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    File {
        url: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Event {
        event_type: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Parts of a kind this SDK does not know about yet.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItem {
    pub id: String,
    pub conversation_id: String,
    pub organization_id: String,
    #[serde(rename = "type", default)]
    pub item_type: TimelineItemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub parts: Vec<TimelinePart>,
    #[serde(default)]
    pub visibility: TimelineItemVisibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TimelineItem {
    /// The author of this item. A well-formed item has at most one sender
    /// field set; if several are set the user wins, then the AI agent.
    pub fn sender(&self) -> Option<Actor> {
        if let Some(id) = self.user_id.as_deref() {
            return Some(Actor::user(id));
        }
        if let Some(id) = self.ai_agent_id.as_deref() {
            return Some(Actor::ai_agent(id));
        }
        self.visitor_id.as_deref().map(Actor::visitor)
    }

    pub fn has_single_sender(&self) -> bool {
        [&self.user_id, &self.ai_agent_id, &self.visitor_id]
            .iter()
            .filter(|id| id.is_some())
            .count()
            <= 1
    }
}

/// A page of timeline items for one conversation (cursor pagination).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimelinePage {
    pub items: Vec<TimelineItem>,
    #[serde(default)]
    pub has_next_page: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

// --- Seen receipts ---

/// One seen receipt as returned by the REST snapshot endpoint. Older
/// backends only fill the sender-style id fields, newer ones also send
/// explicit actor fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSeenEntry {
    pub conversation_id: String,
    #[serde(default)]
    pub actor_type: Option<ActorType>,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub visitor_id: Option<String>,
    #[serde(default)]
    pub ai_agent_id: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

impl ConversationSeenEntry {
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

// --- Visitors & contacts ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Visitor {
    pub id: String,
    pub website_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub contact_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// --- REST request/response types ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListConversationsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConversationStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListConversationsResponse {
    pub conversations: Vec<Conversation>,
    pub pagination: ConversationsPagination,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TimelineQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub conversation_id: String,
    pub visitor_id: String,
    /// Items shown before the conversation existed server-side, plus the
    /// first message that triggered its creation.
    pub default_timeline_items: Vec<TimelineItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationResponse {
    pub conversation: Conversation,
    pub initial_timeline_items: Vec<TimelineItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendTimelineItemRequest {
    pub conversation_id: String,
    pub item: TimelineItem,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendTimelineItemResponse {
    pub item: TimelineItem,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarkSeenRequest {
    pub visitor_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarkSeenResponse {
    pub conversation_id: String,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSeenResponse {
    pub seen_data: Vec<ConversationSeenEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyContactRequest {
    pub visitor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyContactResponse {
    pub contact_id: String,
    pub visitor_id: String,
}
