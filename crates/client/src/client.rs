//! `SupportClient`: the facade UIs talk to.
//!
//! It owns the entity stores and routes three kinds of input into them:
//! REST responses, optimistic local writes and realtime events. Messages
//! are inserted optimistically, then either finalized with the server's copy
//! or rolled back and the error returned to the caller.
//!
//! A conversation can exist locally before the backend knows about it (a
//! *pending* conversation). The first message sent to it creates it
//! server-side together with its default items.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use supportkit_shared::{
    Actor, ApiError, Conversation, ConversationSeenEntry, ConversationStatus,
    ConversationTypingPayload, CreateConversationRequest, IdentifyContactRequest,
    IdentifyContactResponse, ListConversationsParams, ListConversationsResponse, MarkSeenRequest,
    MarkSeenResponse, RealtimeEvent, RealtimeEventPayload, SendTimelineItemRequest, TimelineItem,
    TimelineItemType, TimelineItemVisibility, TimelinePage, TimelinePart, TimelineQuery, Visitor,
};
use thiserror::Error;
use uuid::Uuid;

use crate::api_client::SupportApi;
use crate::config::ClientConfig;
use crate::scheduler::Scheduler;
use crate::storage::{self, KeyValueStorage, StorageError};
use crate::store::Unsubscribe;
use crate::stores::{ConversationStore, SeenStore, TimelineItemStore, TypingStore};
use crate::typing_reporter::{TypingReporter, TypingReporterConfig, TypingSignal};
use crate::ws::{ConnectionError, ConnectionManager};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("no visitor has been resolved for this client")]
    MissingVisitor,
    #[error("conversation {0} not found")]
    ConversationNotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Who the client is acting as. Set by [`SupportClient::resolve_visitor`]
/// or [`SupportClient::set_visitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitorSession {
    pub visitor_id: String,
    pub website_id: String,
    pub organization_id: String,
}

impl VisitorSession {
    pub fn actor(&self) -> Actor {
        Actor::visitor(self.visitor_id.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentifyParams {
    pub external_id: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitiateConversationParams {
    /// Items shown before the visitor writes anything, e.g. a greeting.
    pub default_timeline_items: Vec<TimelineItem>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendMessageParams {
    /// Target conversation. `None` uses the pending conversation, starting
    /// one if there is none.
    pub conversation_id: Option<String>,
    pub text: String,
}

impl SendMessageParams {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            text: text.into(),
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PendingConversation {
    conversation_id: String,
    default_timeline_items: Vec<TimelineItem>,
}

struct RealtimeAttachment {
    manager: ConnectionManager,
    subscription: Unsubscribe,
}

#[derive(Clone)]
pub struct SupportClient {
    inner: Rc<ClientInner>,
}

struct ClientInner {
    api: Rc<dyn SupportApi>,
    scheduler: Rc<dyn Scheduler>,
    storage: Rc<dyn KeyValueStorage>,
    typing_reporter_config: TypingReporterConfig,

    conversations: ConversationStore,
    timeline: TimelineItemStore,
    seen: SeenStore,
    typing: TypingStore,

    session: RefCell<Option<VisitorSession>>,
    pending: RefCell<Option<PendingConversation>>,
    realtime: RefCell<Option<RealtimeAttachment>>,
    destroyed: Cell<bool>,
}

impl SupportClient {
    pub fn new(
        config: &ClientConfig,
        api: Rc<dyn SupportApi>,
        scheduler: Rc<dyn Scheduler>,
        storage: Rc<dyn KeyValueStorage>,
    ) -> Self {
        let inner = ClientInner {
            conversations: ConversationStore::new(scheduler.clone()),
            timeline: TimelineItemStore::new(scheduler.clone()),
            seen: SeenStore::new(scheduler.clone()),
            typing: TypingStore::new(scheduler.clone(), config.typing_ttl),
            api,
            scheduler,
            storage,
            typing_reporter_config: config.typing_reporter.clone(),
            session: RefCell::new(None),
            pending: RefCell::new(None),
            realtime: RefCell::new(None),
            destroyed: Cell::new(false),
        };
        Self {
            inner: Rc::new(inner),
        }
    }

    // --- Stores ---

    pub fn conversations(&self) -> &ConversationStore {
        &self.inner.conversations
    }

    pub fn timeline(&self) -> &TimelineItemStore {
        &self.inner.timeline
    }

    pub fn seen(&self) -> &SeenStore {
        &self.inner.seen
    }

    pub fn typing(&self) -> &TypingStore {
        &self.inner.typing
    }

    // --- Visitor identity ---

    pub fn session(&self) -> Option<VisitorSession> {
        self.inner.session.borrow().clone()
    }

    pub fn set_visitor(&self, visitor: &Visitor) {
        *self.inner.session.borrow_mut() = Some(VisitorSession {
            visitor_id: visitor.id.clone(),
            website_id: visitor.website_id.clone(),
            organization_id: visitor.organization_id.clone(),
        });
    }

    /// Reuse the visitor id cached for `website_id` if the backend still
    /// knows it, otherwise register a new visitor, and remember the result.
    pub async fn resolve_visitor(&self, website_id: &str) -> Result<Visitor, ClientError> {
        let cached = storage::load_visitor_id(self.inner.storage.as_ref(), website_id);
        let visitor = self
            .inner
            .api
            .get_or_create_visitor(website_id, cached.as_deref())
            .await?;

        if cached.as_deref() != Some(visitor.id.as_str()) {
            if let Err(err) =
                storage::store_visitor_id(self.inner.storage.as_ref(), website_id, &visitor.id)
            {
                crate::log_warn!("Failed to cache visitor id for {}: {}", website_id, err);
            }
        }
        crate::log_info!("Resolved visitor {} for website {}", visitor.id, website_id);
        self.set_visitor(&visitor);
        Ok(visitor)
    }

    /// Drop the cached visitor id so the next resolve starts fresh.
    pub fn forget_visitor(&self, website_id: &str) -> Result<(), ClientError> {
        storage::clear_visitor_id(self.inner.storage.as_ref(), website_id)?;
        let mut session = self.inner.session.borrow_mut();
        if session.as_ref().is_some_and(|s| s.website_id == website_id) {
            *session = None;
        }
        Ok(())
    }

    pub async fn identify(
        &self,
        params: IdentifyParams,
    ) -> Result<IdentifyContactResponse, ClientError> {
        let session = self.require_session()?;
        let request = IdentifyContactRequest {
            visitor_id: session.visitor_id,
            external_id: params.external_id,
            email: params.email,
            name: params.name,
        };
        Ok(self.inner.api.identify_contact(&request).await?)
    }

    // --- Fetches ---

    pub async fn list_conversations(
        &self,
        params: ListConversationsParams,
    ) -> Result<ListConversationsResponse, ClientError> {
        let session = self.require_session()?;
        let response = self
            .inner
            .api
            .list_conversations(&session.visitor_id, &params)
            .await?;
        self.inner
            .conversations
            .ingest_page(&response.conversations, Some(&response.pagination));
        Ok(response)
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation, ClientError> {
        let session = self.require_session()?;
        let conversation = match self
            .inner
            .api
            .get_conversation(&session.visitor_id, conversation_id)
            .await
        {
            Ok(conversation) => conversation,
            Err(err) if err.status() == Some(404) => {
                return Err(ClientError::ConversationNotFound(conversation_id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        self.inner.conversations.ingest_single(&conversation);
        Ok(conversation)
    }

    pub async fn fetch_timeline_items(
        &self,
        conversation_id: &str,
        query: TimelineQuery,
    ) -> Result<TimelinePage, ClientError> {
        let session = self.require_session()?;
        let page = self
            .inner
            .api
            .get_timeline_items(&session.visitor_id, conversation_id, &query)
            .await?;
        self.inner.timeline.ingest_page(conversation_id, &page);
        if let Some(last) = page.items.iter().max_by_key(|item| item.created_at) {
            self.inner.conversations.apply_timeline_item(conversation_id, last);
        }
        Ok(page)
    }

    // --- Conversations & messages ---

    /// Start a conversation locally. It becomes the pending conversation and
    /// is created server-side by the first message sent to it.
    pub fn initiate_conversation(
        &self,
        params: InitiateConversationParams,
    ) -> Result<Conversation, ClientError> {
        let session = self.require_session()?;
        let conversation_id = Uuid::new_v4().to_string();
        let now = self.inner.scheduler.now();

        let default_timeline_items: Vec<TimelineItem> = params
            .default_timeline_items
            .into_iter()
            .map(|mut item| {
                item.conversation_id = conversation_id.clone();
                item
            })
            .collect();

        let conversation = Conversation {
            id: conversation_id.clone(),
            title: None,
            status: ConversationStatus::Open,
            visitor_id: session.visitor_id,
            website_id: session.website_id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            last_item: default_timeline_items
                .iter()
                .max_by_key(|item| item.created_at)
                .cloned(),
        };

        self.inner.conversations.ingest_single(&conversation);
        if !default_timeline_items.is_empty() {
            self.inner.timeline.ingest_page(
                &conversation_id,
                &TimelinePage {
                    items: default_timeline_items.clone(),
                    has_next_page: false,
                    next_cursor: None,
                },
            );
        }

        let replaced = self.inner.pending.borrow_mut().replace(PendingConversation {
            conversation_id,
            default_timeline_items,
        });
        if let Some(replaced) = replaced {
            crate::log_debug!(
                "Pending conversation {} superseded before its first message",
                replaced.conversation_id
            );
        }
        Ok(conversation)
    }

    pub fn pending_conversation_id(&self) -> Option<String> {
        self.inner
            .pending
            .borrow()
            .as_ref()
            .map(|pending| pending.conversation_id.clone())
    }

    /// Send a visitor message. The returned item is the server's copy; on
    /// failure the optimistic item is removed from the timeline and from the
    /// conversation's `last_item`, and the error returned.
    pub async fn send_message(&self, params: SendMessageParams) -> Result<TimelineItem, ClientError> {
        let session = self.require_session()?;
        let conversation_id = match params.conversation_id {
            Some(id) => id,
            None => match self.pending_conversation_id() {
                Some(id) => id,
                None => {
                    self.initiate_conversation(InitiateConversationParams::default())?
                        .id
                }
            },
        };

        let optimistic = self.optimistic_message(&session, &conversation_id, params.text);
        let previous = self.inner.conversations.get(&conversation_id);
        self.inner.timeline.ingest_single(&conversation_id, &optimistic);
        self.inner
            .conversations
            .apply_timeline_item(&conversation_id, &optimistic);

        let pending = {
            let mut pending = self.inner.pending.borrow_mut();
            if pending
                .as_ref()
                .is_some_and(|p| p.conversation_id == conversation_id)
            {
                pending.take()
            } else {
                None
            }
        };

        let result = match &pending {
            Some(pending) => self.create_with_message(&session, pending, &optimistic).await,
            None => self.inner
                .api
                .send_timeline_item(
                    &session.visitor_id,
                    &SendTimelineItemRequest {
                        conversation_id: conversation_id.clone(),
                        item: optimistic.clone(),
                    },
                )
                .await
                .map(|response| response.item),
        };

        match result {
            Ok(item) => {
                self.inner
                    .timeline
                    .finalize(&conversation_id, &optimistic.id, &item);
                self.inner
                    .conversations
                    .replace_last_item(&conversation_id, &optimistic.id, &item);
                Ok(item)
            }
            Err(err) => {
                crate::log_warn!(
                    "Sending message to {} failed, rolling back: {}",
                    conversation_id,
                    err
                );
                self.inner.timeline.remove(&conversation_id, &optimistic.id);
                if let Some(previous) = &previous {
                    self.inner
                        .conversations
                        .revert_last_item(&optimistic.id, previous);
                }
                if let Some(pending) = pending {
                    let mut slot = self.inner.pending.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(pending);
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Create the pending conversation with `message` as its first item and
    /// return the server's copy of that message.
    async fn create_with_message(
        &self,
        session: &VisitorSession,
        pending: &PendingConversation,
        message: &TimelineItem,
    ) -> Result<TimelineItem, ApiError> {
        let mut default_timeline_items = pending.default_timeline_items.clone();
        default_timeline_items.push(message.clone());
        let response = self
            .inner
            .api
            .create_conversation(&CreateConversationRequest {
                conversation_id: pending.conversation_id.clone(),
                visitor_id: session.visitor_id.clone(),
                default_timeline_items,
            })
            .await?;

        let conversation_id = response.conversation.id.clone();
        let server_message = response
            .initial_timeline_items
            .iter()
            .find(|item| item.id == message.id)
            .or_else(|| response.initial_timeline_items.last())
            .cloned()
            .unwrap_or_else(|| message.clone());

        self.inner.conversations.ingest_single(&response.conversation);
        let others: Vec<TimelineItem> = response
            .initial_timeline_items
            .into_iter()
            .filter(|item| item.id != server_message.id)
            .collect();
        self.inner.timeline.store().batch(|| {
            for item in &others {
                self.inner.timeline.ingest_single(&conversation_id, item);
            }
        });
        Ok(server_message)
    }

    fn optimistic_message(
        &self,
        session: &VisitorSession,
        conversation_id: &str,
        text: String,
    ) -> TimelineItem {
        TimelineItem {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            organization_id: session.organization_id.clone(),
            item_type: TimelineItemType::Message,
            parts: vec![TimelinePart::Text { text: text.clone() }],
            text: Some(text),
            visibility: TimelineItemVisibility::Public,
            user_id: None,
            ai_agent_id: None,
            visitor_id: Some(session.visitor_id.clone()),
            created_at: self.inner.scheduler.now(),
            deleted_at: None,
        }
    }

    // --- Seen receipts ---

    pub async fn mark_conversation_seen(
        &self,
        conversation_id: &str,
    ) -> Result<MarkSeenResponse, ClientError> {
        let session = self.require_session()?;
        let response = self
            .inner
            .api
            .mark_conversation_seen(
                conversation_id,
                &MarkSeenRequest {
                    visitor_id: session.visitor_id.clone(),
                },
            )
            .await?;
        self.inner
            .seen
            .upsert_seen(conversation_id, &session.actor(), response.last_seen_at);
        Ok(response)
    }

    pub async fn fetch_conversation_seen(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationSeenEntry>, ClientError> {
        let session = self.require_session()?;
        let response = self
            .inner
            .api
            .get_conversation_seen(&session.visitor_id, conversation_id)
            .await?;
        self.inner.seen.hydrate(conversation_id, &response.seen_data);
        Ok(response.seen_data)
    }

    // --- Realtime ---

    /// Route one realtime event into the stores.
    pub fn handle_realtime_event(&self, event: &RealtimeEvent) {
        self.inner.handle_realtime_event(event);
    }

    /// Feed every event from `manager` into this client. Replaces any
    /// previously attached manager.
    pub fn attach_realtime(&self, manager: &ConnectionManager) {
        self.detach_realtime();
        let weak: Weak<ClientInner> = Rc::downgrade(&self.inner);
        let subscription = manager.subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_realtime_event(event);
            }
            Ok(())
        });
        *self.inner.realtime.borrow_mut() = Some(RealtimeAttachment {
            manager: manager.clone(),
            subscription,
        });
    }

    pub fn detach_realtime(&self) {
        let attachment = self.inner.realtime.borrow_mut().take();
        if let Some(attachment) = attachment {
            attachment.subscription.unsubscribe();
        }
    }

    /// A reporter that publishes this visitor's typing state for
    /// `conversation_id` over the attached realtime channel.
    pub fn typing_reporter(&self, conversation_id: &str) -> Result<TypingReporter, ClientError> {
        let session = self.require_session()?;
        let manager = self
            .inner
            .realtime
            .borrow()
            .as_ref()
            .map(|attachment| attachment.manager.clone())
            .ok_or(ClientError::Connection(ConnectionError::NotConnected))?;

        let conversation_id = conversation_id.to_string();
        let send = move |signal: TypingSignal| {
            let payload = ConversationTypingPayload {
                organization_id: session.organization_id.clone(),
                website_id: session.website_id.clone(),
                conversation_id: conversation_id.clone(),
                user_id: None,
                visitor_id: Some(session.visitor_id.clone()),
                ai_agent_id: None,
                is_typing: signal.is_typing,
                visitor_preview: signal.preview,
            };
            let event = RealtimeEvent::new(RealtimeEventPayload::ConversationTyping(payload));
            if let Err(err) = manager.send(&event) {
                crate::log_debug!("Typing update for {} not sent: {}", conversation_id, err);
            }
        };
        Ok(TypingReporter::new(
            self.inner.typing_reporter_config.clone(),
            self.inner.scheduler.clone(),
            send,
        ))
    }

    /// Detach from the realtime channel and drop transient state. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.replace(true) {
            return;
        }
        self.detach_realtime();
        self.inner.typing.clear_all();
        self.inner.pending.borrow_mut().take();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    fn require_session(&self) -> Result<VisitorSession, ClientError> {
        self.session().ok_or(ClientError::MissingVisitor)
    }
}

impl ClientInner {
    fn handle_realtime_event(&self, event: &RealtimeEvent) {
        if self.destroyed.get() {
            return;
        }
        let session = self.session.borrow().clone();
        if let Some(session) = &session {
            if event.website_id != session.website_id {
                crate::log_debug!(
                    "Dropping {} for website {}",
                    event.event_type().as_str(),
                    event.website_id
                );
                return;
            }
        }

        match &event.payload {
            RealtimeEventPayload::ConversationCreated(payload)
            | RealtimeEventPayload::ConversationUpdated(payload) => {
                self.conversations.ingest_single(&payload.conversation);
            }
            RealtimeEventPayload::TimelineItemCreated(payload) => {
                let item = self.timeline.ingest_realtime(payload);
                self.conversations
                    .apply_timeline_item(&payload.conversation_id, &item);
                self.typing
                    .clear_for_new_item(&payload.conversation_id, item.sender().as_ref());
            }
            RealtimeEventPayload::TimelineItemUpdated(payload) => {
                let item = self.timeline.ingest_realtime(payload);
                self.conversations
                    .apply_timeline_item(&payload.conversation_id, &item);
            }
            RealtimeEventPayload::ConversationSeen(payload) => {
                self.seen.apply_realtime(payload);
            }
            RealtimeEventPayload::ConversationTyping(payload) => {
                let own = session.as_ref().map(VisitorSession::actor);
                if own.is_some() && payload.actor() == own {
                    return;
                }
                self.typing.apply_realtime(payload);
            }
            RealtimeEventPayload::VisitorIdentified(payload) => {
                crate::log_info!(
                    "Visitor {} identified as contact {:?}",
                    payload.visitor_id,
                    payload.contact_id
                );
            }
            RealtimeEventPayload::UserConnected(_)
            | RealtimeEventPayload::UserDisconnected(_)
            | RealtimeEventPayload::VisitorConnected(_)
            | RealtimeEventPayload::VisitorDisconnected(_)
            | RealtimeEventPayload::UserPresenceUpdate(_) => {
                crate::log_debug!("Presence event {}", event.event_type().as_str());
            }
        }
    }
}
