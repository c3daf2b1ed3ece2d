//! End-to-end scenarios: connection manager, stores and the client facade
//! driven together through the mock transport and a virtual clock.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::oneshot;
use serde_json::json;
use supportkit_client::scheduler::VirtualScheduler;
use supportkit_client::stores::TypingStore;
use supportkit_client::testing::fixtures::{at, conversation, message, ORGANIZATION_ID, WEBSITE_ID};
use supportkit_client::testing::MockTransport;
use supportkit_client::ws::ConnectionStatus;
use supportkit_client::{
    ClientConfig, ConnectionAuth, ConnectionConfig, ConnectionError, ConnectionManager,
    MemoryStorage, SendMessageParams, SupportApi, SupportClient,
};
use supportkit_shared::{
    close_code, Actor, ApiError, Conversation, ConversationSeenResponse, CreateConversationRequest,
    CreateConversationResponse, IdentifyContactRequest, IdentifyContactResponse,
    ListConversationsParams, ListConversationsResponse, MarkSeenRequest, MarkSeenResponse,
    SendTimelineItemRequest, SendTimelineItemResponse, TimelinePage, TimelineQuery, Visitor,
};

const BASE: &str = "wss://realtime.example.com/ws";

fn manager_with(scheduler: &Rc<VirtualScheduler>) -> (MockTransport, ConnectionManager) {
    let transport = MockTransport::new();
    let manager = ConnectionManager::new(
        BASE,
        ConnectionConfig::default(),
        Rc::new(transport.clone()),
        scheduler.clone(),
    );
    (transport, manager)
}

#[test]
fn visitor_connect_sets_url_status_and_connection_id() {
    let scheduler = Rc::new(VirtualScheduler::new());
    let (transport, manager) = manager_with(&scheduler);

    manager.connect(ConnectionAuth::visitor("vis_123").website_id("ws_456"));
    let url = transport.last_url().unwrap();
    let visitor_id = url
        .query_pairs()
        .find(|(key, _)| key == "visitorId")
        .map(|(_, value)| value.into_owned());
    assert_eq!(visitor_id.as_deref(), Some("vis_123"));

    transport.simulate_open();
    assert_eq!(manager.get_state().status, ConnectionStatus::Connected);

    transport.simulate_message(
        r#"{"type":"CONNECTION_ESTABLISHED","payload":{"connectionId":"conn_xyz"}}"#,
    );
    assert_eq!(manager.get_state().connection_id.as_deref(), Some("conn_xyz"));
}

#[test]
fn policy_violation_is_terminal_until_a_new_identity() {
    let scheduler = Rc::new(VirtualScheduler::new());
    let (transport, manager) = manager_with(&scheduler);
    let errors = Rc::new(RefCell::new(Vec::new()));
    let sink = errors.clone();
    manager.on_error(move |err| sink.borrow_mut().push(err.clone()));

    manager.connect(ConnectionAuth::visitor("vis_1"));
    transport.simulate_open();
    transport.simulate_close(close_code::POLICY_VIOLATION, "bad key");
    scheduler.advance(Duration::from_secs(120));

    assert_eq!(transport.connection_count(), 1);
    assert_eq!(manager.get_state().status, ConnectionStatus::Disconnected);
    assert_eq!(
        *errors.borrow(),
        vec![ConnectionError::PermanentClose {
            code: close_code::POLICY_VIOLATION,
            reason: "bad key".into(),
        }]
    );

    manager.connect(ConnectionAuth::visitor("vis_2"));
    assert_eq!(transport.connection_count(), 2);
}

#[test]
fn abnormal_close_reconnects_with_backoff() {
    let scheduler = Rc::new(VirtualScheduler::new());
    let (transport, manager) = manager_with(&scheduler);

    manager.connect(ConnectionAuth::visitor("vis_1"));
    transport.simulate_close(close_code::ABNORMAL, "");
    scheduler.advance(Duration::from_millis(499));
    assert_eq!(transport.connection_count(), 1);
    scheduler.advance(Duration::from_millis(1));
    assert_eq!(transport.connection_count(), 2);

    transport.simulate_close(close_code::ABNORMAL, "");
    scheduler.advance(Duration::from_millis(999));
    assert_eq!(transport.connection_count(), 2);
    scheduler.advance(Duration::from_millis(1));
    assert_eq!(transport.connection_count(), 3);
}

#[test]
fn silent_channel_is_closed_and_reopened() {
    let scheduler = Rc::new(VirtualScheduler::new());
    let (transport, manager) = manager_with(&scheduler);
    manager.connect(ConnectionAuth::visitor("vis_1"));
    transport.simulate_open();

    scheduler.advance(Duration::from_secs(60));
    assert_eq!(
        transport.close_request(0),
        Some((close_code::HEARTBEAT_TIMEOUT, "heartbeat timeout".into()))
    );
    assert!(transport.sent_frames_on(0).iter().all(|frame| frame == "ping"));

    scheduler.advance(Duration::from_millis(500));
    assert_eq!(transport.connection_count(), 2);
}

#[test]
fn pushed_events_flow_into_the_client_stores() {
    let scheduler = Rc::new(VirtualScheduler::new());
    let (transport, manager) = manager_with(&scheduler);
    let client = SupportClient::new(
        &ClientConfig::default(),
        Rc::new(PendingApi::default()),
        scheduler.clone(),
        Rc::new(MemoryStorage::new()),
    );
    client.set_visitor(&visitor());
    client.attach_realtime(&manager);
    client.conversations().ingest_single(&conversation("c1", 0));

    manager.connect(ConnectionAuth::visitor("vis_1").website_id(WEBSITE_ID));
    transport.simulate_open();

    let mut reply = message("m1", "c1", 10);
    reply.visitor_id = None;
    reply.ai_agent_id = Some("ai_1".into());
    let frame = json!({
        "type": "timelineItemCreated",
        "payload": {
            "organizationId": ORGANIZATION_ID,
            "websiteId": WEBSITE_ID,
            "conversationId": "c1",
            "item": reply,
        },
    });
    transport.simulate_message(&frame.to_string());
    transport.simulate_message(&frame.to_string());
    transport.simulate_message("not json at all");

    assert_eq!(client.timeline().items("c1").len(), 1);
    let latest = client.conversations().get("c1").and_then(|c| c.last_item);
    assert_eq!(latest.map(|item| item.id).as_deref(), Some("m1"));
    assert!(manager.is_connected());
}

#[test]
fn typing_entries_expire_after_the_ttl() {
    let scheduler = Rc::new(VirtualScheduler::new());
    let typing = TypingStore::new(scheduler.clone(), Duration::from_secs(6));
    let visitor = Actor::visitor("v1");

    typing.set_typing("conv", &visitor, true, None);
    scheduler.advance(Duration::from_millis(5_000));
    assert!(typing.get_state().is_typing("conv", &visitor));

    scheduler.advance(Duration::from_millis(1_500));
    assert!(!typing.get_state().is_typing("conv", &visitor));
}

// --- Optimistic send against an API that answers when told to ---

fn visitor() -> Visitor {
    Visitor {
        id: "vis_1".into(),
        website_id: WEBSITE_ID.into(),
        organization_id: ORGANIZATION_ID.into(),
        contact_id: None,
        created_at: at(0),
    }
}

/// `create_conversation` waits for the test to hand it a response.
#[derive(Default)]
struct PendingApi {
    create_response: RefCell<Option<oneshot::Receiver<CreateConversationResponse>>>,
    requests: RefCell<Vec<CreateConversationRequest>>,
}

fn unused<T>() -> Result<T, ApiError> {
    Err(ApiError::Network("not used in this test".into()))
}

#[async_trait(?Send)]
impl SupportApi for PendingApi {
    async fn list_conversations(
        &self,
        _visitor_id: &str,
        _params: &ListConversationsParams,
    ) -> Result<ListConversationsResponse, ApiError> {
        unused()
    }

    async fn get_conversation(
        &self,
        _visitor_id: &str,
        _conversation_id: &str,
    ) -> Result<Conversation, ApiError> {
        unused()
    }

    async fn create_conversation(
        &self,
        request: &CreateConversationRequest,
    ) -> Result<CreateConversationResponse, ApiError> {
        self.requests.borrow_mut().push(request.clone());
        let receiver = self.create_response.borrow_mut().take();
        match receiver {
            Some(receiver) => receiver
                .await
                .map_err(|_| ApiError::Network("request cancelled".into())),
            None => unused(),
        }
    }

    async fn get_timeline_items(
        &self,
        _visitor_id: &str,
        _conversation_id: &str,
        _query: &TimelineQuery,
    ) -> Result<TimelinePage, ApiError> {
        unused()
    }

    async fn send_timeline_item(
        &self,
        _visitor_id: &str,
        _request: &SendTimelineItemRequest,
    ) -> Result<SendTimelineItemResponse, ApiError> {
        unused()
    }

    async fn mark_conversation_seen(
        &self,
        _conversation_id: &str,
        _request: &MarkSeenRequest,
    ) -> Result<MarkSeenResponse, ApiError> {
        unused()
    }

    async fn get_conversation_seen(
        &self,
        _visitor_id: &str,
        _conversation_id: &str,
    ) -> Result<ConversationSeenResponse, ApiError> {
        unused()
    }

    async fn get_or_create_visitor(
        &self,
        _website_id: &str,
        _visitor_id: Option<&str>,
    ) -> Result<Visitor, ApiError> {
        unused()
    }

    async fn identify_contact(
        &self,
        _request: &IdentifyContactRequest,
    ) -> Result<IdentifyContactResponse, ApiError> {
        unused()
    }
}

#[tokio::test]
async fn optimistic_message_is_replaced_by_the_server_copy() {
    let scheduler = Rc::new(VirtualScheduler::new());
    let api = Rc::new(PendingApi::default());
    let (respond, receiver) = oneshot::channel();
    *api.create_response.borrow_mut() = Some(receiver);

    let client = SupportClient::new(
        &ClientConfig::default(),
        api.clone(),
        scheduler.clone(),
        Rc::new(MemoryStorage::new()),
    );
    client.set_visitor(&visitor());

    let send = client.send_message(SendMessageParams::new("hello"));
    let server = async {
        while api.requests.borrow().is_empty() {
            tokio::task::yield_now().await;
        }
        // By the time the request is in flight the optimistic item is visible.
        let conversation_id = client.conversations().get_state().ids[0].clone();
        let items = client.timeline().items(&conversation_id);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text.as_deref(), Some("hello"));

        let request = api.requests.borrow()[0].clone();
        assert_eq!(request.conversation_id, conversation_id);
        let mut confirmed = request.default_timeline_items[0].clone();
        confirmed.id = "srv_1".into();
        let _ = respond.send(CreateConversationResponse {
            conversation: conversation(&conversation_id, 0),
            initial_timeline_items: vec![confirmed],
        });
        conversation_id
    };

    let (sent, conversation_id) = tokio::join!(send, server);
    let sent = sent.unwrap();

    assert_eq!(sent.id, "srv_1");
    let items = client.timeline().items(&conversation_id);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, "srv_1");
    assert_eq!(client.pending_conversation_id(), None);
}
