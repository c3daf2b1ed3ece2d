//! REST collaborator for the support backend.
//!
//! [`SupportApi`] is the seam the client facade talks to; [`ApiClient`] is
//! the reqwest implementation. Tests substitute their own implementation.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use supportkit_shared::{
    ApiError, Conversation, ConversationSeenResponse, CreateConversationRequest,
    CreateConversationResponse, IdentifyContactRequest, IdentifyContactResponse,
    ListConversationsParams, ListConversationsResponse, MarkSeenRequest, MarkSeenResponse,
    SendTimelineItemRequest, SendTimelineItemResponse, TimelinePage, TimelineQuery, Visitor,
};

pub const PUBLIC_KEY_HEADER: &str = "X-Public-Key";
pub const VISITOR_ID_HEADER: &str = "X-Visitor-Id";

#[async_trait(?Send)]
pub trait SupportApi {
    async fn list_conversations(
        &self,
        visitor_id: &str,
        params: &ListConversationsParams,
    ) -> Result<ListConversationsResponse, ApiError>;

    async fn get_conversation(
        &self,
        visitor_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation, ApiError>;

    async fn create_conversation(
        &self,
        request: &CreateConversationRequest,
    ) -> Result<CreateConversationResponse, ApiError>;

    async fn get_timeline_items(
        &self,
        visitor_id: &str,
        conversation_id: &str,
        query: &TimelineQuery,
    ) -> Result<TimelinePage, ApiError>;

    async fn send_timeline_item(
        &self,
        visitor_id: &str,
        request: &SendTimelineItemRequest,
    ) -> Result<SendTimelineItemResponse, ApiError>;

    async fn mark_conversation_seen(
        &self,
        conversation_id: &str,
        request: &MarkSeenRequest,
    ) -> Result<MarkSeenResponse, ApiError>;

    async fn get_conversation_seen(
        &self,
        visitor_id: &str,
        conversation_id: &str,
    ) -> Result<ConversationSeenResponse, ApiError>;

    /// Look up `visitor_id` for the website, or register a new visitor when
    /// it is `None` or unknown to the backend.
    async fn get_or_create_visitor(
        &self,
        website_id: &str,
        visitor_id: Option<&str>,
    ) -> Result<Visitor, ApiError>;

    async fn identify_contact(
        &self,
        request: &IdentifyContactRequest,
    ) -> Result<IdentifyContactResponse, ApiError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VisitorLookup<'a> {
    website_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    visitor_id: Option<&'a str>,
}

/// HTTP client for the support backend's REST API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    public_key: Option<String>,
}

impl ApiClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: String::new(),
            public_key: None,
        }
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Send `X-Public-Key` with every request.
    pub fn with_public_key(mut self, public_key: Option<String>) -> Self {
        self.public_key = public_key.filter(|key| !key.trim().is_empty());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if self.base_url.is_empty() {
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            }
        } else {
            let base = self.base_url.trim_end_matches('/');
            let path = path.trim_start_matches('/');
            format!("{base}/{path}")
        }
    }

    async fn request<TRes: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        visitor_id: Option<&str>,
        query: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<TRes, ApiError> {
        let url = self.url(path);
        let mut rb = self.client.request(method.clone(), &url);

        if let Some(key) = &self.public_key {
            rb = rb.header(PUBLIC_KEY_HEADER, key);
        }
        if let Some(visitor_id) = visitor_id {
            rb = rb.header(VISITOR_ID_HEADER, visitor_id);
        }
        if !query.is_empty() {
            rb = rb.query(query);
        }
        if let Some(body) = body {
            rb = rb.body(body).header("Content-Type", "application/json");
        }

        let resp = rb.send().await.map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            crate::log_warn!("{} {} failed with status {}", method, url, status);
            return Err(ApiError::Http { status, body: text });
        }

        if text.is_empty() {
            serde_json::from_str("null").map_err(|e| ApiError::Deserialize(e.to_string()))
        } else {
            serde_json::from_str(&text).map_err(|e| ApiError::Deserialize(e.to_string()))
        }
    }

    pub async fn get_json<TRes: DeserializeOwned>(
        &self,
        path: &str,
        visitor_id: Option<&str>,
    ) -> Result<TRes, ApiError> {
        self.request(Method::GET, path, visitor_id, &[], None).await
    }

    pub async fn get_json_with_query<TQuery: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        visitor_id: Option<&str>,
        query: &TQuery,
    ) -> Result<TRes, ApiError> {
        let pairs = query_pairs(query)?;
        self.request(Method::GET, path, visitor_id, &pairs, None)
            .await
    }

    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        visitor_id: Option<&str>,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let body_bytes =
            serde_json::to_vec(body).map_err(|e| ApiError::Deserialize(e.to_string()))?;
        self.request(Method::POST, path, visitor_id, &[], Some(body_bytes))
            .await
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Flatten a serializable struct into query pairs, dropping `None` fields.
fn query_pairs<T: Serialize>(query: &T) -> Result<Vec<(String, String)>, ApiError> {
    let value = serde_json::to_value(query).map_err(|e| ApiError::Deserialize(e.to_string()))?;
    let serde_json::Value::Object(map) = value else {
        return Ok(Vec::new());
    };
    Ok(map
        .into_iter()
        .filter_map(|(key, value)| match value {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some((key, s)),
            other => Some((key, other.to_string())),
        })
        .collect())
}

fn conversation_path(conversation_id: &str, rest: &str) -> String {
    format!(
        "/conversations/{}{}",
        urlencoding::encode(conversation_id),
        rest
    )
}

#[async_trait(?Send)]
impl SupportApi for ApiClient {
    async fn list_conversations(
        &self,
        visitor_id: &str,
        params: &ListConversationsParams,
    ) -> Result<ListConversationsResponse, ApiError> {
        self.get_json_with_query("/conversations", Some(visitor_id), params)
            .await
    }

    async fn get_conversation(
        &self,
        visitor_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation, ApiError> {
        self.get_json(&conversation_path(conversation_id, ""), Some(visitor_id))
            .await
    }

    async fn create_conversation(
        &self,
        request: &CreateConversationRequest,
    ) -> Result<CreateConversationResponse, ApiError> {
        self.post_json("/conversations", Some(&request.visitor_id), request)
            .await
    }

    async fn get_timeline_items(
        &self,
        visitor_id: &str,
        conversation_id: &str,
        query: &TimelineQuery,
    ) -> Result<TimelinePage, ApiError> {
        self.get_json_with_query(
            &conversation_path(conversation_id, "/timeline"),
            Some(visitor_id),
            query,
        )
        .await
    }

    async fn send_timeline_item(
        &self,
        visitor_id: &str,
        request: &SendTimelineItemRequest,
    ) -> Result<SendTimelineItemResponse, ApiError> {
        self.post_json(
            &conversation_path(&request.conversation_id, "/timeline"),
            Some(visitor_id),
            request,
        )
        .await
    }

    async fn mark_conversation_seen(
        &self,
        conversation_id: &str,
        request: &MarkSeenRequest,
    ) -> Result<MarkSeenResponse, ApiError> {
        self.post_json(
            &conversation_path(conversation_id, "/seen"),
            Some(&request.visitor_id),
            request,
        )
        .await
    }

    async fn get_conversation_seen(
        &self,
        visitor_id: &str,
        conversation_id: &str,
    ) -> Result<ConversationSeenResponse, ApiError> {
        self.get_json(&conversation_path(conversation_id, "/seen"), Some(visitor_id))
            .await
    }

    async fn get_or_create_visitor(
        &self,
        website_id: &str,
        visitor_id: Option<&str>,
    ) -> Result<Visitor, ApiError> {
        let lookup = VisitorLookup {
            website_id,
            visitor_id,
        };
        self.post_json("/visitors", visitor_id, &lookup).await
    }

    async fn identify_contact(
        &self,
        request: &IdentifyContactRequest,
    ) -> Result<IdentifyContactResponse, ApiError> {
        self.post_json("/contacts/identify", Some(&request.visitor_id), request)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use supportkit_shared::ConversationStatus;

    #[test]
    fn url_joins_base_and_path() {
        let client = ApiClient::new().with_base_url("https://api.example.com/v1/");
        assert_eq!(
            client.url("/conversations"),
            "https://api.example.com/v1/conversations"
        );
        assert_eq!(client.url("https://other/x"), "https://other/x");
        assert_eq!(ApiClient::new().url("visitors"), "/visitors");
    }

    #[test]
    fn conversation_ids_are_escaped() {
        assert_eq!(
            conversation_path("a/b c", "/seen"),
            "/conversations/a%2Fb%20c/seen"
        );
    }

    #[test]
    fn blank_public_key_is_ignored() {
        let client = ApiClient::new().with_public_key(Some("  ".into()));
        assert!(client.public_key.is_none());
    }

    #[test]
    fn query_pairs_skip_missing_fields() {
        let params = ListConversationsParams {
            page: Some(2),
            limit: None,
            status: Some(ConversationStatus::Open),
        };
        let mut pairs = query_pairs(&params).unwrap();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("page".to_string(), "2".to_string()),
                ("status".to_string(), "open".to_string()),
            ]
        );
    }
}
