//! Connection identity and the URL it is presented on.

use url::Url;

use super::connection::ConnectionError;

/// Credentials a caller hands to [`ConnectionManager::connect`].
///
/// [`ConnectionManager::connect`]: super::ConnectionManager::connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthCredentials {
    Visitor { visitor_id: String },
    Session { session_token: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAuth {
    pub credentials: AuthCredentials,
    pub website_id: Option<String>,
    pub user_id: Option<String>,
    pub public_key: Option<String>,
}

impl ConnectionAuth {
    pub fn visitor(visitor_id: impl Into<String>) -> Self {
        Self::with_credentials(AuthCredentials::Visitor {
            visitor_id: visitor_id.into(),
        })
    }

    pub fn session(session_token: impl Into<String>) -> Self {
        Self::with_credentials(AuthCredentials::Session {
            session_token: session_token.into(),
        })
    }

    fn with_credentials(credentials: AuthCredentials) -> Self {
        Self {
            credentials,
            website_id: None,
            user_id: None,
            public_key: None,
        }
    }

    pub fn website_id(mut self, website_id: impl Into<String>) -> Self {
        self.website_id = Some(website_id.into());
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn public_key(mut self, public_key: impl Into<String>) -> Self {
        self.public_key = Some(public_key.into());
        self
    }

    /// Trim every field. An empty visitor id or session token yields no
    /// identity at all.
    pub fn resolve(&self) -> Option<ResolvedAuth> {
        let kind = match &self.credentials {
            AuthCredentials::Visitor { visitor_id } => AuthKind::Visitor {
                visitor_id: non_empty(Some(visitor_id))?,
            },
            AuthCredentials::Session { session_token } => AuthKind::Session {
                session_token: non_empty(Some(session_token))?,
            },
        };
        Some(ResolvedAuth {
            kind,
            website_id: non_empty(self.website_id.as_ref()),
            user_id: non_empty(self.user_id.as_ref()),
            public_key: non_empty(self.public_key.as_ref()),
        })
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthKind {
    Visitor { visitor_id: String },
    Session { session_token: String },
}

/// Normalized identity. Two connects with equal `ResolvedAuth` share a
/// channel; anything else forces a reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAuth {
    pub kind: AuthKind,
    pub website_id: Option<String>,
    pub user_id: Option<String>,
    pub public_key: Option<String>,
}

impl ResolvedAuth {
    pub fn visitor_id(&self) -> Option<&str> {
        match &self.kind {
            AuthKind::Visitor { visitor_id } => Some(visitor_id.as_str()),
            AuthKind::Session { .. } => None,
        }
    }
}

/// Append the identity to the realtime endpoint as query parameters.
pub fn build_connection_url(base: &str, auth: &ResolvedAuth) -> Result<Url, ConnectionError> {
    let mut url = Url::parse(base).map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
    {
        let mut query = url.query_pairs_mut();
        match &auth.kind {
            AuthKind::Visitor { visitor_id } => {
                query.append_pair("visitorId", visitor_id);
                if let Some(public_key) = &auth.public_key {
                    query.append_pair("publicKey", public_key);
                }
            }
            AuthKind::Session { session_token } => {
                query.append_pair("sessionToken", session_token);
                if let Some(website_id) = &auth.website_id {
                    query.append_pair("websiteId", website_id);
                }
            }
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(url: &Url, key: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn blank_credentials_resolve_to_nothing() {
        assert_eq!(ConnectionAuth::visitor("   ").resolve(), None);
        assert_eq!(ConnectionAuth::session("").resolve(), None);
    }

    #[test]
    fn resolve_trims_and_drops_empty_fields() {
        let auth = ConnectionAuth::visitor(" vis_1 ")
            .website_id("ws_1 ")
            .public_key("  ")
            .resolve()
            .unwrap();
        assert_eq!(auth.visitor_id(), Some("vis_1"));
        assert_eq!(auth.website_id.as_deref(), Some("ws_1"));
        assert_eq!(auth.public_key, None);
    }

    #[test]
    fn visitor_url_carries_visitor_and_public_key() {
        let auth = ConnectionAuth::visitor("vis_123")
            .website_id("ws_456")
            .public_key("pk_live_1")
            .resolve()
            .unwrap();
        let url = build_connection_url("wss://api.example.com/ws", &auth).unwrap();
        assert_eq!(query(&url, "visitorId").as_deref(), Some("vis_123"));
        assert_eq!(query(&url, "publicKey").as_deref(), Some("pk_live_1"));
        assert_eq!(query(&url, "websiteId"), None);
    }

    #[test]
    fn session_url_carries_token_and_website() {
        let auth = ConnectionAuth::session("tok_1")
            .website_id("ws_1")
            .public_key("ignored")
            .resolve()
            .unwrap();
        let url = build_connection_url("wss://api.example.com/ws", &auth).unwrap();
        assert_eq!(query(&url, "sessionToken").as_deref(), Some("tok_1"));
        assert_eq!(query(&url, "websiteId").as_deref(), Some("ws_1"));
        assert_eq!(query(&url, "publicKey"), None);
    }

    #[test]
    fn invalid_base_is_reported() {
        let auth = ConnectionAuth::visitor("vis").resolve().unwrap();
        assert!(matches!(
            build_connection_url("not a url", &auth),
            Err(ConnectionError::InvalidUrl(_))
        ));
    }
}
