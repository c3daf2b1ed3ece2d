//! Shared error types, including RFC7807 problem bodies returned by the API.

use serde::{Deserialize, Serialize};

/// RFC7807 Problem Details (application/problem+json)
///
/// The backend uses this envelope for every non-2xx `/v1/*` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemDetails {
    #[serde(rename = "type", default)]
    pub type_url: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Attempt to parse an RFC7807 (or RFC7807-ish) JSON body into a user-facing message.
/// Prefers `detail`, falls back to `title`.
pub fn try_problem_detail(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ProblemDetails>(body).ok()?;
    parsed
        .detail
        .filter(|detail| !detail.trim().is_empty())
        .or_else(|| Some(parsed.title).filter(|title| !title.trim().is_empty()))
}

/// Failure of a REST call made on behalf of the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

impl ApiError {
    /// Message suitable for showing to an end user.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Http { status, body } => {
                try_problem_detail(body).unwrap_or_else(|| format!("Request failed ({status})"))
            }
            ApiError::Network(_) => "Network unavailable".to_string(),
            ApiError::Deserialize(_) => "Unexpected response from server".to_string(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Why an inbound realtime event was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventDecodeError {
    #[error("`{event_type}` payload is missing `{field}`")]
    MissingField {
        event_type: String,
        field: &'static str,
    },
    #[error("`{event_type}` payload failed validation: {message}")]
    Schema { event_type: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_detail_prefers_detail_then_title() {
        assert_eq!(
            try_problem_detail(r#"{"title":"Forbidden","detail":"Public key revoked"}"#),
            Some("Public key revoked".to_string())
        );
        assert_eq!(
            try_problem_detail(r#"{"title":"Forbidden","detail":"  "}"#),
            Some("Forbidden".to_string())
        );
        assert_eq!(try_problem_detail("<html>"), None);
    }

    #[test]
    fn user_message_falls_back_to_status() {
        let err = ApiError::Http {
            status: 502,
            body: "bad gateway".into(),
        };
        assert_eq!(err.user_message(), "Request failed (502)");
        assert_eq!(err.status(), Some(502));
        assert_eq!(ApiError::Network("reset".into()).status(), None);
    }
}
