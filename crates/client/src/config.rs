//! Client configuration from environment variables.

use std::time::Duration;

use crate::stores::DEFAULT_TYPING_TTL;
use crate::typing_reporter::TypingReporterConfig;
use crate::ws::ConnectionConfig;

pub const DEFAULT_API_URL: &str = "https://api.supportkit.dev/v1";
pub const DEFAULT_WS_URL: &str = "wss://api.supportkit.dev/ws";

/// Variables checked for the public key when none is passed explicitly,
/// in order. Covers the prefixes common bundlers expose to client code.
pub const PUBLIC_KEY_ENV_VARS: [&str; 5] = [
    "SUPPORTKIT_PUBLIC_KEY",
    "NEXT_PUBLIC_SUPPORTKIT_API_KEY",
    "VITE_SUPPORTKIT_API_KEY",
    "PUBLIC_SUPPORTKIT_API_KEY",
    "REACT_APP_SUPPORTKIT_API_KEY",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_url: String,
    pub ws_url: String,
    pub public_key: Option<String>,
    pub connection: ConnectionConfig,
    pub typing_ttl: Duration,
    pub typing_reporter: TypingReporterConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            public_key: None,
            connection: ConnectionConfig::default(),
            typing_ttl: DEFAULT_TYPING_TTL,
            typing_reporter: TypingReporterConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SUPPORTKIT_API_URL`: REST base URL (default: [`DEFAULT_API_URL`])
    /// - `SUPPORTKIT_WS_URL`: realtime endpoint (default: [`DEFAULT_WS_URL`])
    /// - the public key variables in [`PUBLIC_KEY_ENV_VARS`]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let api_url = non_empty(lookup("SUPPORTKIT_API_URL"))
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let ws_url =
            non_empty(lookup("SUPPORTKIT_WS_URL")).unwrap_or_else(|| DEFAULT_WS_URL.to_string());
        Self {
            api_url,
            ws_url,
            public_key: resolve_public_key_with(None, &lookup),
            ..Self::default()
        }
    }

    pub fn with_public_key(mut self, public_key: impl Into<String>) -> Self {
        self.public_key = resolve_public_key_with(Some(&public_key.into()), |_| None);
        self
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// An explicit non-empty key wins; otherwise the first non-empty variable in
/// [`PUBLIC_KEY_ENV_VARS`].
pub fn resolve_public_key(explicit: Option<&str>) -> Option<String> {
    resolve_public_key_with(explicit, |name| std::env::var(name).ok())
}

pub fn resolve_public_key_with(
    explicit: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    non_empty(explicit.map(str::to_string))
        .or_else(|| PUBLIC_KEY_ENV_VARS.iter().find_map(|name| non_empty(lookup(name))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn explicit_key_wins() {
        let lookup = env(&[("SUPPORTKIT_PUBLIC_KEY", "from-env")]);
        assert_eq!(
            resolve_public_key_with(Some(" pk_live "), lookup).as_deref(),
            Some("pk_live")
        );
    }

    #[test]
    fn first_non_empty_variable_is_used() {
        let lookup = env(&[
            ("NEXT_PUBLIC_SUPPORTKIT_API_KEY", "  "),
            ("REACT_APP_SUPPORTKIT_API_KEY", "pk_react"),
            ("VITE_SUPPORTKIT_API_KEY", "pk_vite"),
        ]);
        assert_eq!(
            resolve_public_key_with(Some(""), lookup).as_deref(),
            Some("pk_vite")
        );
        assert_eq!(resolve_public_key_with(None, env(&[])), None);
    }

    #[test]
    fn urls_fall_back_to_defaults() {
        let config = ClientConfig::from_lookup(env(&[
            ("SUPPORTKIT_WS_URL", "ws://localhost:9000/ws"),
            ("PUBLIC_SUPPORTKIT_API_KEY", "pk_public"),
        ]));
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.ws_url, "ws://localhost:9000/ws");
        assert_eq!(config.public_key.as_deref(), Some("pk_public"));
        assert_eq!(config.typing_ttl, Duration::from_secs(6));
    }
}
