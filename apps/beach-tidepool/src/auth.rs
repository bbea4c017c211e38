use axum::http::{header, HeaderMap};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, Rng};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_KEY_QUERY: &str = "apiKey";
pub const API_KEY_COOKIE: &str = "tidepool_api_key";
pub const TERMINAL_TOKEN_HEADER: &str = "x-terminal-token";
pub const TERMINAL_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const WS_TOKEN_TTL: Duration = Duration::from_secs(60);
const TOKEN_LEN: usize = 32;

/// The parts of a request an authenticator may look at.
pub struct AuthRequest<'a> {
    pub headers: &'a HeaderMap,
    pub query: &'a HashMap<String, String>,
}

impl AuthRequest<'_> {
    pub fn bearer(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|auth| auth.strip_prefix("Bearer "))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|cookies| cookies.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

/// Decides whether a request may proceed.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: &AuthRequest<'_>) -> bool;
}

/// Shared API key, accepted from a header, bearer token, query or cookie.
/// With no key configured every request passes.
#[derive(Clone, Debug, Default)]
pub struct ApiKeyAuthenticator {
    key: Option<String>,
}

impl ApiKeyAuthenticator {
    pub fn new(key: Option<String>) -> Self {
        Self {
            key: key.filter(|key| !key.is_empty()),
        }
    }
}

impl Authenticator for ApiKeyAuthenticator {
    fn authenticate(&self, request: &AuthRequest<'_>) -> bool {
        let Some(expected) = self.key.as_deref() else {
            return true;
        };
        [
            request.header(API_KEY_HEADER),
            request.bearer(),
            request.query(API_KEY_QUERY),
            request.cookie(API_KEY_COOKIE),
        ]
        .into_iter()
        .flatten()
        .any(|candidate| constant_time_eq(candidate.as_bytes(), expected.as_bytes()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Random bearer tokens with a fixed lifetime. Expired entries are purged
/// whenever the store is touched.
#[derive(Debug)]
pub struct TokenStore {
    ttl: Duration,
    single_use: bool,
    tokens: Mutex<HashMap<String, Instant>>,
}

impl TokenStore {
    pub fn new(ttl: Duration, single_use: bool) -> Self {
        Self {
            ttl,
            single_use,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn issue(&self) -> IssuedToken {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        let now = Instant::now();
        let mut tokens = self.tokens.lock();
        tokens.retain(|_, expires| *expires > now);
        tokens.insert(token.clone(), now + self.ttl);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());
        IssuedToken { token, expires_at }
    }

    /// True if `token` is live. Single-use stores consume it.
    pub fn validate(&self, token: &str) -> bool {
        let now = Instant::now();
        let mut tokens = self.tokens.lock();
        tokens.retain(|_, expires| *expires > now);
        if self.single_use {
            tokens.remove(token).is_some()
        } else {
            tokens.contains_key(token)
        }
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.lock().remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn request<'a>(headers: &'a HeaderMap, query: &'a HashMap<String, String>) -> AuthRequest<'a> {
        AuthRequest { headers, query }
    }

    #[test_timeout::timeout]
    fn open_when_no_key_configured() {
        let auth = ApiKeyAuthenticator::new(None);
        assert!(auth.authenticate(&request(&HeaderMap::new(), &HashMap::new())));
        let auth = ApiKeyAuthenticator::new(Some(String::new()));
        assert!(auth.authenticate(&request(&HeaderMap::new(), &HashMap::new())));
    }

    #[test_timeout::timeout]
    fn accepts_key_from_any_carrier() {
        let auth = ApiKeyAuthenticator::new(Some("s3cret".into()));
        let empty = HashMap::new();

        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("s3cret"));
        assert!(auth.authenticate(&request(&headers, &empty)));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(auth.authenticate(&request(&headers, &empty)));

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; tidepool_api_key=s3cret"));
        assert!(auth.authenticate(&request(&headers, &empty)));

        let query = HashMap::from([(API_KEY_QUERY.to_string(), "s3cret".to_string())]);
        assert!(auth.authenticate(&request(&HeaderMap::new(), &query)));
    }

    #[test_timeout::timeout]
    fn rejects_wrong_or_missing_key() {
        let auth = ApiKeyAuthenticator::new(Some("s3cret".into()));
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("guess"));
        assert!(!auth.authenticate(&request(&headers, &HashMap::new())));
        assert!(!auth.authenticate(&request(&HeaderMap::new(), &HashMap::new())));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn tokens_expire() {
        let store = TokenStore::new(Duration::from_secs(60), false);
        let issued = store.issue();
        assert_eq!(issued.token.len(), TOKEN_LEN);
        assert!(store.validate(&issued.token));
        assert!(store.validate(&issued.token));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!store.validate(&issued.token));
        assert!(store.is_empty());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn single_use_tokens_are_consumed() {
        let store = TokenStore::new(WS_TOKEN_TTL, true);
        let issued = store.issue();
        assert!(store.validate(&issued.token));
        assert!(!store.validate(&issued.token));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn revoked_tokens_stop_validating() {
        let store = TokenStore::new(TERMINAL_TOKEN_TTL, false);
        let issued = store.issue();
        assert!(store.revoke(&issued.token));
        assert!(!store.validate(&issued.token));
        assert!(!store.revoke(&issued.token));
    }

    #[test_timeout::timeout]
    fn constant_time_eq_matches_plain_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
