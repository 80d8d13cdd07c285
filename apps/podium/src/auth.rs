use axum::http::{header, HeaderMap};
use tracing::warn;

use crate::storage::{AuthSession, Storage};

/// Resolve the caller's session for protected routes. Tokens arrive as a
/// bearer header or a `session` cookie and are looked up in the shared KV,
/// where the external auth layer writes them; expiry is the key's TTL.
pub async fn session_from_headers(storage: &Storage, headers: &HeaderMap) -> Option<AuthSession> {
    let token = bearer_token(headers).or_else(|| cookie_value(headers, "session"))?;
    match storage.get_auth_session(&token).await {
        Ok(session) => session,
        Err(err) => {
            warn!(%err, "auth session lookup failed");
            None
        }
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    raw.strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}
