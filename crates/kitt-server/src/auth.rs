//! Bearer-token authentication.
//!
//! Agents present per-agent tokens; operators present the admin token. Only
//! SHA-256 hashes are at rest. Verification compares the presented token's
//! hash against every stored hash in constant time with no early exit, so the
//! accept and reject paths do the same amount of work.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Extract the bearer token from an Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get("authorization")?.to_str().ok()?;
    value.strip_prefix("Bearer ")
}

/// Who a verified token belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Admin,
    Agent(String),
}

/// Verify an agent token. Returns the owning agent id, or `None` for an
/// unknown/invalid token.
pub async fn verify_agent_token(state: &AppState, token: &str) -> Result<Option<String>> {
    let presented = hex::encode(Sha256::digest(token.as_bytes()));
    let presented_bytes = presented.as_bytes();

    let mut matched: Option<String> = None;
    // Scan every row; accumulate instead of returning early.
    for (agent_id, stored_hash) in kitt_db::list_agent_auth(&state.db).await? {
        let eq = if stored_hash.len() == presented.len() {
            stored_hash.as_bytes().ct_eq(presented_bytes)
        } else {
            // Compare against self to spend the same time, force mismatch.
            let _ = presented_bytes.ct_eq(presented_bytes);
            subtle::Choice::from(0)
        };
        if bool::from(eq) && matched.is_none() {
            matched = Some(agent_id);
        }
    }
    Ok(matched)
}

/// Verify the operator token. An empty configured admin token disables the
/// check (development mode; production always configures one).
pub fn verify_admin_token(state: &AppState, token: Option<&str>) -> bool {
    if state.settings.admin_token.is_empty() {
        return true;
    }
    match token {
        Some(t) => bool::from(
            t.as_bytes()
                .ct_eq(state.settings.admin_token.as_bytes()),
        ),
        None => false,
    }
}

/// Admin, or a valid agent token. Used by read endpoints both sides call.
pub async fn verify_any(state: &AppState, headers: &HeaderMap) -> Result<Option<Principal>> {
    let token = bearer_token(headers);
    if verify_admin_token(state, token) {
        return Ok(Some(Principal::Admin));
    }
    if let Some(t) = token {
        if let Some(agent_id) = verify_agent_token(state, t).await? {
            return Ok(Some(Principal::Agent(agent_id)));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Rejection logging rate limiter
// ---------------------------------------------------------------------------

/// At most one WARN per window for auth rejections; the rest go to DEBUG.
/// Keeps a flood of bad tokens from drowning the log.
pub struct RejectLog {
    last_warn: Mutex<Option<Instant>>,
    window: Duration,
}

impl RejectLog {
    pub fn new() -> Self {
        RejectLog {
            last_warn: Mutex::new(None),
            window: Duration::from_secs(10),
        }
    }

    pub fn note_rejection(&self, context: &str) {
        let mut last = self.last_warn.lock().expect("reject log lock poisoned");
        let now = Instant::now();
        let should_warn = match *last {
            Some(prev) => now.duration_since(prev) >= self.window,
            None => true,
        };
        if should_warn {
            *last = Some(now);
            tracing::warn!("auth rejected: {context} (further rejections logged at debug)");
        } else {
            tracing::debug!("auth rejected: {context}");
        }
    }
}

impl Default for RejectLog {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 hex digest of a raw token, as stored in the ledger.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc123"));

        let mut bad = HeaderMap::new();
        bad.insert("authorization", "Basic abc123".parse().unwrap());
        assert_eq!(bearer_token(&bad), None);

        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn hash_token_is_sha256_hex() {
        let h = hash_token("token");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_token("token"));
        assert_ne!(h, hash_token("tokenx"));
    }
}
