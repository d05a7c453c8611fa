//! Process-wide session registry.
//!
//! [`SessionContext`] tracks three kinds of state shared by every request the
//! gateway serves:
//!
//! - inbound sessions (`session_id` → [`SessionInfo`] + owned transport),
//! - cached upstream credentials (`user_key` → [`UserTokens`]),
//! - pending upstream authorization states (`state` → [`OAuthState`]).
//!
//! It is built once at the composition root and shared through `Arc`.
//! All maps are `DashMap`s and no shard lock is ever held across an `.await`
//! or while a transport is being closed.

mod scheduler;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::Result;
use crate::oauth::pkce;

pub use scheduler::{DEFAULT_REFRESH_PERIOD, RefreshStats, TokenRefreshScheduler, TokenRefresher};

/// Seconds subtracted from every upstream `expires_in`
pub const EXPIRES_MARGIN_SECONDS: i64 = 30;

/// Lifetime of an upstream OAuth state
pub const OAUTH_STATE_TTL_MS: i64 = 10 * 60 * 1000;

/// Current wall-clock time in Unix milliseconds
#[must_use]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Compute an absolute expiry for a token granted at `now_ms`.
///
/// The safety margin is subtracted, but the result always leaves at least
/// `min_seconds` of validity.
#[must_use]
pub fn expiry_with_margin(now_ms: i64, expires_in_secs: i64, min_seconds: i64) -> i64 {
    now_ms + (expires_in_secs - EXPIRES_MARGIN_SECONDS).max(min_seconds) * 1000
}

/// Upstream credentials cached for one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTokens {
    /// Upstream access token
    pub access_token: String,
    /// Expiry (Unix ms), margin already applied
    pub access_token_expiry_ms: i64,
    /// Upstream refresh token
    pub refresh_token: Option<String>,
}

impl UserTokens {
    /// Whether the access token may still be used at `now_ms`
    #[must_use]
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        !self.access_token.is_empty() && now_ms < self.access_token_expiry_ms
    }

    /// Whether the access token may still be used now
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(now_ms())
    }
}

/// A pending upstream authorization
#[derive(Debug, Clone)]
pub struct OAuthState {
    /// User the authorization is for
    pub user_key: String,
    /// Creation time (Unix ms)
    pub created_at: i64,
    /// Expiry time (Unix ms)
    pub expires_at: i64,
}

/// The connection half of an inbound session.
///
/// Owned exclusively by the registry. `close` may be called more than once
/// and must not panic.
pub trait SessionTransport: Send + Sync {
    /// Release the connection
    fn close(&self) -> Result<()>;
}

/// Transport for a Streamable HTTP session: requests arrive as independent
/// POSTs, so the transport only has to remember whether it was closed.
#[derive(Debug, Default)]
pub struct HttpSessionTransport {
    closed: AtomicBool,
}

impl HttpSessionTransport {
    /// Create an open transport
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl SessionTransport for HttpSessionTransport {
    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Snapshot of an inbound session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session id (the `Mcp-Session-Id` header value)
    pub id: String,
    /// User bound to this session, if resolved
    pub user_key: Option<String>,
    /// Whether the connection has been logged as established
    pub is_logged: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Client address
    pub remote_ip: Option<String>,
    /// Whether a transport is attached
    pub has_transport: bool,
}

struct SessionEntry {
    info: SessionInfo,
    transport: Option<Arc<dyn SessionTransport>>,
}

/// Registry counters
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct SessionStats {
    /// Open sessions
    pub sessions_count: usize,
    /// Users holding cached upstream tokens
    pub tokens_count: usize,
    /// Pending upstream authorization states
    pub oauth_states_count: usize,
}

/// Process-wide session registry
#[derive(Default)]
pub struct SessionContext {
    sessions: DashMap<String, SessionEntry>,
    user_tokens: DashMap<String, UserTokens>,
    oauth_states: DashMap<String, OAuthState>,
}

impl SessionContext {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── sessions ──────────────────────────────────────────────────────────

    /// Register a new session. Replaces any session with the same id.
    pub fn create_session(
        &self,
        session_id: &str,
        user_key: Option<String>,
        remote_ip: Option<String>,
    ) -> SessionInfo {
        let info = SessionInfo {
            id: session_id.to_string(),
            user_key,
            is_logged: false,
            created_at: Utc::now(),
            remote_ip,
            has_transport: false,
        };
        self.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                info: info.clone(),
                transport: None,
            },
        );
        debug!(session_id = %session_id, "Session created");
        info
    }

    /// Look up a session
    #[must_use]
    pub fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.get(session_id).map(|e| e.info.clone())
    }

    /// Whether a session exists
    #[must_use]
    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Mark a session as logged. Returns `false` if the session does not exist.
    pub fn mark_session_logged(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.info.is_logged = true;
                true
            }
            None => false,
        }
    }

    /// Attach the transport owned by a session
    pub fn set_session_transport(&self, session_id: &str, transport: Arc<dyn SessionTransport>) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.transport = Some(transport);
            entry.info.has_transport = true;
        }
    }

    /// Bind (or re-bind) a session to a user
    pub fn set_session_user_key(&self, session_id: &str, user_key: &str) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.info.user_key = Some(user_key.to_string());
            info!(session_id = %session_id, user_key = %user_key, "Session mapped to user");
        }
    }

    /// Retroactively bind every open session without a user to `user_key`.
    ///
    /// Sessions already bound to a user are left alone. Returns the ids that
    /// were bound.
    pub fn map_all_sessions_to_user(&self, user_key: &str) -> Vec<String> {
        let mut bound = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            if entry.transport.is_some() && entry.info.user_key.is_none() {
                entry.info.user_key = Some(user_key.to_string());
                bound.push(entry.key().clone());
            }
        }
        info!(
            user_key = %user_key,
            session_count = bound.len(),
            sessions = ?bound,
            "Mapped open sessions to user"
        );
        bound
    }

    /// Remove a session and close its transport.
    ///
    /// The entry leaves the map before the transport is closed, so readers
    /// never see a half-deleted session and a concurrent second delete is a
    /// no-op. Close failures are logged, never returned.
    pub fn delete_session(&self, session_id: &str) {
        let Some((_, entry)) = self.sessions.remove(session_id) else {
            return;
        };
        if let Some(transport) = entry.transport {
            if let Err(e) = transport.close() {
                warn!(session_id = %session_id, error = %e, "Transport close failed");
            }
        }
        debug!(session_id = %session_id, "Session deleted");
    }

    /// Snapshot of every session
    #[must_use]
    pub fn all_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|e| e.info.clone()).collect()
    }

    /// Sessions bound to `user_key`
    #[must_use]
    pub fn sessions_for_user(&self, user_key: &str) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .filter(|e| e.info.user_key.as_deref() == Some(user_key))
            .map(|e| e.info.clone())
            .collect()
    }

    // ── upstream tokens ───────────────────────────────────────────────────

    /// Cached tokens for a user
    #[must_use]
    pub fn tokens_for_user(&self, user_key: &str) -> Option<UserTokens> {
        self.user_tokens.get(user_key).map(|t| t.clone())
    }

    /// Cached tokens for the user bound to a session
    #[must_use]
    pub fn tokens_for_session(&self, session_id: &str) -> Option<UserTokens> {
        let user_key = self.get_session(session_id)?.user_key?;
        self.tokens_for_user(&user_key)
    }

    /// Tokens by explicit user, falling back to the session's user
    #[must_use]
    pub fn effective_tokens(
        &self,
        session_id: Option<&str>,
        user_key: Option<&str>,
    ) -> Option<UserTokens> {
        if let Some(user_key) = user_key {
            return self.tokens_for_user(user_key);
        }
        session_id.and_then(|s| self.tokens_for_session(s))
    }

    /// Store (replace) a user's tokens
    pub fn set_tokens_for_user(&self, user_key: &str, tokens: UserTokens) {
        self.user_tokens.insert(user_key.to_string(), tokens);
    }

    /// Forget a user's tokens
    pub fn delete_tokens_for_user(&self, user_key: &str) {
        if self.user_tokens.remove(user_key).is_some() {
            debug!(user_key = %user_key, "Deleted cached upstream tokens");
        }
    }

    // ── upstream OAuth states ─────────────────────────────────────────────

    /// Create a single-use state bound to `user_key`
    pub fn create_oauth_state(&self, user_key: &str) -> String {
        let state = pkce::generate_state();
        let now = now_ms();
        self.oauth_states.insert(
            state.clone(),
            OAuthState {
                user_key: user_key.to_string(),
                created_at: now,
                expires_at: now + OAUTH_STATE_TTL_MS,
            },
        );
        state
    }

    /// Consume a state: returns its user once, then never again.
    ///
    /// Expired states are removed and yield `None`.
    pub fn consume_oauth_state(&self, state: &str) -> Option<String> {
        let (_, info) = self.oauth_states.remove(state)?;
        if now_ms() > info.expires_at {
            debug!("Upstream OAuth state expired");
            return None;
        }
        Some(info.user_key)
    }

    /// Drop expired states
    pub fn cleanup_expired_oauth_states(&self) {
        let now = now_ms();
        self.oauth_states.retain(|_, s| now <= s.expires_at);
    }

    /// Registry counters
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            sessions_count: self.sessions.len(),
            tokens_count: self.user_tokens.len(),
            oauth_states_count: self.oauth_states.len(),
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_oauth_state(&self, state: &str, info: OAuthState) {
        self.oauth_states.insert(state.to_string(), info);
    }
}
