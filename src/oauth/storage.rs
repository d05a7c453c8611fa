//! In-memory state of the authorization server

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use super::types::OAuthClient;
use crate::session::now_ms;

/// A minted, not yet redeemed authorization code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCodeData {
    /// Client the code was minted for
    pub client_id: String,
    /// Redirect URI the code was minted for
    pub redirect_uri: String,
    /// PKCE challenge
    pub code_challenge: String,
    /// PKCE method
    pub code_challenge_method: String,
    /// User the code acts for
    pub user_key: String,
    /// Expiry (Unix ms)
    pub expires_at: i64,
}

/// A client `state` waiting for the upstream consent to finish
#[derive(Debug, Clone)]
pub struct PendingState {
    /// Client that started the authorization
    pub client_id: String,
    /// Expiry (Unix ms)
    pub expires_at: i64,
}

/// Clients, codes and pending states
#[derive(Default)]
pub struct OAuthStorage {
    clients: DashMap<String, OAuthClient>,
    codes: DashMap<String, AuthorizationCodeData>,
    states: DashMap<String, PendingState>,
}

impl OAuthStorage {
    /// Create empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a client
    pub fn add_client(&self, client: OAuthClient) {
        self.clients.insert(client.client_id.clone(), client);
    }

    /// Look up a client
    pub fn get_client(&self, client_id: &str) -> Option<OAuthClient> {
        self.clients.get(client_id).map(|c| c.clone())
    }

    /// Insert `make()` unless the client exists. Returns the stored client and
    /// whether it was inserted by this call.
    pub fn get_or_insert_client(
        &self,
        client_id: &str,
        make: impl FnOnce() -> OAuthClient,
    ) -> (OAuthClient, bool) {
        match self.clients.entry(client_id.to_string()) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(v) => {
                let client = make();
                v.insert(client.clone());
                (client, true)
            }
        }
    }

    /// Store a code
    pub fn store_code(&self, code: &str, data: AuthorizationCodeData) {
        self.codes.insert(code.to_string(), data);
    }

    /// Look up a code without consuming it
    pub fn get_code(&self, code: &str) -> Option<AuthorizationCodeData> {
        self.codes.get(code).map(|c| c.clone())
    }

    /// Remove a code only if it still holds `expected`. The caller that gets
    /// `true` is the one that redeemed it.
    pub fn redeem_code(&self, code: &str, expected: &AuthorizationCodeData) -> bool {
        self.codes.remove_if(code, |_, d| d == expected).is_some()
    }

    /// Remove a code
    pub fn delete_code(&self, code: &str) {
        self.codes.remove(code);
    }

    /// Remember a client state
    pub fn store_state(&self, state: &str, client_id: &str, ttl_ms: i64) {
        self.states.insert(
            state.to_string(),
            PendingState {
                client_id: client_id.to_string(),
                expires_at: now_ms() + ttl_ms,
            },
        );
    }

    /// Remove a pending state, returning it
    pub fn take_state(&self, state: &str) -> Option<PendingState> {
        self.states.remove(state).map(|(_, s)| s)
    }

    /// Drop expired codes and states
    pub fn cleanup(&self) {
        let now = now_ms();
        self.codes.retain(|_, d| now <= d.expires_at);
        self.states.retain(|_, s| now <= s.expires_at);
        debug!(
            remaining_codes = self.codes.len(),
            remaining_states = self.states.len(),
            "OAuth storage cleanup completed"
        );
    }

    /// `(clients, codes, states)`
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.clients.len(), self.codes.len(), self.states.len())
    }
}
