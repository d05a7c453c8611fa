//! Embedded OAuth 2.1 authorization server
//!
//! MCP clients authorize against the gateway, not the CRM. The gateway
//! runs PKCE-protected authorization codes, forwards the user to the upstream
//! consent page in between, and finally issues its own short-lived JWT whose
//! `userKey` claim selects the upstream tokens.

pub mod bridge;
pub mod clients;
pub mod pages;
pub mod pkce;
pub mod storage;
pub mod tokens;
pub mod types;
pub mod validators;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::OAuthServerConfig;
use crate::session::now_ms;
use storage::{AuthorizationCodeData, OAuthStorage};
use tokens::TokenIssuer;
pub use types::{
    AccessTokenResponse, AuthorizationRequest, AuthorizationServerMetadata, OAuthClient,
    OAuthError, TokenRequest,
};

/// Authorization server counters for `/health`
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct OAuthStats {
    /// Registered clients
    pub clients: usize,
    /// Outstanding authorization codes
    pub codes: usize,
    /// Pending client states
    pub states: usize,
}

/// The authorization server
pub struct OAuthServer {
    public_url: String,
    config: OAuthServerConfig,
    storage: OAuthStorage,
    tokens: TokenIssuer,
}

fn ttl_ms(d: std::time::Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl OAuthServer {
    /// Create a server advertising `public_url`
    pub fn new(public_url: &str, config: OAuthServerConfig) -> Self {
        let tokens = TokenIssuer::new(config.access_token_ttl);
        Self {
            public_url: public_url.trim_end_matches('/').to_string(),
            config,
            storage: OAuthStorage::new(),
            tokens,
        }
    }

    /// Externally visible base URL
    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    /// RFC 8414 metadata
    pub fn metadata(&self) -> AuthorizationServerMetadata {
        let base = &self.public_url;
        AuthorizationServerMetadata {
            issuer: base.clone(),
            authorization_endpoint: format!("{base}/authorize"),
            token_endpoint: format!("{base}/token"),
            registration_endpoint: format!("{base}/register"),
            response_types_supported: vec!["code".into()],
            grant_types_supported: vec!["authorization_code".into()],
            token_endpoint_auth_methods_supported: vec![
                "none".into(),
                "client_secret_post".into(),
            ],
            code_challenge_methods_supported: vec![pkce::METHOD_S256.into()],
            scopes_supported: vec!["openid".into()],
        }
    }

    /// Dynamic client registration
    pub fn register_client(&self, redirect_uris: Vec<String>) -> OAuthClient {
        let client = clients::create_client(redirect_uris);
        self.storage.add_client(client.clone());
        client
    }

    /// Look up a client
    pub fn get_client(&self, client_id: &str) -> Option<OAuthClient> {
        self.storage.get_client(client_id)
    }

    /// Validate an authorize request, auto-registering an unknown client for
    /// the requested redirect URI when enabled. An already known client is
    /// never extended with new URIs.
    pub fn validate_authorization_request(
        &self,
        params: &AuthorizationRequest,
    ) -> Result<OAuthClient, OAuthError> {
        let client = match self.storage.get_client(&params.client_id) {
            Some(c) => Some(c),
            None if self.config.auto_register
                && !params.client_id.is_empty()
                && validators::is_valid_redirect_uri(&params.redirect_uri) =>
            {
                let (client, _) = self.storage.get_or_insert_client(&params.client_id, || {
                    clients::auto_register_client(&params.client_id, &params.redirect_uri)
                });
                Some(client)
            }
            None => None,
        };
        validators::validate_authorization_request(params, client.as_ref())?;
        client.ok_or_else(|| OAuthError::invalid_client("Client not found"))
    }

    /// Whether `redirect_uri` is registered for `client_id`
    pub fn is_registered_redirect(&self, client_id: &str, redirect_uri: &str) -> bool {
        self.storage
            .get_client(client_id)
            .is_some_and(|c| c.allows_redirect(redirect_uri))
    }

    /// Remember a client state until the consent round trip finishes
    pub fn store_state(&self, state: &str, client_id: &str) {
        self.storage
            .store_state(state, client_id, ttl_ms(self.config.pending_ttl));
    }

    /// Consume a client state; valid when known, unexpired and owned by
    /// `client_id`
    pub fn validate_state(&self, state: &str, client_id: &str) -> bool {
        match self.storage.take_state(state) {
            Some(pending) => pending.client_id == client_id && now_ms() <= pending.expires_at,
            None => false,
        }
    }

    /// Mint a single-use authorization code
    pub fn generate_authorization_code(
        &self,
        client_id: &str,
        redirect_uri: &str,
        code_challenge: &str,
        code_challenge_method: &str,
        user_key: &str,
    ) -> String {
        let code = pkce::generate_opaque_token();
        self.storage.store_code(
            &code,
            AuthorizationCodeData {
                client_id: client_id.to_string(),
                redirect_uri: redirect_uri.to_string(),
                code_challenge: code_challenge.to_string(),
                code_challenge_method: code_challenge_method.to_string(),
                user_key: user_key.to_string(),
                expires_at: now_ms() + ttl_ms(self.config.code_ttl),
            },
        );
        debug!(client_id = %client_id, user_key = %user_key, "Authorization code issued");
        code
    }

    /// Redeem a code for a gateway access token.
    ///
    /// An expired code is deleted. A mismatched client, redirect URI or
    /// verifier leaves the code in place until it expires. Exactly one caller
    /// can redeem a given code.
    pub fn exchange_code_for_token(
        &self,
        request: &TokenRequest,
    ) -> Result<AccessTokenResponse, OAuthError> {
        validators::validate_token_request(request)?;
        let code = request.code.as_deref().unwrap_or_default();
        let verifier = request.code_verifier.as_deref().unwrap_or_default();

        let Some(data) = self.storage.get_code(code) else {
            return Err(OAuthError::invalid_grant("Invalid authorization code"));
        };
        if now_ms() > data.expires_at {
            self.storage.delete_code(code);
            return Err(OAuthError::invalid_grant("Authorization code expired"));
        }
        if data.client_id != request.client_id {
            return Err(OAuthError::invalid_grant("Client ID mismatch"));
        }
        if request.redirect_uri.as_deref() != Some(data.redirect_uri.as_str()) {
            return Err(OAuthError::invalid_grant("Redirect URI mismatch"));
        }
        if data.code_challenge_method != pkce::METHOD_S256
            || !pkce::verify_s256(verifier, &data.code_challenge)
        {
            warn!(client_id = %data.client_id, "PKCE verification failed");
            return Err(OAuthError::invalid_grant("Invalid code verifier"));
        }
        if !self.storage.redeem_code(code, &data) {
            return Err(OAuthError::invalid_grant("Invalid authorization code"));
        }

        info!(
            client_id = %data.client_id,
            user_key = %data.user_key,
            "Gateway access token issued"
        );
        self.tokens
            .create_token_response(&data.user_key, &data.client_id)
    }

    /// `userKey` of a valid gateway access token
    pub fn validate_access_token(&self, token: &str) -> Option<String> {
        self.tokens.validate_access_token(token)
    }

    /// Drop expired codes and states
    pub fn cleanup(&self) {
        self.storage.cleanup();
    }

    /// Counters
    pub fn stats(&self) -> OAuthStats {
        let (clients, codes, states) = self.storage.counts();
        OAuthStats {
            clients,
            codes,
            states,
        }
    }

    #[cfg(test)]
    fn expire_code(&self, code: &str) {
        if let Some(mut data) = self.storage.get_code(code) {
            data.expires_at = now_ms() - 1;
            self.storage.store_code(code, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;

    const REDIRECT: &str = "http://localhost:6274/callback";

    fn server() -> OAuthServer {
        OAuthServer::new("http://gw.example/", OAuthServerConfig::default())
    }

    fn authorize(client_id: &str, redirect_uri: &str, challenge: &str) -> AuthorizationRequest {
        AuthorizationRequest {
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            response_type: "code".into(),
            state: Some("st".into()),
            code_challenge: challenge.into(),
            code_challenge_method: "S256".into(),
            scope: None,
        }
    }

    fn token_request(client_id: &str, code: &str, verifier: &str) -> TokenRequest {
        TokenRequest {
            grant_type: "authorization_code".into(),
            client_id: client_id.into(),
            code: Some(code.into()),
            redirect_uri: Some(REDIRECT.into()),
            code_verifier: Some(verifier.into()),
        }
    }

    #[test]
    fn metadata_uses_trimmed_public_url() {
        let meta = server().metadata();
        assert_eq!(meta.issuer, "http://gw.example");
        assert_eq!(meta.authorization_endpoint, "http://gw.example/authorize");
        assert_eq!(meta.token_endpoint, "http://gw.example/token");
        assert_eq!(meta.registration_endpoint, "http://gw.example/register");
        assert_eq!(meta.grant_types_supported, vec!["authorization_code".to_string()]);
        assert_eq!(
            meta.token_endpoint_auth_methods_supported,
            vec!["none".to_string(), "client_secret_post".to_string()]
        );
        assert_eq!(meta.code_challenge_methods_supported, vec!["S256".to_string()]);
        assert_eq!(meta.scopes_supported, vec!["openid".to_string()]);
    }

    #[test]
    fn pkce_round_trip_issues_token_once() {
        let server = server();
        let (verifier, challenge) = pkce::generate_pkce();
        server
            .validate_authorization_request(&authorize("claude", REDIRECT, &challenge))
            .unwrap();
        let code =
            server.generate_authorization_code("claude", REDIRECT, &challenge, "S256", "alice");

        let token = server
            .exchange_code_for_token(&token_request("claude", &code, &verifier))
            .unwrap();
        assert_eq!(token.user_key, "alice");
        assert_eq!(
            server.validate_access_token(&token.access_token).as_deref(),
            Some("alice")
        );

        let again = server
            .exchange_code_for_token(&token_request("claude", &code, &verifier))
            .unwrap_err();
        assert_eq!(again.error, "invalid_grant");
    }

    #[test]
    fn wrong_verifier_keeps_code_until_expiry() {
        let server = server();
        let (verifier, challenge) = pkce::generate_pkce();
        let code = server.generate_authorization_code("c", REDIRECT, &challenge, "S256", "alice");

        let err = server
            .exchange_code_for_token(&token_request("c", &code, "wrong"))
            .unwrap_err();
        assert_eq!(err, OAuthError::invalid_grant("Invalid code verifier"));
        let err = server
            .exchange_code_for_token(&token_request("other", &code, &verifier))
            .unwrap_err();
        assert_eq!(err, OAuthError::invalid_grant("Client ID mismatch"));
        assert_eq!(server.stats().codes, 1);

        assert!(server
            .exchange_code_for_token(&token_request("c", &code, &verifier))
            .is_ok());
        assert_eq!(server.stats().codes, 0);
    }

    #[test]
    fn expired_code_is_deleted() {
        let server = server();
        let (verifier, challenge) = pkce::generate_pkce();
        let code = server.generate_authorization_code("c", REDIRECT, &challenge, "S256", "alice");
        server.expire_code(&code);

        let err = server
            .exchange_code_for_token(&token_request("c", &code, &verifier))
            .unwrap_err();
        assert_eq!(err, OAuthError::invalid_grant("Authorization code expired"));
        assert_eq!(server.stats().codes, 0);
    }

    #[test]
    fn redirect_uri_mismatch_is_rejected() {
        let server = server();
        let (verifier, challenge) = pkce::generate_pkce();
        let code = server.generate_authorization_code("c", REDIRECT, &challenge, "S256", "alice");
        let mut request = token_request("c", &code, &verifier);
        request.redirect_uri = Some("http://localhost:6274/other".into());
        assert_eq!(
            server.exchange_code_for_token(&request).unwrap_err(),
            OAuthError::invalid_grant("Redirect URI mismatch")
        );
    }

    #[test]
    fn omitted_redirect_uri_is_rejected() {
        let server = server();
        let (verifier, challenge) = pkce::generate_pkce();
        let code = server.generate_authorization_code("c", REDIRECT, &challenge, "S256", "alice");
        let mut request = token_request("c", &code, &verifier);
        request.redirect_uri = None;
        assert_eq!(
            server.exchange_code_for_token(&request).unwrap_err(),
            OAuthError::invalid_grant("Redirect URI mismatch")
        );

        request.redirect_uri = Some(REDIRECT.into());
        assert!(server.exchange_code_for_token(&request).is_ok());
    }

    #[test]
    fn concurrent_redemption_has_one_winner() {
        let server = Arc::new(server());
        let (verifier, challenge) = pkce::generate_pkce();
        let code = server.generate_authorization_code("c", REDIRECT, &challenge, "S256", "alice");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let server = Arc::clone(&server);
                let request = token_request("c", &code, &verifier);
                std::thread::spawn(move || server.exchange_code_for_token(&request).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn auto_registration_is_scoped_to_first_redirect() {
        let server = server();
        let first = server
            .validate_authorization_request(&authorize("claude", REDIRECT, "ch"))
            .unwrap();
        assert_eq!(first.redirect_uris, vec![REDIRECT.to_string()]);

        let err = server
            .validate_authorization_request(&authorize("claude", "http://evil.example/cb", "ch"))
            .unwrap_err();
        assert_eq!(err, OAuthError::invalid_request("Invalid redirect_uri"));
        assert!(!server.is_registered_redirect("claude", "http://evil.example/cb"));
    }

    #[test]
    fn unknown_client_rejected_without_auto_register() {
        let config = OAuthServerConfig {
            auto_register: false,
            ..OAuthServerConfig::default()
        };
        let server = OAuthServer::new("http://gw", config);
        let err = server
            .validate_authorization_request(&authorize("nobody", REDIRECT, "ch"))
            .unwrap_err();
        assert_eq!(err.error, "invalid_client");
        assert_eq!(server.stats().clients, 0);
    }

    #[test]
    fn registered_client_validates() {
        let server = server();
        let client = server.register_client(vec![REDIRECT.to_string()]);
        assert!(server
            .validate_authorization_request(&authorize(&client.client_id, REDIRECT, "ch"))
            .is_ok());
        assert!(server.is_registered_redirect(&client.client_id, REDIRECT));
    }

    #[test]
    fn state_is_single_use_and_client_bound() {
        let server = server();
        server.store_state("s1", "c1");
        assert!(!server.validate_state("s1", "c2"));
        assert!(!server.validate_state("s1", "c1"));

        server.store_state("s2", "c1");
        assert!(server.validate_state("s2", "c1"));
        assert!(!server.validate_state("s2", "c1"));
    }
}
