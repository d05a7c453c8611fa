//! OAuth2 client-credentials grant

use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{bearer_token, build_headers};
use super::token_endpoint::TokenEndpoint;
use crate::config::ClientCredentialsAuth;
use crate::session::{expiry_with_margin, now_ms};
use crate::{Error, Result};

/// `expires_in` assumed when the identity server omits it
pub const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Stable failure code
pub const AUTH_ERROR_CODE: &str = "oauth2_auth_failed";

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expiry_ms: i64,
}

/// One service identity shared by every request
pub struct ClientCredentialsProvider {
    endpoint: TokenEndpoint,
    credentials: ClientCredentialsAuth,
    cached: RwLock<Option<CachedToken>>,
    acquire_lock: Mutex<()>,
}

impl ClientCredentialsProvider {
    /// Create a provider
    pub fn new(endpoint: TokenEndpoint, credentials: ClientCredentialsAuth) -> Self {
        Self {
            endpoint,
            credentials,
            cached: RwLock::new(None),
            acquire_lock: Mutex::new(()),
        }
    }

    /// Headers with a bearer token
    pub async fn get_headers(&self, accept: &str, is_json: bool) -> Result<HeaderMap> {
        let token = self.ensure_access_token().await?;
        build_headers(accept, is_json, Some(&token))
    }

    /// Acquire a new token unless the one in `stale` was already replaced
    pub async fn refresh(&self, stale: &HeaderMap) -> Result<()> {
        {
            let _guard = self.acquire_lock.lock().await;
            if self
                .cached_valid()
                .is_some_and(|token| Some(token.as_str()) != bearer_token(stale))
            {
                debug!(auth = "oauth2", "Token already replaced, skipping request");
                return Ok(());
            }
            *self.cached.write() = None;
        }
        self.ensure_access_token().await.map(|_| ())
    }

    /// Discard the cached token
    pub fn revoke(&self) {
        *self.cached.write() = None;
    }

    fn cached_valid(&self) -> Option<String> {
        let now = now_ms();
        self.cached
            .read()
            .as_ref()
            .filter(|t| now < t.expiry_ms)
            .map(|t| t.access_token.clone())
    }

    async fn ensure_access_token(&self) -> Result<String> {
        if let Some(token) = self.cached_valid() {
            return Ok(token);
        }

        let _guard = self.acquire_lock.lock().await;
        if let Some(token) = self.cached_valid() {
            return Ok(token);
        }

        info!(
            url = %self.endpoint.token_url(),
            auth = "oauth2",
            "Upstream token request started"
        );
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];
        if let Some(scope) = self.credentials.scope.as_deref() {
            form.push(("scope", scope));
        }

        let granted = self
            .endpoint
            .request_token(&form, DEFAULT_EXPIRES_IN)
            .await
            .map_err(|failure| {
                error!(auth = "oauth2", reason = %failure.code(), "Upstream token request failed");
                Error::upstream_auth(AUTH_ERROR_CODE)
            })?;

        let token = CachedToken {
            access_token: granted.access_token,
            expiry_ms: expiry_with_margin(now_ms(), granted.expires_in, 1),
        };
        *self.cached.write() = Some(token.clone());
        info!(auth = "oauth2", expires_in = granted.expires_in, "Upstream token acquired");
        Ok(token.access_token)
    }
}
