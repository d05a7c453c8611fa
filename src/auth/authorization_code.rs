//! Multi-tenant OAuth2 authorization-code flow.
//!
//! There is no provider-wide token. Each call resolves the effective user
//! from the request context and works on that user's entry in the
//! [`SessionContext`]. Stale tokens are refreshed at most once concurrently
//! per user; missing or unrefreshable tokens surface as
//! [`Error::NeedsConsent`] carrying a resumable consent URL.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use tracing::{info, warn};
use url::Url;

use super::single_flight::SingleFlight;
use super::token_endpoint::{TokenEndpoint, TokenExchangeFailure};
use super::{AUTHORIZE_ENDPOINT, bearer_token, build_headers};
use crate::config::AuthorizationCodeAuth;
use crate::context;
use crate::session::{
    RefreshStats, SessionContext, TokenRefreshScheduler, TokenRefresher, UserTokens,
    expiry_with_margin, now_ms,
};
use crate::{Error, Result};

/// Scope requested when none is configured
pub const DEFAULT_SCOPE: &str = "offline_access";

/// `expires_in` assumed when the identity server omits it
pub const DEFAULT_EXPIRES_IN: i64 = 180;

/// Consent URL for a user: `{public_url}/oauth/start?userKey=<encoded>`
pub fn consent_url(public_url: &str, user_key: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(user_key.as_bytes()).collect();
    format!("{}/oauth/start?userKey={encoded}", public_url.trim_end_matches('/'))
}

/// Client registration at the upstream identity server
#[derive(Debug, Clone)]
struct CodeClient {
    client_id: String,
    client_secret: Option<String>,
    redirect_uri: String,
    scope: String,
}

impl CodeClient {
    fn form<'a>(&'a self, grant_type: &'a str) -> Vec<(&'a str, &'a str)> {
        let mut form = vec![("grant_type", grant_type), ("client_id", self.client_id.as_str())];
        if let Some(secret) = self.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }
        form
    }
}

/// Per-user token operations shared by the provider and the background
/// refresher.
pub struct CodeFlowTokens {
    sessions: Arc<SessionContext>,
    endpoint: Arc<TokenEndpoint>,
    client: Arc<CodeClient>,
    inflight: SingleFlight<UserTokens, TokenExchangeFailure>,
}

impl CodeFlowTokens {
    /// Refresh `user_key`'s tokens, sharing one exchange among concurrent
    /// callers. `stale_access_token` is the token the caller found unusable;
    /// if the stored token has changed and is valid by the time the exchange
    /// would start, it is returned without contacting the identity server.
    async fn refresh_for(
        &self,
        user_key: &str,
        stale_access_token: &str,
    ) -> std::result::Result<UserTokens, TokenExchangeFailure> {
        let sessions = Arc::clone(&self.sessions);
        let endpoint = Arc::clone(&self.endpoint);
        let client = Arc::clone(&self.client);
        let user = user_key.to_string();
        let stale = stale_access_token.to_string();

        self.inflight
            .run(user_key, move || async move {
                let current = sessions.tokens_for_user(&user);
                if let Some(current) = &current {
                    if current.access_token != stale && current.is_valid() {
                        return Ok(current.clone());
                    }
                }
                let Some(refresh_token) = current.and_then(|t| t.refresh_token) else {
                    return Err(TokenExchangeFailure::NoAccessToken);
                };
                refresh_now(&sessions, &endpoint, &client, &user, refresh_token).await
            })
            .await
    }
}

async fn refresh_now(
    sessions: &SessionContext,
    endpoint: &TokenEndpoint,
    client: &CodeClient,
    user_key: &str,
    refresh_token: String,
) -> std::result::Result<UserTokens, TokenExchangeFailure> {
    info!(user_key = %user_key, "Refreshing upstream tokens");
    let mut form = client.form("refresh_token");
    form.push(("refresh_token", refresh_token.as_str()));
    form.push(("redirect_uri", client.redirect_uri.as_str()));
    form.push(("scope", client.scope.as_str()));

    match endpoint.request_token(&form, DEFAULT_EXPIRES_IN).await {
        Ok(granted) => {
            let rotated = granted.refresh_token.is_some();
            let tokens = UserTokens {
                access_token: granted.access_token,
                access_token_expiry_ms: expiry_with_margin(now_ms(), granted.expires_in, 1),
                refresh_token: granted.refresh_token.or(Some(refresh_token)),
            };
            sessions.set_tokens_for_user(user_key, tokens.clone());
            info!(
                user_key = %user_key,
                expires_in = granted.expires_in,
                rotated,
                "Upstream tokens refreshed"
            );
            Ok(tokens)
        }
        Err(failure) => {
            if failure.is_rejection() {
                warn!(
                    user_key = %user_key,
                    reason = %failure.code(),
                    "Refresh rejected, discarding tokens"
                );
                sessions.delete_tokens_for_user(user_key);
            } else {
                warn!(user_key = %user_key, reason = %failure.code(), "Refresh failed");
            }
            Err(failure)
        }
    }
}

#[async_trait]
impl TokenRefresher for CodeFlowTokens {
    async fn refresh_user_tokens(&self, user_key: &str) -> Result<()> {
        let saved = self
            .sessions
            .tokens_for_user(user_key)
            .filter(|t| t.refresh_token.is_some())
            .ok_or_else(|| Error::upstream_auth("oauth2_no_refresh_token"))?;
        self.refresh_for(user_key, &saved.access_token)
            .await
            .map(|_| ())
            .map_err(|f| Error::upstream_auth(f.code()))
    }
}

/// Authorization-code provider
pub struct AuthorizationCodeProvider {
    tokens: Arc<CodeFlowTokens>,
    scheduler: Arc<TokenRefreshScheduler>,
    public_url: String,
}

impl AuthorizationCodeProvider {
    /// Create a provider and its refresh scheduler
    pub fn new(
        endpoint: TokenEndpoint,
        credentials: AuthorizationCodeAuth,
        sessions: Arc<SessionContext>,
        public_url: String,
        refresh_period: std::time::Duration,
    ) -> Self {
        let client = CodeClient {
            client_id: credentials.client_id,
            client_secret: credentials.client_secret.filter(|s| !s.is_empty()),
            redirect_uri: credentials.redirect_uri,
            scope: credentials
                .scope
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
        };
        let tokens = Arc::new(CodeFlowTokens {
            sessions: Arc::clone(&sessions),
            endpoint: Arc::new(endpoint),
            client: Arc::new(client),
            inflight: SingleFlight::new(),
        });
        let scheduler = Arc::new(TokenRefreshScheduler::new(
            sessions,
            Arc::clone(&tokens) as Arc<dyn TokenRefresher>,
            refresh_period,
        ));
        Self {
            tokens,
            scheduler,
            public_url,
        }
    }

    fn sessions(&self) -> &SessionContext {
        &self.tokens.sessions
    }

    /// Error for a user without usable tokens
    fn needs_consent(&self, user_key: Option<&str>) -> Error {
        Error::NeedsConsent {
            consent_url: user_key.map(|u| consent_url(&self.public_url, u)),
        }
    }

    /// Headers carrying the current user's bearer token
    pub async fn get_headers(&self, accept: &str, is_json: bool) -> Result<HeaderMap> {
        let token = self.ensure_access_token(None).await?;
        build_headers(accept, is_json, Some(&token))
    }

    /// Refresh the current user's tokens unless the token in `stale` was
    /// already replaced
    pub async fn refresh(&self, stale: &HeaderMap) -> Result<()> {
        let stale_token = bearer_token(stale).unwrap_or_default();
        self.ensure_access_token(Some(stale_token)).await.map(|_| ())
    }

    /// With `stale`, refresh even a token that looks valid, unless the stored
    /// token differs from `stale`
    async fn ensure_access_token(&self, stale: Option<&str>) -> Result<String> {
        let Some(user_key) = context::effective_user_key(self.sessions()) else {
            warn!("No user key in request context");
            return Err(self.needs_consent(None));
        };

        let Some(saved) = self.sessions().tokens_for_user(&user_key) else {
            info!(user_key = %user_key, "No saved upstream tokens");
            return Err(self.needs_consent(Some(&user_key)));
        };

        if saved.is_valid() && stale.is_none_or(|s| s != saved.access_token) {
            return Ok(saved.access_token);
        }

        if saved.refresh_token.is_none() {
            self.sessions().delete_tokens_for_user(&user_key);
            return Err(self.needs_consent(Some(&user_key)));
        }

        let stale = stale.unwrap_or(saved.access_token.as_str());
        match self.tokens.refresh_for(&user_key, stale).await {
            Ok(tokens) => Ok(tokens.access_token),
            Err(failure) => {
                warn!(
                    user_key = %user_key,
                    reason = %failure.code(),
                    "Upstream token refresh failed"
                );
                Err(self.needs_consent(Some(&user_key)))
            }
        }
    }

    /// Upstream authorize URL for `state`
    pub fn authorize_url(&self, state: &str) -> Result<String> {
        let client = &self.tokens.client;
        let mut url = Url::parse(&format!(
            "{}{AUTHORIZE_ENDPOINT}",
            self.tokens.endpoint.identity_base()
        ))
        .map_err(|e| Error::Config(format!("Invalid identity base URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &client.client_id)
            .append_pair("redirect_uri", &client.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("state", state)
            .append_pair("scope", &client.scope);
        Ok(url.into())
    }

    /// Exchange an upstream authorization code for the current user's tokens
    /// and arm background refresh.
    pub async fn finish_authorization(&self, code: &str) -> Result<()> {
        let user_key = context::effective_user_key(self.sessions())
            .ok_or_else(|| Error::upstream_auth("oauth2_code_missing_user"))?;
        info!(user_key = %user_key, "Completing upstream authorization");

        let client = &self.tokens.client;
        let mut form = client.form("authorization_code");
        form.push(("code", code));
        form.push(("redirect_uri", client.redirect_uri.as_str()));
        form.push(("scope", client.scope.as_str()));

        let granted = self
            .tokens
            .endpoint
            .request_token(&form, DEFAULT_EXPIRES_IN)
            .await
            .map_err(|failure| {
                warn!(
                    user_key = %user_key,
                    reason = %failure.code(),
                    "Authorization code exchange failed"
                );
                self.needs_consent(Some(&user_key))
            })?;

        self.sessions().set_tokens_for_user(
            &user_key,
            UserTokens {
                access_token: granted.access_token,
                access_token_expiry_ms: expiry_with_margin(now_ms(), granted.expires_in, 1),
                refresh_token: granted.refresh_token,
            },
        );
        self.scheduler.schedule_refresh(&user_key);
        info!(user_key = %user_key, "Upstream authorization complete");
        Ok(())
    }

    /// Revoke the explicit user's upstream refresh token (best effort), then
    /// always forget the local tokens and stop background refresh.
    pub async fn revoke(&self) -> Result<()> {
        let Some(user_key) = context::user_key() else {
            return Ok(());
        };

        if let Some(refresh_token) = self
            .sessions()
            .tokens_for_user(&user_key)
            .and_then(|t| t.refresh_token)
        {
            let client = &self.tokens.client;
            let mut form = vec![("client_id", client.client_id.as_str())];
            if let Some(secret) = client.client_secret.as_deref() {
                form.push(("client_secret", secret));
            }
            form.push(("token", refresh_token.as_str()));
            form.push(("token_type_hint", "refresh_token"));
            if let Err(failure) = self.tokens.endpoint.revoke(&form).await {
                warn!(user_key = %user_key, reason = %failure.code(), "Upstream revocation failed");
            }
        }

        self.sessions().delete_tokens_for_user(&user_key);
        self.scheduler.cancel(&user_key);
        info!(user_key = %user_key, "Upstream tokens revoked");
        Ok(())
    }

    /// Background refresh counters
    pub fn refresh_stats(&self) -> RefreshStats {
        self.scheduler.stats()
    }

    /// Stop all background refresh tasks
    pub fn shutdown(&self) {
        self.scheduler.cancel_all();
    }
}
