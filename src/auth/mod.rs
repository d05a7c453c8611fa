//! Upstream CRM authentication.
//!
//! Exactly one [`AuthProvider`] variant is chosen at startup from the
//! resolved [`AuthConfig`]. All operations dispatch exhaustively over the
//! variants; operations a variant does not offer return
//! [`Error::Unsupported`].

pub mod authorization_code;
pub mod client_credentials;
pub mod legacy;
pub mod single_flight;
pub mod token_endpoint;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::session::{RefreshStats, SessionContext};
use crate::{Error, Result};

pub use authorization_code::AuthorizationCodeProvider;
pub use client_credentials::ClientCredentialsProvider;
pub use legacy::LegacyProvider;
pub use token_endpoint::{TokenEndpoint, TokenExchangeFailure, identity_base};

/// Token endpoint path, relative to the identity base
pub const TOKEN_ENDPOINT: &str = "/connect/token";
/// Authorize endpoint path, relative to the identity base
pub const AUTHORIZE_ENDPOINT: &str = "/connect/authorize";
/// Revocation endpoint path, relative to the identity base
pub const REVOCATION_ENDPOINT: &str = "/connect/revocation";
/// Maximum number of response-body bytes logged on token errors
pub const TOKEN_BODY_SNIPPET_MAX: usize = 1024;

/// `Accept` value for OData JSON requests
pub const JSON_ACCEPT: &str = "application/json;odata.metadata=minimal";
/// `Accept` value for `$metadata` requests
pub const XML_ACCEPT: &str = "application/xml";

/// Which upstream authentication flow is in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    /// Cookie + CSRF session login
    Legacy,
    /// OAuth2 client-credentials
    #[serde(rename = "oauth2")]
    #[value(name = "oauth2")]
    OAuth2,
    /// OAuth2 authorization code, one token set per user
    #[serde(rename = "oauth2_code")]
    #[value(name = "oauth2_code")]
    OAuth2Code,
}

impl AuthKind {
    /// Configuration name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::OAuth2 => "oauth2",
            Self::OAuth2Code => "oauth2_code",
        }
    }
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| Error::Internal("credential is not a valid header value".to_string()))
}

/// Bearer token carried by `headers`, if any
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// `Accept`, optional JSON `Content-Type`, optional bearer token
pub fn build_headers(accept: &str, is_json: bool, token: Option<&str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, header_value(accept)?);
    if is_json {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    if let Some(token) = token {
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
    }
    Ok(headers)
}

/// Settings every provider may need besides its credentials
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// CRM base URL
    pub base_url: String,
    /// Externally reachable gateway URL, used in consent links
    pub public_url: String,
    /// Upstream request timeout
    pub timeout: Duration,
    /// Background refresh period for the code flow
    pub refresh_period: Duration,
}

/// The configured upstream authentication provider
pub enum AuthProvider {
    /// Cookie session
    Legacy(LegacyProvider),
    /// Client-credentials grant
    ClientCredentials(ClientCredentialsProvider),
    /// Per-user authorization-code grant
    AuthorizationCode(AuthorizationCodeProvider),
}

impl AuthProvider {
    /// Build the provider selected by `auth`
    pub fn from_config(
        auth: &AuthConfig,
        settings: &ProviderSettings,
        sessions: Arc<SessionContext>,
    ) -> Result<Self> {
        let endpoint_for = |id_base_url: Option<&str>| -> Result<TokenEndpoint> {
            let http = reqwest::Client::builder()
                .timeout(settings.timeout)
                .build()
                .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;
            Ok(TokenEndpoint::new(
                http,
                identity_base(&settings.base_url, id_base_url),
            ))
        };

        Ok(match auth {
            AuthConfig::Legacy(creds) => Self::Legacy(LegacyProvider::new(
                &settings.base_url,
                creds.clone(),
                settings.timeout,
            )?),
            AuthConfig::OAuth2(creds) => Self::ClientCredentials(ClientCredentialsProvider::new(
                endpoint_for(creds.id_base_url.as_deref())?,
                creds.clone(),
            )),
            AuthConfig::OAuth2Code(creds) => {
                Self::AuthorizationCode(AuthorizationCodeProvider::new(
                    endpoint_for(creds.id_base_url.as_deref())?,
                    creds.clone(),
                    sessions,
                    settings.public_url.clone(),
                    settings.refresh_period,
                ))
            }
        })
    }

    /// Which flow this provider implements
    pub fn kind(&self) -> AuthKind {
        match self {
            Self::Legacy(_) => AuthKind::Legacy,
            Self::ClientCredentials(_) => AuthKind::OAuth2,
            Self::AuthorizationCode(_) => AuthKind::OAuth2Code,
        }
    }

    /// Whether inbound requests must carry a gateway bearer token
    pub fn requires_user_authorization(&self) -> bool {
        matches!(self, Self::AuthorizationCode(_))
    }

    /// Authenticated request headers
    pub async fn get_headers(&self, accept: &str, is_json: bool) -> Result<HeaderMap> {
        match self {
            Self::Legacy(p) => p.get_headers(accept, is_json).await,
            Self::ClientCredentials(p) => p.get_headers(accept, is_json).await,
            Self::AuthorizationCode(p) => p.get_headers(accept, is_json).await,
        }
    }

    /// Re-acquire the credentials that produced `stale`.
    ///
    /// When another caller has already replaced them, the replacement is kept
    /// and nothing is re-acquired.
    pub async fn refresh(&self, stale: &HeaderMap) -> Result<()> {
        match self {
            Self::Legacy(p) => p.refresh(stale).await,
            Self::ClientCredentials(p) => p.refresh(stale).await,
            Self::AuthorizationCode(p) => p.refresh(stale).await,
        }
    }

    /// Invalidate stored credentials
    pub async fn revoke(&self) -> Result<()> {
        match self {
            Self::Legacy(p) => {
                p.revoke();
                Ok(())
            }
            Self::ClientCredentials(p) => {
                p.revoke();
                Ok(())
            }
            Self::AuthorizationCode(p) => p.revoke().await,
        }
    }

    /// Upstream authorize URL (code flow only)
    pub fn authorize_url(&self, state: &str) -> Result<String> {
        match self {
            Self::AuthorizationCode(p) => p.authorize_url(state),
            Self::Legacy(_) | Self::ClientCredentials(_) => Err(self.unsupported("authorize_url")),
        }
    }

    /// Exchange an upstream authorization code (code flow only)
    pub async fn finish_authorization(&self, code: &str) -> Result<()> {
        match self {
            Self::AuthorizationCode(p) => p.finish_authorization(code).await,
            Self::Legacy(_) | Self::ClientCredentials(_) => {
                Err(self.unsupported("finish_authorization"))
            }
        }
    }

    /// Background refresh counters (code flow only)
    pub fn refresh_stats(&self) -> Option<RefreshStats> {
        match self {
            Self::AuthorizationCode(p) => Some(p.refresh_stats()),
            Self::Legacy(_) | Self::ClientCredentials(_) => None,
        }
    }

    /// Stop background work
    pub fn shutdown(&self) {
        match self {
            Self::AuthorizationCode(p) => p.shutdown(),
            Self::Legacy(_) | Self::ClientCredentials(_) => {}
        }
    }

    fn unsupported(&self, operation: &'static str) -> Error {
        Error::Unsupported {
            provider: self.kind().as_str(),
            operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientCredentialsAuth, LegacyAuth};

    fn settings() -> ProviderSettings {
        ProviderSettings {
            base_url: "https://crm.example.com".into(),
            public_url: "http://localhost:3000".into(),
            timeout: Duration::from_secs(5),
            refresh_period: Duration::from_secs(900),
        }
    }

    #[test]
    fn build_headers_variants() {
        let plain = build_headers(XML_ACCEPT, false, None).unwrap();
        assert_eq!(plain[ACCEPT], XML_ACCEPT);
        assert!(plain.get(CONTENT_TYPE).is_none());
        assert!(plain.get(AUTHORIZATION).is_none());

        let full = build_headers(JSON_ACCEPT, true, Some("tok")).unwrap();
        assert_eq!(full[CONTENT_TYPE], "application/json");
        assert_eq!(full[AUTHORIZATION], "Bearer tok");
    }

    #[test]
    fn build_headers_rejects_control_characters() {
        assert!(build_headers(JSON_ACCEPT, false, Some("bad\ntoken")).is_err());
    }

    #[tokio::test]
    async fn non_code_providers_report_unsupported() {
        let sessions = Arc::new(SessionContext::new());
        let providers = [
            AuthProvider::from_config(
                &AuthConfig::Legacy(LegacyAuth {
                    login: "u".into(),
                    password: "p".into(),
                }),
                &settings(),
                Arc::clone(&sessions),
            )
            .unwrap(),
            AuthProvider::from_config(
                &AuthConfig::OAuth2(ClientCredentialsAuth {
                    client_id: "c".into(),
                    client_secret: "s".into(),
                    scope: None,
                    id_base_url: None,
                }),
                &settings(),
                Arc::clone(&sessions),
            )
            .unwrap(),
        ];

        for provider in &providers {
            assert!(!provider.requires_user_authorization());
            assert!(provider.refresh_stats().is_none());
            let err = provider.authorize_url("s").unwrap_err();
            assert!(matches!(err, Error::Unsupported { operation: "authorize_url", .. }));
            let err = provider.finish_authorization("c").await.unwrap_err();
            assert!(matches!(
                err,
                Error::Unsupported {
                    operation: "finish_authorization",
                    ..
                }
            ));
            provider.revoke().await.unwrap();
        }
        assert_eq!(providers[0].kind(), AuthKind::Legacy);
        assert_eq!(providers[1].kind().to_string(), "oauth2");
    }
}
