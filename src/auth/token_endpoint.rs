//! Upstream identity-server token endpoint

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use super::{REVOCATION_ENDPOINT, TOKEN_BODY_SNIPPET_MAX, TOKEN_ENDPOINT};

/// Why a token exchange failed.
///
/// Kept separate from [`crate::Error`] so that callers sharing one in-flight
/// exchange can each receive a copy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenExchangeFailure {
    /// The request never produced a response
    #[error("token request failed: {0}")]
    Network(String),
    /// Non-success status
    #[error("token endpoint returned {status}")]
    Status {
        /// HTTP status code
        status: u16,
    },
    /// Success status with an empty body
    #[error("token endpoint returned an empty body")]
    EmptyBody,
    /// Body was not a JSON token response
    #[error("token response could not be parsed")]
    Parse,
    /// Parsed, but no `access_token`
    #[error("token response has no access_token")]
    NoAccessToken,
}

impl TokenExchangeFailure {
    /// Whether the identity server explicitly refused the grant
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Status { status: 400 | 401 })
    }

    /// Short code for logs and error values
    pub fn code(&self) -> String {
        match self {
            Self::Network(_) => "token_network_error".to_string(),
            Self::Status { status } => format!("token_error:{status}"),
            Self::EmptyBody => "token_empty_body".to_string(),
            Self::Parse => "token_parse_failed".to_string(),
            Self::NoAccessToken => "no_access_token".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<Value>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// A successful grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantedToken {
    /// Access token
    pub access_token: String,
    /// Lifetime in seconds
    pub expires_in: i64,
    /// Refresh token, when the server issued one
    pub refresh_token: Option<String>,
}

/// Upstream identity base: `id_base_url` when set, else `base_url`, with the
/// trailing `/` trimmed and `/0` appended unless already present.
pub fn identity_base(base_url: &str, id_base_url: Option<&str>) -> String {
    let base = id_base_url
        .filter(|u| !u.is_empty())
        .unwrap_or(base_url)
        .trim_end_matches('/');
    if base.ends_with("/0") {
        base.to_string()
    } else {
        format!("{base}/0")
    }
}

/// Truncate a response body for logging
pub fn body_snippet(body: &str) -> String {
    if body.len() <= TOKEN_BODY_SNIPPET_MAX {
        return body.to_string();
    }
    let mut end = TOKEN_BODY_SNIPPET_MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [truncated]", &body[..end])
}

/// `expires_in` may arrive as a number or a numeric string; anything else,
/// including zero, falls back to `default`.
fn expires_in_or(value: Option<&Value>, default: i64) -> i64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.filter(|n| *n > 0).unwrap_or(default)
}

/// Form-posting client for `{identity}/connect/*`
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    http: Client,
    identity_base: String,
}

impl TokenEndpoint {
    /// Create a client for the given identity base
    pub fn new(http: Client, identity_base: String) -> Self {
        Self {
            http,
            identity_base,
        }
    }

    /// Identity base URL
    pub fn identity_base(&self) -> &str {
        &self.identity_base
    }

    /// `{identity}/connect/token`
    pub fn token_url(&self) -> String {
        format!("{}{TOKEN_ENDPOINT}", self.identity_base)
    }

    /// POST a grant and parse the token response
    pub async fn request_token(
        &self,
        form: &[(&str, &str)],
        default_expires_in: i64,
    ) -> Result<GrantedToken, TokenExchangeFailure> {
        let url = self.token_url();
        let grant_type = form
            .iter()
            .find(|(k, _)| *k == "grant_type")
            .map_or("", |(_, v)| *v);
        debug!(url = %url, grant_type = %grant_type, "Requesting upstream token");

        let response = self
            .http
            .post(&url)
            .form(form)
            .send()
            .await
            .map_err(|e| {
                error!(url = %url, error = %e, "Token request failed");
                TokenExchangeFailure::Network(e.to_string())
            })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            error!(
                url = %url,
                status = status.as_u16(),
                content_type = %content_type,
                body = %body_snippet(&body),
                "Token endpoint returned an error"
            );
            return Err(TokenExchangeFailure::Status {
                status: status.as_u16(),
            });
        }
        if body.is_empty() {
            error!(
                url = %url,
                status = status.as_u16(),
                content_type = %content_type,
                "Token endpoint returned an empty body"
            );
            return Err(TokenExchangeFailure::EmptyBody);
        }

        let raw: RawTokenResponse = serde_json::from_str(&body).map_err(|_| {
            error!(
                url = %url,
                status = status.as_u16(),
                content_type = %content_type,
                body = %body_snippet(&body),
                "Token response parse failed"
            );
            TokenExchangeFailure::Parse
        })?;

        let access_token = raw
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(TokenExchangeFailure::NoAccessToken)?;

        Ok(GrantedToken {
            access_token,
            expires_in: expires_in_or(raw.expires_in.as_ref(), default_expires_in),
            refresh_token: raw.refresh_token.filter(|t| !t.is_empty()),
        })
    }

    /// POST `{identity}/connect/revocation`. Returns the status on failure.
    pub async fn revoke(&self, form: &[(&str, &str)]) -> Result<(), TokenExchangeFailure> {
        let url = format!("{}{REVOCATION_ENDPOINT}", self.identity_base);
        let response = self
            .http
            .post(&url)
            .form(form)
            .send()
            .await
            .map_err(|e| TokenExchangeFailure::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        error!(
            url = %url,
            status = status.as_u16(),
            body = %body_snippet(&body),
            "Token revocation failed"
        );
        Err(TokenExchangeFailure::Status {
            status: status.as_u16(),
        })
    }
}
