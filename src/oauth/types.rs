//! Wire types of the embedded authorization server

use std::fmt;

use serde::{Deserialize, Serialize};

/// Grant types advertised for registered clients
pub const CLIENT_GRANT_TYPES: [&str; 2] = ["authorization_code", "refresh_token"];

/// A registered (or auto-registered) OAuth client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthClient {
    /// Client identifier
    pub client_id: String,
    /// Exact redirect URIs this client may use
    pub redirect_uris: Vec<String>,
    /// Allowed grant types
    pub grant_types: Vec<String>,
    /// Allowed response types
    pub response_types: Vec<String>,
    /// Token endpoint authentication method
    pub token_endpoint_auth_method: String,
    /// Registration time (Unix ms)
    pub created_at: i64,
}

impl OAuthClient {
    /// Whether `redirect_uri` exactly matches a registered URI
    pub fn allows_redirect(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|u| u == redirect_uri)
    }
}

/// Authorization server metadata (RFC 8414)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorizationServerMetadata {
    /// Issuer URL
    pub issuer: String,
    /// Authorization endpoint URL
    pub authorization_endpoint: String,
    /// Token endpoint URL
    pub token_endpoint: String,
    /// Dynamic client registration endpoint URL
    pub registration_endpoint: String,
    /// Supported response types
    pub response_types_supported: Vec<String>,
    /// Supported grant types
    pub grant_types_supported: Vec<String>,
    /// Supported token endpoint auth methods
    pub token_endpoint_auth_methods_supported: Vec<String>,
    /// Supported PKCE methods
    pub code_challenge_methods_supported: Vec<String>,
    /// Supported scopes
    pub scopes_supported: Vec<String>,
}

/// `GET /authorize` query
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthorizationRequest {
    /// Client identifier
    pub client_id: String,
    /// Redirect URI
    pub redirect_uri: String,
    /// Must be `code`
    pub response_type: String,
    /// Opaque client state
    pub state: Option<String>,
    /// PKCE challenge
    pub code_challenge: String,
    /// Must be `S256`
    pub code_challenge_method: String,
    /// Requested scope (ignored)
    pub scope: Option<String>,
}

/// `POST /token` body (form or JSON)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenRequest {
    /// Grant type
    pub grant_type: String,
    /// Client identifier
    pub client_id: String,
    /// Authorization code
    pub code: Option<String>,
    /// Redirect URI used at authorize time
    pub redirect_uri: Option<String>,
    /// PKCE verifier
    pub code_verifier: Option<String>,
}

/// Issued gateway access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenResponse {
    /// Signed JWT
    pub access_token: String,
    /// Always `Bearer`
    pub token_type: String,
    /// Lifetime in seconds
    pub expires_in: u64,
    /// Opaque refresh token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// User the token acts for
    #[serde(rename = "userKey")]
    pub user_key: String,
}

/// OAuth protocol error (`{error, error_description?}`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthError {
    /// Error code
    pub error: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl OAuthError {
    /// Error with a description
    pub fn new(error: &str, description: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            error_description: Some(description.into()),
        }
    }

    /// Error without a description
    pub fn bare(error: &str) -> Self {
        Self {
            error: error.to_string(),
            error_description: None,
        }
    }

    /// `invalid_request`
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new("invalid_request", description)
    }

    /// `invalid_grant`
    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::new("invalid_grant", description)
    }

    /// `invalid_client`
    pub fn invalid_client(description: impl Into<String>) -> Self {
        Self::new("invalid_client", description)
    }

    /// `server_error`
    pub fn server_error(description: impl Into<String>) -> Self {
        Self::new("server_error", description)
    }
}

impl fmt::Display for OAuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_description {
            Some(d) => write!(f, "{}: {d}", self.error),
            None => f.write_str(&self.error),
        }
    }
}

impl std::error::Error for OAuthError {}
