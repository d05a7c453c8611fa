//! Error types for the CRM gateway

use std::io;

use thiserror::Error;

/// Result type alias for the CRM gateway
pub type Result<T> = std::result::Result<T, Error>;

/// CRM gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream login or token exchange failed.
    ///
    /// `code` is a stable machine-readable identifier such as
    /// `oauth2_auth_failed` or `auth_failed:401`.
    #[error("Upstream authentication failed: {code}")]
    UpstreamAuth {
        /// Stable failure code
        code: String,
    },

    /// The authorization-code flow holds no usable token for the current user.
    ///
    /// Recoverable: the user has to visit `consent_url` (when known) to grant
    /// access, after which the same call succeeds.
    #[error("Authorization required{}", consent_hint(.consent_url))]
    NeedsConsent {
        /// Resumable consent URL keyed by the user
        consent_url: Option<String>,
    },

    /// Operation not offered by the configured auth provider
    #[error("Unsupported by {provider} auth provider: {operation}")]
    Unsupported {
        /// Provider kind
        provider: &'static str,
        /// Operation name
        operation: &'static str,
    },

    /// Upstream CRM answered with a non-success status
    #[error("Upstream error {status}: {body}")]
    Upstream {
        /// HTTP status code
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },

    /// Unusable OData `$metadata` or an entity set it does not declare
    #[error("OData metadata error: {0}")]
    Metadata(String),

    /// JSON-RPC error
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn consent_hint(url: &Option<String>) -> String {
    url.as_ref()
        .map_or_else(String::new, |u| format!(": open {u} to grant access"))
}

impl Error {
    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
        }
    }

    /// Create an upstream authentication error with a stable code
    pub fn upstream_auth(code: impl Into<String>) -> Self {
        Self::UpstreamAuth { code: code.into() }
    }

    /// Whether the caller can recover by sending the user through consent
    #[must_use]
    pub fn is_needs_consent(&self) -> bool {
        matches!(self, Self::NeedsConsent { .. })
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::NeedsConsent { .. } => rpc_codes::NEEDS_CONSENT,
            Self::UpstreamAuth { .. } => rpc_codes::UPSTREAM_AUTH_FAILED,
            Self::Upstream { .. } | Self::Http(_) => rpc_codes::SERVER_ERROR_START,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
    /// Upstream CRM refused our credentials
    pub const UPSTREAM_AUTH_FAILED: i32 = -32001;
    /// User must complete the consent flow
    pub const NEEDS_CONSENT: i32 = -32002;
}
