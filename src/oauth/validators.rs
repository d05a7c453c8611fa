//! Request validation for the authorization server

use serde_json::Value;
use url::Url;

use super::pkce::METHOD_S256;
use super::types::{AuthorizationRequest, OAuthClient, OAuthError, TokenRequest};

/// Validate an authorize request against its (possibly auto-registered) client
pub fn validate_authorization_request(
    params: &AuthorizationRequest,
    client: Option<&OAuthClient>,
) -> Result<(), OAuthError> {
    let Some(client) = client else {
        return Err(OAuthError::invalid_client("Client not found"));
    };
    if !client.allows_redirect(&params.redirect_uri) {
        return Err(OAuthError::invalid_request("Invalid redirect_uri"));
    }
    if params.response_type != "code" {
        return Err(OAuthError::bare("unsupported_response_type"));
    }
    if params.code_challenge.is_empty() || params.code_challenge_method != METHOD_S256 {
        return Err(OAuthError::invalid_request("PKCE required"));
    }
    Ok(())
}

/// Validate the shape of a token request
pub fn validate_token_request(params: &TokenRequest) -> Result<(), OAuthError> {
    if params.grant_type != "authorization_code" {
        return Err(OAuthError::bare("unsupported_grant_type"));
    }
    let missing = |v: &Option<String>| v.as_deref().is_none_or(str::is_empty);
    if missing(&params.code) || missing(&params.code_verifier) {
        return Err(OAuthError::invalid_request("Missing code or code_verifier"));
    }
    Ok(())
}

/// Whether `uri` parses as an absolute URL
pub fn is_valid_redirect_uri(uri: &str) -> bool {
    !uri.is_empty() && Url::parse(uri).is_ok()
}

/// Validate `redirect_uris` from a registration request
pub fn validate_client_registration(redirect_uris: Option<&Value>) -> Result<Vec<String>, String> {
    let Some(Value::Array(items)) = redirect_uris else {
        return Err("redirect_uris is required and must be an array".to_string());
    };
    if items.is_empty() {
        return Err("redirect_uris must contain at least one URI".to_string());
    }
    items
        .iter()
        .map(|item| match item {
            Value::String(uri) if is_valid_redirect_uri(uri) => Ok(uri.clone()),
            Value::String(uri) => Err(format!("Invalid redirect_uri: {uri}")),
            _ => Err("All redirect_uris must be strings".to_string()),
        })
        .collect()
}
