//! Gateway-local access tokens (HS256 JWT)

use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::pkce;
use super::types::{AccessTokenResponse, OAuthError};
use crate::session::now_ms;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(rename = "userKey")]
    user_key: String,
    client_id: String,
    iat: u64,
    exp: u64,
}

/// Signs and verifies gateway access tokens with a process-lifetime secret
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    /// Issuer with a fresh random secret
    pub fn new(ttl: Duration) -> Self {
        let secret: [u8; 32] = rand::random();
        Self::with_secret(&secret, ttl)
    }

    /// Issuer with a known secret
    pub fn with_secret(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Sign an access token for `user_key`
    pub fn generate_access_token(
        &self,
        user_key: &str,
        client_id: &str,
    ) -> Result<String, OAuthError> {
        let iat = u64::try_from(now_ms() / 1000).unwrap_or_default();
        let claims = Claims {
            user_key: user_key.to_string(),
            client_id: client_id.to_string(),
            iat,
            exp: iat + self.ttl.as_secs(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| OAuthError::server_error(format!("Failed to sign access token: {e}")))
    }

    /// Access token plus opaque refresh token
    pub fn create_token_response(
        &self,
        user_key: &str,
        client_id: &str,
    ) -> Result<AccessTokenResponse, OAuthError> {
        Ok(AccessTokenResponse {
            access_token: self.generate_access_token(user_key, client_id)?,
            token_type: "Bearer".to_string(),
            expires_in: self.ttl.as_secs(),
            refresh_token: Some(pkce::generate_opaque_token()),
            user_key: user_key.to_string(),
        })
    }

    /// Verify signature and expiry; returns the token's user
    pub fn validate_access_token(&self, token: &str) -> Option<String> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        match decode::<Claims>(token, &self.decoding, &validation) {
            Ok(data) if !data.claims.user_key.is_empty() => Some(data.claims.user_key),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Invalid gateway access token");
                None
            }
        }
    }
}
