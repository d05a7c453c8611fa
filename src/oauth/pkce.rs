//! PKCE and random token helpers

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// The only challenge method accepted by the authorization server
pub const METHOD_S256: &str = "S256";

/// Random URL-safe string built from `N` random bytes
fn random_token<const N: usize>() -> String {
    let bytes: [u8; N] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a random state parameter
pub fn generate_state() -> String {
    random_token::<16>()
}

/// Generate an opaque authorization code or refresh token
pub fn generate_opaque_token() -> String {
    random_token::<32>()
}

/// Generate a `(verifier, challenge)` pair
pub fn generate_pkce() -> (String, String) {
    let verifier = random_token::<32>();
    let challenge = challenge_s256(&verifier);
    (verifier, challenge)
}

/// `base64url(SHA-256(verifier))` without padding
pub fn challenge_s256(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Check a verifier against a stored S256 challenge in constant time
pub fn verify_s256(verifier: &str, challenge: &str) -> bool {
    let computed = challenge_s256(verifier);
    computed.as_bytes().ct_eq(challenge.as_bytes()).into()
}
