//! Package access tokens
//!
//! Tokens are 32 random bytes, URL-safe base64 without padding. Only the
//! SHA-256 hex digest of a token is persisted.

use rand::Rng;
use subtle::ConstantTimeEq;

use super::sha256_hex;
use crate::domain::AccessToken;

const TOKEN_BYTES: usize = 32;

/// Generate a fresh token and its storage hash.
pub fn generate_access_token() -> (AccessToken, String) {
    let mut rng = rand::thread_rng();
    let random_bytes: [u8; TOKEN_BYTES] = rng.gen();
    let token = base64::Engine::encode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        random_bytes,
    );
    let hash = hash_token(&token);
    (AccessToken(token), hash)
}

/// Hash a presented token for lookup
pub fn hash_token(token: &str) -> String {
    sha256_hex(token.as_bytes())
}

/// Compare two hex digests in constant time.
///
/// Length differences return early; digests are fixed-length.
pub fn digests_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Random opaque reference (used for per-package subject pseudonyms)
pub fn random_ref(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: [u8; 12] = rng.gen();
    format!(
        "{prefix}_{}",
        base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            random_bytes
        )
    )
}
