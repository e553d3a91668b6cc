//! HMAC credentials for the proxy handshake.
//!
//! A token binds an endpoint id to an expiry time and is signed with a shared
//! secret. Format (hex-encoded): `[8-byte expiry][32-byte HMAC-SHA256]`.

use ring::hmac;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const TOKEN_BYTES: usize = 8 + 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token is not hex")]
    Encoding,
    #[error("invalid token length: expected {TOKEN_BYTES}, got {0}")]
    Length(usize),
    #[error("token expired")]
    Expired,
    #[error("invalid token signature")]
    Signature,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn signed_data(expiry: u64, subject: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + subject.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(subject.as_bytes());
    data
}

/// Create a token for `subject` valid for `ttl_secs`.
pub fn create_token(secret: &[u8], subject: &str, ttl_secs: u64) -> String {
    create_token_until(secret, subject, unix_now().saturating_add(ttl_secs))
}

/// Create a token for `subject` expiring at the given unix time.
pub fn create_token_until(secret: &[u8], subject: &str, expiry: u64) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &signed_data(expiry, subject));

    let mut token = Vec::with_capacity(TOKEN_BYTES);
    token.extend_from_slice(&expiry.to_be_bytes());
    token.extend_from_slice(tag.as_ref());
    hex::encode(token)
}

/// Verify a token: signature over `subject` and expiry.
pub fn verify_token(secret: &[u8], subject: &str, token: &str) -> Result<(), TokenError> {
    let raw = hex::decode(token).map_err(|_| TokenError::Encoding)?;
    if raw.len() != TOKEN_BYTES {
        return Err(TokenError::Length(raw.len()));
    }

    let mut expiry_bytes = [0u8; 8];
    expiry_bytes.copy_from_slice(&raw[..8]);
    let expiry = u64::from_be_bytes(expiry_bytes);

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, &signed_data(expiry, subject), &raw[8..])
        .map_err(|_| TokenError::Signature)?;

    if unix_now() > expiry {
        return Err(TokenError::Expired);
    }
    Ok(())
}

/// Generate a random 32-byte secret.
pub fn generate_secret() -> Vec<u8> {
    use rand::RngCore;
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}
