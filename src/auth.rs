//! Internal service-to-service tokens.
//!
//! A token is `<timestamp_ms>.<hex hmac-sha256(timestamp_ms)>`, keyed by a
//! secret shared between the sandbox runtime and the control plane. Tokens are
//! sent as `Authorization: Bearer <token>`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Mint a token for the current time.
pub fn generate_internal_token(secret: &str) -> String {
    generate_internal_token_at(secret, now_ms())
}

/// Mint a token for an explicit timestamp (milliseconds since the epoch).
pub fn generate_internal_token_at(secret: &str, timestamp_ms: u64) -> String {
    let timestamp = timestamp_ms.to_string();
    let mut mac = keyed_mac(secret);
    mac.update(timestamp.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    format!("{timestamp}.{signature}")
}

/// Verify an `Authorization` header value.
///
/// Only the signature is checked; see [`verify_internal_token_with_max_age`]
/// for freshness. Malformed headers fail closed.
pub fn verify_internal_token(authorization: &str, secret: &str) -> bool {
    signed_timestamp(authorization, secret).is_some()
}

/// Like [`verify_internal_token`], but also rejects tokens whose timestamp is
/// more than `max_age` away from now in either direction.
pub fn verify_internal_token_with_max_age(
    authorization: &str,
    secret: &str,
    max_age: Duration,
) -> bool {
    match signed_timestamp(authorization, secret) {
        Some(timestamp_ms) => {
            let skew = now_ms().abs_diff(timestamp_ms);
            u128::from(skew) <= max_age.as_millis()
        }
        None => false,
    }
}

/// Returns the token timestamp when the header carries a valid signature.
fn signed_timestamp(authorization: &str, secret: &str) -> Option<u64> {
    let token = authorization.strip_prefix("Bearer ")?;
    let (timestamp, signature) = token.split_once('.')?;
    if timestamp.is_empty() || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let signature = hex::decode(signature).ok()?;

    let mut mac = keyed_mac(secret);
    mac.update(timestamp.as_bytes());
    mac.verify_slice(&signature).ok()?;

    timestamp.parse().ok()
}

fn keyed_mac(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
