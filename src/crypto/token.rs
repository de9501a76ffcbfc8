//! Authentication tokens for the cover dialog's AUTH exchange.
//!
//! A token binds a principal name to a wall-clock timestamp with an
//! HMAC-SHA256 tag, then wraps the whole tuple in base64 so it can ride
//! inside an `AUTH PLAIN` line. Verification recomputes the wire form
//! with the stored secret and compares in constant time; any failure is
//! an opaque `None`.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew between token issuance and verification.
pub const MAX_TOKEN_AGE_SECS: i64 = 300;

const MAC_CONTEXT: &str = "smtp-tunnel-auth";

/// Generate an authentication token for `username` at `timestamp`
/// (unix seconds).
///
/// Wire form: `b64( name ":" ts ":" b64(HMAC(secret, context:name:ts)) )`.
pub fn generate_token(secret: &str, username: &str, timestamp: i64) -> String {
    let msg = format!("{MAC_CONTEXT}:{username}:{timestamp}");
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(msg.as_bytes());
    let tag = mac.finalize().into_bytes();

    let inner = format!("{username}:{timestamp}:{}", STANDARD.encode(tag));
    STANDARD.encode(inner)
}

/// Verify a token against the known principals (name → secret).
///
/// Returns the authenticated principal name, or `None` on any failure:
/// malformed token, timestamp outside `max_age`, unknown principal, or
/// MAC mismatch. No distinction between the failure modes leaks out.
pub fn verify_token(
    token: &str,
    principals: &HashMap<String, String>,
    max_age: i64,
) -> Option<String> {
    let decoded = STANDARD.decode(token).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;

    let mut parts = decoded.splitn(3, ':');
    let username = parts.next()?;
    let timestamp: i64 = parts.next()?.parse().ok()?;
    parts.next()?;

    let now = unix_now();
    if (now - timestamp).abs() > max_age {
        return None;
    }

    let secret = principals.get(username)?;
    let expected = generate_token(secret, username, timestamp);
    if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        Some(username.to_string())
    } else {
        None
    }
}

/// Generate a fresh shared secret: 32 random bytes, base64url.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
