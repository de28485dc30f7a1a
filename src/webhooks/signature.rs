use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

/// Header carrying the hex HMAC-SHA512 of the raw request body.
pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

/// Hex-encoded HMAC-SHA512 of `payload` under `secret`.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha512::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Checks the signature header against the exact bytes received.
pub fn verify_signature(headers: &HeaderMap, payload: &[u8], secret: &str) -> bool {
    let Some(provided) = headers.get(SIGNATURE_HEADER).and_then(|h| h.to_str().ok()) else {
        return false;
    };
    let expected = sign(secret, payload);
    !expected.is_empty() && constant_time_eq(&expected, &provided.trim().to_ascii_lowercase())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}
