//! Challenge/response primitives shared by coordinator and worker.
//!
//! The coordinator issues a random nonce in AUTH_CHALLENGE; the worker
//! answers with `hmac(secret, nonce)` in AUTH_RESPONSE. Both sides use
//! these helpers so the digests line up byte for byte.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Random 32-byte nonce as lowercase hex.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Random bearer token for issued worker credentials.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// HMAC-SHA256 of `nonce` under `secret`, as lowercase hex.
pub fn compute_hmac(secret: &str, nonce: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(nonce.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Equality that does not leak the match position through timing.
/// Comparing digests instead of the raw strings keeps the loop
/// length independent of the secret.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}
