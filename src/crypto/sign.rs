//! HMAC-SHA256 signatures over the exact bytes of a payload.
//!
//! There is exactly one canonical form: the raw bytes as they were received. The payload is
//! never re-serialized before it is verified, so two encodings of the same update can never
//! both carry a valid signature.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length
    HmacSha256::new_from_slice(secret).unwrap_or_else(|_| unreachable!())
}

/// Signs `raw` with `secret` and returns the lowercase hex encoded tag.
pub fn sign(raw: &[u8], secret: &[u8]) -> String {
    let mut mac = mac(secret);
    mac.update(raw);
    hex::encode(mac.finalize().into_bytes())
}

/// Checks that `signature_hex` is the HMAC-SHA256 tag of `raw` under `secret`.
///
/// The comparison runs in constant time. Malformed hex and tags of the wrong length are
/// reported as `false`.
pub fn verify(raw: &[u8], signature_hex: &str, secret: &[u8]) -> bool {
    let signature = match hex::decode(signature_hex.trim()) {
        Ok(signature) => signature,
        Err(_) => return false,
    };
    let mut mac = mac(secret);
    mac.update(raw);
    mac.verify_slice(&signature).is_ok()
}
