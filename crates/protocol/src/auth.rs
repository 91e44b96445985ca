//! HMAC-SHA256 over canonical envelope bytes.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::kdf::AuthKey;

type HmacSha256 = Hmac<Sha256>;

/// Length of an envelope MAC in bytes.
pub const MAC_LENGTH: usize = 32;

fn keyed(key: &AuthKey) -> HmacSha256 {
    let Ok(mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        unreachable!("HMAC-SHA256 accepts any key length");
    };
    mac
}

/// Computes the MAC of `data`.
pub fn compute_mac(key: &AuthKey, data: &[u8]) -> [u8; MAC_LENGTH] {
    let mut mac = keyed(key);
    mac.update(data);

    let mut out = [0u8; MAC_LENGTH];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Checks `expected` against the MAC of `data` in constant time.
///
/// A candidate of the wrong length never verifies.
pub fn verify_mac(key: &AuthKey, data: &[u8], expected: &[u8]) -> bool {
    let mut mac = keyed(key);
    mac.update(data);
    mac.verify_slice(expected).is_ok()
}
