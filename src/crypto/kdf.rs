//! Key Derivation Functions
//!
//! Provides PBKDF2-HMAC-SHA256 for deriving the frame key from the shared secret

use super::CipherKind;
use ring::pbkdf2;
use std::num::NonZeroU32;

/// Fixed salt shared by every deployment
pub const KDF_SALT: &[u8] = b"salt";

/// PBKDF2 iteration count
pub const KDF_ITERATIONS: u32 = 10_000;

/// Derive the frame key for `kind` from `secret`
///
/// The output length matches the cipher key size. The `none` cipher derives
/// nothing and returns an empty key.
pub fn derive_key(secret: &str, kind: CipherKind) -> Vec<u8> {
    if kind.is_none() {
        return Vec::new();
    }

    let mut key = vec![0u8; kind.key_len()];
    pbkdf2_sha256(secret.as_bytes(), KDF_SALT, KDF_ITERATIONS, &mut key);
    key
}

fn pbkdf2_sha256(secret: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
    let iterations = NonZeroU32::new(iterations).unwrap_or(NonZeroU32::MIN);
    pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA256, iterations, salt, secret, out);
}
