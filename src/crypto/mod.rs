//! Cryptographic primitives for the tunnel
//!
//! This module provides:
//! - AES-GCM (128/192/256) frame encryption with a 16-byte session nonce
//! - PBKDF2-HMAC-SHA256 key derivation from the shared secret
//! - Secure random nonce generation
//!
//! A `none` cipher disables encryption entirely; it exists for debugging and
//! for transports that are already trusted.

mod aead;
mod kdf;

pub use aead::FrameCodec;
pub use kdf::{derive_key, KDF_ITERATIONS, KDF_SALT};

use crate::protocol::NONCE_LEN;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unknown cipher: {0}")]
    UnknownCipher(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Encryption failed")]
    Encryption,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Malformed destination")]
    MalformedDestination,

    #[error("Random source failure")]
    Random,
}

/// Cipher selected by configuration, shared by every session of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherKind {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    /// Pass-through, no derivation and no encryption
    None,
}

impl CipherKind {
    /// Derived key length in bytes (0 for `none`)
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes192Gcm => 24,
            CipherKind::Aes256Gcm => 32,
            CipherKind::None => 0,
        }
    }

    /// Configuration name of the cipher
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes192Gcm => "aes-192-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::None => "none",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, CipherKind::None)
    }
}

impl FromStr for CipherKind {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-192-gcm" => Ok(CipherKind::Aes192Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "none" => Ok(CipherKind::None),
            other => Err(CryptoError::UnknownCipher(other.to_string())),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The 16-byte nonce fixed for the lifetime of one session
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionNonce([u8; NONCE_LEN]);

impl SessionNonce {
    /// Draw a fresh nonce from the system random source
    pub fn generate() -> Result<Self, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        random_bytes(&mut nonce)?;
        Ok(Self(nonce))
    }

    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    /// Read a nonce from a slice of exactly [`NONCE_LEN`] bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; NONCE_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionNonce(")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1).unwrap();
        random_bytes(&mut buf2).unwrap();
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_nonce_generation() {
        let a = SessionNonce::generate().unwrap();
        let b = SessionNonce::generate().unwrap();
        assert_eq!(a.as_bytes().len(), NONCE_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_nonce_from_slice() {
        assert!(SessionNonce::from_slice(&[0u8; 15]).is_none());
        assert!(SessionNonce::from_slice(&[0u8; 17]).is_none());
        let nonce = SessionNonce::from_slice(&[7u8; 16]).unwrap();
        assert_eq!(nonce.as_bytes(), &[7u8; 16]);
    }

    #[test]
    fn test_cipher_names() {
        for kind in [
            CipherKind::Aes128Gcm,
            CipherKind::Aes192Gcm,
            CipherKind::Aes256Gcm,
            CipherKind::None,
        ] {
            assert_eq!(kind.as_str().parse::<CipherKind>().unwrap(), kind);
        }
        assert_eq!("AES-256-GCM".parse::<CipherKind>().unwrap(), CipherKind::Aes256Gcm);
        assert!(matches!(
            "chacha20".parse::<CipherKind>(),
            Err(CryptoError::UnknownCipher(_))
        ));
    }

    #[test]
    fn test_key_lengths() {
        assert_eq!(CipherKind::Aes128Gcm.key_len(), 16);
        assert_eq!(CipherKind::Aes192Gcm.key_len(), 24);
        assert_eq!(CipherKind::Aes256Gcm.key_len(), 32);
        assert_eq!(CipherKind::None.key_len(), 0);
    }
}
