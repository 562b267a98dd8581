//! AEAD frame encryption/decryption
//!
//! Every tunnel message is `ciphertext ‖ tag` under the process-wide key and
//! the session nonce. The nonce is 16 bytes, so the GCM counter block is
//! derived through GHASH rather than the 96-bit fast path.

use super::{derive_key, CipherKind, CryptoError, SessionNonce};
use crate::protocol::{decode_destination, encode_destination, NONCE_LEN, TAG_LEN};
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::{Aes128, Aes192, Aes256};
use aes_gcm::{AesGcm, Nonce};
use std::fmt;

type Aes128Gcm16 = AesGcm<Aes128, U16>;
type Aes192Gcm16 = AesGcm<Aes192, U16>;
type Aes256Gcm16 = AesGcm<Aes256, U16>;

enum Sealer {
    Aes128(Aes128Gcm16),
    Aes192(Aes192Gcm16),
    Aes256(Aes256Gcm16),
    Plain,
}

/// Frame codec shared read-only by every session of a process
///
/// Built once from the configured secret and cipher; holds the derived key.
pub struct FrameCodec {
    kind: CipherKind,
    sealer: Sealer,
}

impl FrameCodec {
    /// Derive the key from `secret` and build the cipher for `kind`
    pub fn new(secret: &str, kind: CipherKind) -> Result<Self, CryptoError> {
        let key = derive_key(secret, kind);
        Self::from_key(&key, kind)
    }

    /// Build a codec from an already derived key
    pub fn from_key(key: &[u8], kind: CipherKind) -> Result<Self, CryptoError> {
        let sealer = match kind {
            CipherKind::Aes128Gcm => Sealer::Aes128(
                Aes128Gcm16::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?,
            ),
            CipherKind::Aes192Gcm => Sealer::Aes192(
                Aes192Gcm16::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?,
            ),
            CipherKind::Aes256Gcm => Sealer::Aes256(
                Aes256Gcm16::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?,
            ),
            CipherKind::None => Sealer::Plain,
        };

        Ok(Self { kind, sealer })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Bytes added to every payload by [`encrypt`](Self::encrypt)
    pub fn overhead(&self) -> usize {
        if self.kind.is_none() {
            0
        } else {
            TAG_LEN
        }
    }

    /// Encrypt a payload, returning `ciphertext ‖ tag`
    pub fn encrypt(&self, nonce: &SessionNonce, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Nonce::<U16>::from_slice(nonce.as_bytes());
        let sealed = match &self.sealer {
            Sealer::Aes128(cipher) => cipher.encrypt(nonce, plaintext),
            Sealer::Aes192(cipher) => cipher.encrypt(nonce, plaintext),
            Sealer::Aes256(cipher) => cipher.encrypt(nonce, plaintext),
            Sealer::Plain => return Ok(plaintext.to_vec()),
        };
        sealed.map_err(|_| CryptoError::Encryption)
    }

    /// Verify and decrypt `ciphertext ‖ tag`
    ///
    /// Any mismatch (tampering, wrong key, wrong nonce, truncation) is
    /// reported as [`CryptoError::AuthenticationFailed`].
    pub fn decrypt(&self, nonce: &SessionNonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if !self.kind.is_none() && ciphertext.len() < TAG_LEN {
            return Err(CryptoError::FrameTooShort(ciphertext.len()));
        }

        let nonce = Nonce::<U16>::from_slice(nonce.as_bytes());
        let opened = match &self.sealer {
            Sealer::Aes128(cipher) => cipher.decrypt(nonce, ciphertext),
            Sealer::Aes192(cipher) => cipher.decrypt(nonce, ciphertext),
            Sealer::Aes256(cipher) => cipher.decrypt(nonce, ciphertext),
            Sealer::Plain => return Ok(ciphertext.to_vec()),
        };
        opened.map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// Build the first tunnel message: `AEAD(host ‖ port) ‖ nonce`
    pub fn seal_handshake(
        &self,
        nonce: &SessionNonce,
        host: &str,
        port: u16,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut frame = self.encrypt(nonce, &encode_destination(host, port))?;
        frame.extend_from_slice(nonce.as_bytes());
        Ok(frame)
    }

    /// Open the first tunnel message, recovering the session nonce and destination
    pub fn open_handshake(&self, frame: &[u8]) -> Result<(SessionNonce, String, u16), CryptoError> {
        if frame.len() < NONCE_LEN {
            return Err(CryptoError::FrameTooShort(frame.len()));
        }

        let (sealed, nonce) = frame.split_at(frame.len() - NONCE_LEN);
        let nonce = SessionNonce::from_slice(nonce).ok_or(CryptoError::FrameTooShort(frame.len()))?;
        let plaintext = self.decrypt(&nonce, sealed)?;
        let (host, port) =
            decode_destination(&plaintext).ok_or(CryptoError::MalformedDestination)?;

        Ok((nonce, host, port))
    }
}

impl fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec").field("kind", &self.kind).finish_non_exhaustive()
    }
}
