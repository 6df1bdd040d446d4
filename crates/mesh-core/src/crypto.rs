//! The injected security boundary.
//!
//! The actual encrypt/decrypt mechanism is out of scope for this layer
//! (SPEC_FULL §1) — callers may supply any [`SecurityProvider`]. This
//! module defines the trait and ships one concrete AES-256-CFB
//! implementation so the crate is runnable standalone without pulling in
//! a full mutual-auth handshake of its own.

use aes::Aes256;
use cfb_mode::{Decryptor, Encryptor};
use cipher::{AsyncStreamCipher, KeyIvInit};
use rand::RngCore;
use zeroize::Zeroize;

const IV_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Encrypts a plaintext byte slice to a ciphertext string, and back.
/// Implementations own their own key material; this trait only fixes
/// the shape both `mesh-runtime::frame` and the handshake code call
/// through.
pub trait SecurityProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError>;
    fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, CryptoError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("ciphertext is not valid hex")]
    InvalidEncoding,
    #[error("ciphertext is shorter than the {0}-byte IV prefix")]
    Truncated(usize),
}

/// AES-256 in CFB mode, with a random 16-byte IV prepended to each
/// ciphertext and the whole thing hex-encoded. One call to `encrypt`
/// produces one IV; `decrypt` reads it back off the front.
pub struct Aes256CfbProvider {
    key: [u8; KEY_LEN],
}

impl Aes256CfbProvider {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Aes256CfbProvider { key }
    }

    /// Generate a fresh random key. Useful for tests and standalone runs;
    /// real deployments negotiate or provision a key out of band.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Aes256CfbProvider { key }
    }
}

impl Drop for Aes256CfbProvider {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl SecurityProvider for Aes256CfbProvider {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let mut buf = plaintext.to_vec();
        Encryptor::<Aes256>::new(&self.key.into(), &iv.into()).encrypt(&mut buf);

        let mut out = Vec::with_capacity(IV_LEN + buf.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&buf);
        Ok(hex::encode(out))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = hex::decode(ciphertext).map_err(|_| CryptoError::InvalidEncoding)?;
        if raw.len() < IV_LEN {
            return Err(CryptoError::Truncated(IV_LEN));
        }
        let (iv, body) = raw.split_at(IV_LEN);
        let mut buf = body.to_vec();
        Decryptor::<Aes256>::new(&self.key.into(), iv.into()).decrypt(&mut buf);
        Ok(buf)
    }
}

/// A no-op provider for tests that only care about framing, not secrecy.
/// Still exercises the `String` wire representation so frame/handshake
/// tests don't need to special-case "no encryption".
pub struct NullSecurityProvider;

impl SecurityProvider for NullSecurityProvider {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        Ok(hex::encode(plaintext))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, CryptoError> {
        hex::decode(ciphertext).map_err(|_| CryptoError::InvalidEncoding)
    }
}
