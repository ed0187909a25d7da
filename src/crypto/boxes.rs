//! Authenticated encryption boxes.
//!
//! - [`SecretBox`]: XChaCha20-Poly1305 keyed with a 32 byte secret
//! - [`SharedBoxFactory`]: an X25519 key pair that opens a [`SharedBox`] towards any peer
//!   public key; the Diffie-Hellman output is run through a BLAKE3 KDF before use
//!
//! Randomly chosen nonces are always passed as a [`NonceGuard`] and committed once the
//! ciphertext exists. Counter based nonces (the CSP transport) are built from a cookie
//! and a sequence number and never repeat by construction.

use crate::crypto::nonce::{Nonce, NonceGuard, NONCE_LENGTH};
use crate::crypto::random_bytes;
use crate::error::CryptoError;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

/// Length of symmetric keys and X25519 keys
pub const KEY_LENGTH: usize = 32;

/// Poly1305 tag length
pub const TAG_LENGTH: usize = 16;

/// Length of a CSP cookie
pub const COOKIE_LENGTH: usize = 16;

const SHARED_BOX_CONTEXT: &str = "mdev-protocol 2024-06 shared box";

/// Build the nonce `cookie || sequence number (LE)`
pub fn cookie_nonce(cookie: &[u8; COOKIE_LENGTH], sequence: u64) -> Nonce {
    let mut bytes = [0u8; NONCE_LENGTH];
    bytes[..COOKIE_LENGTH].copy_from_slice(cookie);
    bytes[COOKIE_LENGTH..].copy_from_slice(&sequence.to_le_bytes());
    Nonce::from_bytes(bytes)
}

/// Symmetric box
pub struct SecretBox {
    cipher: XChaCha20Poly1305,
}

impl SecretBox {
    pub fn new(key: &[u8; KEY_LENGTH]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub(crate) fn seal(&self, nonce: &Nonce, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce.as_bytes()), plain)
            .map_err(|_| CryptoError::EncryptionFailure)
    }

    pub(crate) fn open(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_LENGTH {
            return Err(CryptoError::CiphertextTooShort(ciphertext.len()));
        }
        self.cipher
            .decrypt(XNonce::from_slice(nonce.as_bytes()), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailure)
    }

    /// Encrypt and consume the nonce
    pub fn encrypt(&self, nonce: NonceGuard, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.seal(nonce.nonce(), plain) {
            Ok(ciphertext) => {
                nonce.commit();
                Ok(ciphertext)
            }
            Err(e) => {
                nonce.discard();
                Err(e)
            }
        }
    }

    /// Encrypt and prepend the nonce to the ciphertext
    pub fn encrypt_with_nonce_ahead(
        &self,
        nonce: NonceGuard,
        plain: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let prefix = *nonce.nonce().as_bytes();
        let ciphertext = self.encrypt(nonce, plain)?;
        let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&prefix);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.open(nonce, ciphertext)
    }

    /// Split off the leading nonce and decrypt the remainder
    pub fn decrypt_with_nonce_ahead(&self, data: &[u8]) -> Result<(Nonce, Vec<u8>), CryptoError> {
        if data.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(CryptoError::CiphertextTooShort(data.len()));
        }
        let (prefix, ciphertext) = data.split_at(NONCE_LENGTH);
        let nonce = Nonce::from_slice(prefix)?;
        let plain = self.open(&nonce, ciphertext)?;
        Ok((nonce, plain))
    }
}

/// Box between two X25519 key pairs
pub struct SharedBox {
    inner: SecretBox,
}

impl SharedBox {
    pub fn encrypt(&self, nonce: NonceGuard, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner.encrypt(nonce, plain)
    }

    pub fn encrypt_with_nonce_ahead(
        &self,
        nonce: NonceGuard,
        plain: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.inner.encrypt_with_nonce_ahead(nonce, plain)
    }

    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner.decrypt(nonce, ciphertext)
    }

    pub fn decrypt_with_nonce_ahead(&self, data: &[u8]) -> Result<(Nonce, Vec<u8>), CryptoError> {
        self.inner.decrypt_with_nonce_ahead(data)
    }

    /// Encrypt with the counter nonce `cookie || sequence`
    pub fn encrypt_with_cookie(
        &self,
        cookie: &[u8; COOKIE_LENGTH],
        sequence: u64,
        plain: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.inner.seal(&cookie_nonce(cookie, sequence), plain)
    }

    pub fn decrypt_with_cookie(
        &self,
        cookie: &[u8; COOKIE_LENGTH],
        sequence: u64,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.inner.open(&cookie_nonce(cookie, sequence), ciphertext)
    }
}

/// X25519 key pair opening shared boxes
pub struct SharedBoxFactory {
    secret: StaticSecret,
    public: PublicKey,
}

impl SharedBoxFactory {
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self::from_secret_bytes(random_bytes()?))
    }

    pub fn from_secret_bytes(mut bytes: [u8; KEY_LENGTH]) -> Self {
        let secret = StaticSecret::from(bytes);
        bytes.zeroize();
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; KEY_LENGTH] {
        self.public.to_bytes()
    }

    /// Raw X25519 output towards `peer`
    pub(crate) fn diffie_hellman(&self, peer: &[u8; KEY_LENGTH]) -> Zeroizing<[u8; KEY_LENGTH]> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer));
        Zeroizing::new(shared.to_bytes())
    }

    pub fn shared_box(&self, peer: &[u8; KEY_LENGTH]) -> SharedBox {
        let shared = self.diffie_hellman(peer);
        let key = Zeroizing::new(blake3::derive_key(SHARED_BOX_CONTEXT, shared.as_ref()));
        SharedBox {
            inner: SecretBox::new(&key),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::crypto::nonce::{NonceScope, NonceService};

    #[test]
    fn test_shared_box_is_symmetric() {
        let nonces = NonceService::new();
        let alice = SharedBoxFactory::generate().unwrap();
        let bob = SharedBoxFactory::generate().unwrap();

        let sealed = alice
            .shared_box(&bob.public_key())
            .encrypt_with_nonce_ahead(nonces.next(NonceScope::Csp).unwrap(), b"hello")
            .unwrap();
        let (nonce, plain) = bob
            .shared_box(&alice.public_key())
            .decrypt_with_nonce_ahead(&sealed)
            .unwrap();

        assert_eq!(plain, b"hello");
        assert!(nonces.is_used(NonceScope::Csp, &nonce));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let nonces = NonceService::new();
        let key = [3u8; KEY_LENGTH];
        let secret_box = SecretBox::new(&key);
        let mut sealed = secret_box
            .encrypt_with_nonce_ahead(nonces.next(NonceScope::D2d).unwrap(), b"payload")
            .unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(
            secret_box.decrypt_with_nonce_ahead(&sealed).unwrap_err(),
            CryptoError::DecryptionFailure
        );
    }

    #[test]
    fn test_cookie_nonce_layout() {
        let nonce = cookie_nonce(&[0xab; COOKIE_LENGTH], 2);
        assert_eq!(&nonce.as_bytes()[..COOKIE_LENGTH], &[0xab; COOKIE_LENGTH]);
        assert_eq!(&nonce.as_bytes()[COOKIE_LENGTH..], &2u64.to_le_bytes());
    }
}
