//! Device group key schedule.
//!
//! All devices linked to one identity share the device group key (dgk). Five keys
//! are derived from it with a keyed BLAKE3 hash over the personalization
//! `3ma-mdev` and a per-key salt:
//!
//! | Key      | Salt  | Use                                         |
//! |----------|-------|---------------------------------------------|
//! | `dgpk`   | `p`   | Path key, answers the mediator challenge    |
//! | `dgrk`   | `r`   | Reflect key, encrypts envelopes             |
//! | `dgdik`  | `di`  | Device info key                             |
//! | `dgsddk` | `sdd` | Shared device data key                      |
//! | `dgtsk`  | `ts`  | Transaction scope key                       |
//!
//! The dgk is consumed by [`derive_device_group_keys`] and zeroized when the call
//! returns. Each secret-key output is wrapped in a [`PurposeBox`] tagged with its
//! purpose, so passing the reflect key where the device info key is expected does
//! not compile.

use crate::crypto::boxes::{SecretBox, SharedBoxFactory, KEY_LENGTH};
use crate::crypto::nonce::{Nonce, NonceGuard};
use crate::crypto::random_bytes;
use crate::error::CryptoError;
use std::fmt;
use std::marker::PhantomData;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const PERSONAL: &[u8; 8] = b"3ma-mdev";

/// The device group key, consumed by derivation
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DeviceGroupKey([u8; KEY_LENGTH]);

impl DeviceGroupKey {
    pub fn new(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_LENGTH,
                    actual: bytes.len(),
                })?;
        Ok(Self(bytes))
    }

    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self(random_bytes()?))
    }
}

impl fmt::Debug for DeviceGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceGroupKey(..)")
    }
}

fn derive_key(dgk: &DeviceGroupKey, salt: &[u8]) -> Zeroizing<[u8; KEY_LENGTH]> {
    let mut hasher = blake3::Hasher::new_keyed(&dgk.0);
    hasher.update(PERSONAL);
    hasher.update(&[salt.len() as u8]);
    hasher.update(salt);
    Zeroizing::new(*hasher.finalize().as_bytes())
}

/// Purpose marker of a derived secret key
pub trait KeyPurpose {
    const SALT: &'static [u8];
    const NAME: &'static str;
}

macro_rules! key_purpose {
    ($(#[$doc:meta])* $marker:ident, $salt:literal, $name:literal) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub enum $marker {}

        impl KeyPurpose for $marker {
            const SALT: &'static [u8] = $salt;
            const NAME: &'static str = $name;
        }
    };
}

key_purpose!(
    /// Encrypts reflected envelopes
    Reflect,
    b"r",
    "dgrk"
);
key_purpose!(
    /// Encrypts the device info announced to the mediator
    DeviceInfo,
    b"di",
    "dgdik"
);
key_purpose!(
    /// Encrypts data shared among all devices of the group
    SharedDeviceData,
    b"sdd",
    "dgsddk"
);
key_purpose!(
    /// Encrypts transaction scopes
    Transaction,
    b"ts",
    "dgtsk"
);

/// A secret box bound to one purpose
pub struct PurposeBox<P: KeyPurpose> {
    inner: SecretBox,
    _purpose: PhantomData<P>,
}

impl<P: KeyPurpose> PurposeBox<P> {
    fn derive(dgk: &DeviceGroupKey) -> Self {
        let key = derive_key(dgk, P::SALT);
        Self {
            inner: SecretBox::new(&key),
            _purpose: PhantomData,
        }
    }

    pub fn encrypt_with_nonce_ahead(
        &self,
        nonce: NonceGuard,
        plain: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.inner.encrypt_with_nonce_ahead(nonce, plain)
    }

    pub fn decrypt_with_nonce_ahead(&self, data: &[u8]) -> Result<(Nonce, Vec<u8>), CryptoError> {
        self.inner.decrypt_with_nonce_ahead(data)
    }
}

impl<P: KeyPurpose> fmt::Debug for PurposeBox<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PurposeBox({})", P::NAME)
    }
}

/// Path key: the public-key box factory answering the mediator challenge
pub struct DevicePathKey(SharedBoxFactory);

impl DevicePathKey {
    pub fn factory(&self) -> &SharedBoxFactory {
        &self.0
    }

    pub fn public_key(&self) -> [u8; KEY_LENGTH] {
        self.0.public_key()
    }
}

/// The five purpose-bound boxes, read-only after derivation
pub struct DeviceGroupBoxes {
    pub dgpk: DevicePathKey,
    pub dgrk: PurposeBox<Reflect>,
    pub dgdik: PurposeBox<DeviceInfo>,
    pub dgsddk: PurposeBox<SharedDeviceData>,
    pub dgtsk: PurposeBox<Transaction>,
}

impl fmt::Debug for DeviceGroupBoxes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceGroupBoxes").finish_non_exhaustive()
    }
}

/// Derive all device group keys, consuming `dgk`
pub fn derive_device_group_keys(dgk: DeviceGroupKey) -> Result<DeviceGroupBoxes, CryptoError> {
    let mut path_key = derive_key(&dgk, b"p");
    let dgpk = DevicePathKey(SharedBoxFactory::from_secret_bytes(*path_key));
    path_key.zeroize();

    let boxes = DeviceGroupBoxes {
        dgpk,
        dgrk: PurposeBox::derive(&dgk),
        dgdik: PurposeBox::derive(&dgk),
        dgsddk: PurposeBox::derive(&dgk),
        dgtsk: PurposeBox::derive(&dgk),
    };
    drop(dgk);
    debug!("Derived device group keys");
    Ok(boxes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::crypto::nonce::{NonceScope, NonceService};

    #[test]
    fn test_salts_produce_distinct_keys() {
        let dgk = DeviceGroupKey::new([9u8; KEY_LENGTH]);
        let salts: [&[u8]; 5] = [b"p", b"r", b"di", b"sdd", b"ts"];
        let keys: Vec<[u8; KEY_LENGTH]> = salts.iter().map(|s| *derive_key(&dgk, s)).collect();
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = DeviceGroupKey::new([1u8; KEY_LENGTH]);
        let b = DeviceGroupKey::new([1u8; KEY_LENGTH]);
        assert_eq!(*derive_key(&a, b"r"), *derive_key(&b, b"r"));
    }

    #[test]
    fn test_reflect_key_cannot_open_device_info() {
        let nonces = NonceService::new();
        let boxes = derive_device_group_keys(DeviceGroupKey::new([5u8; KEY_LENGTH])).unwrap();
        let sealed = boxes
            .dgdik
            .encrypt_with_nonce_ahead(nonces.next(NonceScope::D2d).unwrap(), b"label")
            .unwrap();

        assert!(boxes.dgrk.decrypt_with_nonce_ahead(&sealed).is_err());
        let (_, plain) = boxes.dgdik.decrypt_with_nonce_ahead(&sealed).unwrap();
        assert_eq!(plain, b"label");
    }
}
