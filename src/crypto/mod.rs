//! # Cryptographic Building Blocks
//!
//! - **Boxes**: XChaCha20-Poly1305 secret boxes and X25519 shared boxes
//! - **Nonce**: scoped nonce reservation, prevents reuse instead of detecting it
//! - **Device group**: purpose-bound keys derived from the device group key
//!
//! ## Security
//! - Randomness comes from the operating system (getrandom)
//! - Secret key material is zeroized on drop

pub mod boxes;
pub mod device_group;
pub mod nonce;

use crate::error::CryptoError;

pub use boxes::{SecretBox, SharedBox, SharedBoxFactory};
pub use device_group::{derive_device_group_keys, DeviceGroupBoxes, DeviceGroupKey};
pub use nonce::{Nonce, NonceGuard, NonceScope, NonceService};

/// Fill an array from the operating system RNG
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut bytes = [0u8; N];
    getrandom::fill(&mut bytes).map_err(|e| CryptoError::RandomSource(e.to_string()))?;
    Ok(bytes)
}
