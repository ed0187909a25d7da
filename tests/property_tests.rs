//! Property-based tests using proptest
//!
//! Wire invariants that must hold for any input: flag bytes, E2E padding,
//! identity validation and the nonce-ahead box layout.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use mdev_protocol::crypto::{derive_device_group_keys, DeviceGroupKey, NonceScope, NonceService};
use mdev_protocol::protocol::e2e::E2eMessage;
use mdev_protocol::protocol::flags::CspMessageFlags;
use mdev_protocol::types::Identity;
use proptest::prelude::*;

const KNOWN_FLAG_BITS: u8 = 0x01 | 0x02 | 0x04 | 0x10 | 0x20 | 0x80;

// Property: decoding a flag byte keeps exactly the defined bits
proptest! {
    #[test]
    fn prop_flag_byte_keeps_known_bits(bitmask in any::<u8>()) {
        let flags = CspMessageFlags::from_bitmask(bitmask);
        prop_assert_eq!(flags.to_bitmask(), bitmask & KNOWN_FLAG_BITS);
        prop_assert_eq!(CspMessageFlags::from_bitmask(flags.to_bitmask()), flags);
    }
}

// Property: padded text survives and always reaches the minimum length
proptest! {
    #[test]
    fn prop_padded_text(text in ".{0,300}") {
        let message = E2eMessage::Text(text);
        let padded = message.encode_padded();
        prop_assert!(padded.len() >= 32);
        prop_assert_eq!(E2eMessage::decode_padded(&padded).unwrap(), message);
    }
}

// Property: arbitrary plaintext is rejected or decoded, never a panic
proptest! {
    #[test]
    fn prop_decode_padded_total(data in prop::collection::vec(any::<u8>(), 0..128)) {
        let _ = E2eMessage::decode_padded(&data);
    }
}

// Property: identities accept exactly alphanumerics and '*'
proptest! {
    #[test]
    fn prop_identity_validation(bytes in any::<[u8; 8]>()) {
        let valid = bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'*');
        let parsed = Identity::from_bytes(bytes);
        prop_assert_eq!(parsed.is_ok(), valid);
        if let Ok(identity) = parsed {
            prop_assert_eq!(identity.as_str().parse::<Identity>().unwrap(), identity);
        }
    }
}

// Property: the same device group key always opens what it sealed
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn prop_device_group_derivation_is_stable(
        key in any::<[u8; 32]>(),
        plain in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let sealing = derive_device_group_keys(DeviceGroupKey::new(key)).unwrap();
        let opening = derive_device_group_keys(DeviceGroupKey::new(key)).unwrap();
        let nonces = NonceService::new();

        let sealed = sealing
            .dgrk
            .encrypt_with_nonce_ahead(nonces.next(NonceScope::D2d).unwrap(), &plain)
            .unwrap();
        let (nonce, opened) = opening.dgrk.decrypt_with_nonce_ahead(&sealed).unwrap();
        prop_assert_eq!(opened, plain);
        prop_assert_eq!(&sealed[..24], &nonce.as_bytes()[..]);
        prop_assert_eq!(sealing.dgpk.public_key(), opening.dgpk.public_key());
    }
}
