//! Property-based tests for core types.

use proptest::prelude::*;

use crate::crypto::{hash, hash_all, Hash, PublicKey, SecretKey};

fn arb_bytes32() -> impl Strategy<Value = [u8; 32]> {
    prop::array::uniform32(any::<u8>())
}

fn arb_secret_key() -> impl Strategy<Value = SecretKey> {
    arb_bytes32().prop_map(|bytes| SecretKey::from_bytes(&bytes))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Hash hex roundtrip: from_hex(h.to_hex()) == h
    #[test]
    fn prop_hash_hex_roundtrip(bytes in arb_bytes32()) {
        let h = Hash::from_bytes(bytes);
        let restored = Hash::from_hex(&h.to_hex()).expect("hex roundtrip should succeed");
        prop_assert_eq!(h, restored);
    }

    /// Hashing is a function of content only.
    #[test]
    fn prop_hash_deterministic(data in prop::collection::vec(any::<u8>(), 0..256)) {
        prop_assert_eq!(hash(&data), hash(&data));
        prop_assert_eq!(hash(&data), hash_all(&[&data]));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Public keys survive bincode and hex.
    #[test]
    fn prop_public_key_roundtrip(key in arb_secret_key()) {
        let pk = key.public_key();
        let encoded = bincode::serialize(&pk).expect("serialize should succeed");
        let decoded: PublicKey = bincode::deserialize(&encoded).expect("deserialize should succeed");
        prop_assert_eq!(pk, decoded);
        prop_assert_eq!(PublicKey::from_hex(&pk.to_hex()).expect("hex"), pk);
    }

    /// A signature only verifies for the message it was made over.
    #[test]
    fn prop_sign_verify(
        key in arb_secret_key(),
        message in prop::collection::vec(any::<u8>(), 1..128),
    ) {
        let sig = key.sign(&message);
        prop_assert!(key.public_key().verify(&message, &sig).is_ok());

        let mut tampered = message.clone();
        tampered[0] ^= 0x01;
        prop_assert!(key.public_key().verify(&tampered, &sig).is_err());
    }
}
