//! Property-based tests for anchoring types.

use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey as BtcSecretKey};
use bitcoin::Txid;
use keel_core::SecretKey;
use proptest::prelude::*;

use crate::chain::ChainTracker;
use crate::config::{BitcoinNetwork, Config, ConfigStore};
use crate::funding::{FundingPool, FundingUtxo};
use crate::keys::{majority_count, AnchoringKeys, KeyRegistry, RedeemScript};
use crate::messages::{from_bytes, to_bytes, AddFunds, SignInput};
use crate::payload::Commitment;
use crate::proposal::build_proposal;
use crate::signature::{InputSignature, InputSigner, SignatureCollector};
use crate::testing::{config_for, funding_tx, validator_keys};

fn arb_btc_secret() -> impl Strategy<Value = BtcSecretKey> {
    prop::array::uniform32(1u8..=255).prop_filter_map("valid secp256k1 scalar", |bytes| {
        BtcSecretKey::from_slice(&bytes).ok()
    })
}

fn arb_keys(max: usize) -> impl Strategy<Value = Vec<AnchoringKeys>> {
    prop::collection::vec((prop::array::uniform32(any::<u8>()), arb_btc_secret()), 1..=max)
        .prop_map(|pairs| {
            let secp = Secp256k1::signing_only();
            pairs
                .into_iter()
                .map(|(service, bitcoin)| {
                    AnchoringKeys::new(
                        SecretKey::from_bytes(&service).public_key(),
                        bitcoin::PublicKey::new(bitcoin.public_key(&secp)),
                    )
                })
                .collect::<Vec<_>>()
        })
        .prop_filter("distinct keys", |keys: &Vec<AnchoringKeys>| {
            KeyRegistry::validate_key_set(keys).is_ok()
        })
}

fn arb_network() -> impl Strategy<Value = BitcoinNetwork> {
    prop_oneof![
        Just(BitcoinNetwork::Bitcoin),
        Just(BitcoinNetwork::Testnet),
        Just(BitcoinNetwork::Regtest),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// A majority is more than half and never more than everyone.
    #[test]
    fn prop_majority_count(n in 1usize..=20) {
        let m = majority_count(n);
        prop_assert!(2 * m > n);
        prop_assert!(2 * (m - 1) <= n);
        prop_assert!(m <= n);
    }

    /// The largest-first selection is the shortest prefix covering the target.
    #[test]
    fn prop_select_inputs_minimal(
        values in prop::collection::vec(1u64..1_000_000, 1..12),
        target in 1u64..5_000_000,
    ) {
        let mut pool = FundingPool::new();
        for (i, value) in values.iter().enumerate() {
            pool.insert(FundingUtxo {
                outpoint: bitcoin::OutPoint::new(Txid::from_byte_array([i as u8; 32]), 0),
                value: *value,
                epoch: 0,
            }).unwrap();
        }

        match pool.select_inputs(target) {
            Ok(selected) => {
                let total: u64 = selected.iter().map(|u| u.value).sum();
                prop_assert!(total >= target);
                let without_last: u64 = total - selected.last().unwrap().value;
                prop_assert!(without_last < target);
            }
            Err(_) => prop_assert!(pool.total_value() < target),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Address derivation is a function of network and ordered keys.
    #[test]
    fn prop_derive_address_deterministic(keys in arb_keys(6), network in arb_network()) {
        let config = Config::new(network, keys.clone());
        let a = KeyRegistry::derive_address(&config).unwrap();
        let b = KeyRegistry::derive_address(&Config::new(network, keys.clone())).unwrap();
        prop_assert_eq!(&a, &b);

        if keys.len() > 1 {
            let mut reversed = keys.clone();
            reversed.reverse();
            let c = KeyRegistry::derive_address(&Config::new(network, reversed)).unwrap();
            prop_assert_ne!(a, c);
        }
    }

    /// The redeem script threshold matches the key count.
    #[test]
    fn prop_redeem_script_quorum(keys in arb_keys(20)) {
        let bitcoin_keys: Vec<_> = keys.iter().map(|k| k.bitcoin_key).collect();
        let script = RedeemScript::from_keys(&bitcoin_keys).unwrap();
        prop_assert_eq!(script.quorum(), majority_count(keys.len()));
        for (i, key) in bitcoin_keys.iter().enumerate() {
            prop_assert_eq!(script.position(key), Some(i));
        }
    }

    /// Configs survive the wire.
    #[test]
    fn prop_config_roundtrip(
        keys in arb_keys(5),
        network in arb_network(),
        interval in 1u64..100_000,
        fee in 0u64..1_000,
    ) {
        let config = Config::new(network, keys).with_interval(interval).with_fee(fee);
        let decoded: Config = from_bytes(&to_bytes(&config).unwrap()).unwrap();
        prop_assert_eq!(decoded, config);
    }

    /// Sign-input messages survive the wire.
    #[test]
    fn prop_sign_input_roundtrip(
        secret in arb_btc_secret(),
        digest in prop::array::uniform32(any::<u8>()),
        txid in prop::array::uniform32(any::<u8>()),
        input in 0u32..64,
    ) {
        let secp = Secp256k1::signing_only();
        let signature = secp.sign_ecdsa(&Message::from_digest(digest), &secret);
        let msg = SignInput {
            txid: Txid::from_byte_array(txid),
            input,
            input_signature: InputSignature::new(signature),
        };
        let decoded: SignInput = from_bytes(&to_bytes(&msg).unwrap()).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    /// Funding messages survive the wire.
    #[test]
    fn prop_add_funds_roundtrip(keys in arb_keys(3), value in 1u64..21_000_000, nonce in any::<u8>()) {
        let address = Config::new(BitcoinNetwork::Regtest, keys).address().unwrap();
        let msg = AddFunds::new(funding_tx(&address, value, nonce));
        let decoded: AddFunds = from_bytes(&to_bytes(&msg).unwrap()).unwrap();
        prop_assert_eq!(decoded, msg);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// A proposal is complete exactly when every input holds a majority of
    /// its key set.
    #[test]
    fn prop_complete_iff_every_input_has_majority(
        n in 1usize..=5,
        masks in prop::collection::vec(prop::collection::vec(any::<bool>(), 5), 4),
    ) {
        let validators = validator_keys(n);
        let mut configs = ConfigStore::new();
        let epoch = configs.activate(config_for(&validators, 10), 0).unwrap().clone();
        let mut pool = FundingPool::new();
        for nonce in 1..=4u8 {
            pool.add_funds(&funding_tx(&epoch.address, 600, nonce), &epoch).unwrap();
        }
        let proposal = build_proposal(
            &configs,
            &ChainTracker::new(),
            &pool,
            Commitment::new(10, keel_core::hash(b"block 10")),
        )
        .unwrap();

        let script = configs.key_set(0).unwrap().redeem_script().clone();
        let signer = InputSigner::new();
        let mut collector = SignatureCollector::new(&proposal, &configs).unwrap();
        let mut expected = true;

        for (index, input) in proposal.inputs.iter().enumerate() {
            let mask = &masks[index % masks.len()];
            let mut count = 0;
            for (v, validator) in validators.iter().enumerate() {
                if !mask[v] {
                    continue;
                }
                let input_signature = signer
                    .sign_input(&proposal.transaction, index, &script, input.value, &validator.bitcoin)
                    .unwrap();
                let msg = SignInput {
                    txid: proposal.txid(),
                    input: index as u32,
                    input_signature,
                };
                collector.submit(&msg, &validator.keys).unwrap();
                count += 1;
            }
            expected &= count >= majority_count(n);
        }

        prop_assert_eq!(collector.is_complete(), expected);
    }
}
