//! Validator fixtures for tests.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{Secp256k1, SecretKey as BtcSecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, Transaction, TxIn, TxOut, Txid};
use keel_core::SecretKey;

use crate::config::{BitcoinNetwork, Config};
use crate::keys::AnchoringKeys;
use crate::node::LocalSigner;

/// A validator with its private keys.
pub struct TestValidator {
    /// Service key.
    pub service: SecretKey,
    /// Bitcoin key.
    pub bitcoin: BtcSecretKey,
    /// Public halves.
    pub keys: AnchoringKeys,
}

impl TestValidator {
    /// Signer holding this validator's keys.
    pub fn signer(&self) -> LocalSigner {
        LocalSigner::new(self.service.clone(), self.bitcoin)
    }
}

/// `n` validators with random keys.
pub fn validator_keys(n: usize) -> Vec<TestValidator> {
    let secp = Secp256k1::signing_only();
    (0..n)
        .map(|_| {
            let service = SecretKey::generate();
            let bitcoin = BtcSecretKey::new(&mut bitcoin::secp256k1::rand::thread_rng());
            let keys = AnchoringKeys::new(
                service.public_key(),
                bitcoin::PublicKey::new(bitcoin.public_key(&secp)),
            );
            TestValidator {
                service,
                bitcoin,
                keys,
            }
        })
        .collect()
}

/// Regtest config over `validators` with a 1 sat/vB fee.
pub fn config_for(validators: &[TestValidator], interval: u64) -> Config {
    Config::new(
        BitcoinNetwork::Regtest,
        validators.iter().map(|v| v.keys.clone()).collect(),
    )
    .with_interval(interval)
    .with_fee(1)
}

/// A transaction paying `value` to `address`, spending a fake outpoint
/// derived from `nonce`.
pub fn funding_tx(address: &Address, value: u64, nonce: u8) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array([nonce; 32]), 0),
            ..Default::default()
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: address.script_pubkey(),
        }],
    }
}
