//! A simulated validator network for integration tests.

#![allow(dead_code)]

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::SecretKey as BtcSecretKey;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, Transaction, TxIn, TxOut, Txid};
use keel_anchor::{
    AddFunds, AnchoringNode, BitcoinNetwork, Config, Effects, Envelope, LocalSigner,
    NodeSettings, Result,
};
use keel_core::{Hash, SecretKey};

pub fn signers(n: usize) -> Vec<LocalSigner> {
    (0..n)
        .map(|_| {
            LocalSigner::new(
                SecretKey::generate(),
                BtcSecretKey::new(&mut bitcoin::secp256k1::rand::thread_rng()),
            )
        })
        .collect()
}

pub fn config_for(signers: &[LocalSigner], interval: u64) -> Config {
    Config::new(
        BitcoinNetwork::Regtest,
        signers.iter().map(|s| s.keys().clone()).collect(),
    )
    .with_interval(interval)
    .with_fee(1)
}

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

pub fn block_hash(height: u64) -> Hash {
    keel_core::hash(&height.to_le_bytes())
}

/// Every validator's node, fed the same host events.
pub struct Network {
    pub signers: Vec<LocalSigner>,
    pub nodes: Vec<AnchoringNode>,
}

impl Network {
    pub fn new(n: usize, interval: u64) -> Self {
        let signers = signers(n);
        let config = config_for(&signers, interval);
        let nodes = signers
            .iter()
            .map(|s| {
                AnchoringNode::with_genesis(
                    NodeSettings::default().with_funding_confirmations(1),
                    Some(s.clone()),
                    config.clone(),
                )
                .unwrap()
            })
            .collect();
        Self { signers, nodes }
    }

    pub fn address(&self) -> Address {
        self.nodes[0]
            .configs()
            .current_epoch()
            .unwrap()
            .address
            .clone()
    }

    /// Fund the current address on every node.
    pub fn fund(&mut self, value: u64, nonce: u8) -> Transaction {
        let tx = funding_tx(&self.address(), value, nonce);
        for node in &mut self.nodes {
            node.on_add_funds(&AddFunds::new(tx.clone()), 1).unwrap();
        }
        tx
    }

    /// Deliver a block to every node.
    pub fn block(&mut self, height: u64) -> Vec<Effects> {
        self.nodes
            .iter_mut()
            .map(|node| node.on_block(height, block_hash(height)).unwrap())
            .collect()
    }

    /// Deliver a config change to every node.
    pub fn reconfigure(&mut self, config: Config, height: u64) -> Vec<Effects> {
        self.nodes
            .iter_mut()
            .map(|node| node.on_config_change(config.clone(), height).unwrap())
            .collect()
    }

    pub fn deliver_to(&mut self, to: usize, envelope: &Envelope) -> Result<Effects> {
        self.nodes[to].on_envelope(envelope, 1)
    }

    /// Deliver every broadcast in `effects` to every other node, returning
    /// what each delivery produced.
    pub fn gossip(&mut self, effects: &[Effects]) -> Vec<Effects> {
        let mut produced = Vec::new();
        for (from, fx) in effects.iter().enumerate() {
            for envelope in &fx.broadcast {
                for to in 0..self.nodes.len() {
                    if to != from {
                        produced.push(self.deliver_to(to, envelope).unwrap());
                    }
                }
            }
        }
        produced
    }
}
